//! Projects, principals and issues referenced by tasks

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: i32,
    pub name: String,
    pub key: String,
}

/// A user or bot that creates tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub id: i32,
    pub name: String,
    pub email: String,
}

/// The issue a pipeline belongs to; used only for audit lineage here
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub id: i32,
    pub pipeline_id: i32,
    pub project_id: i32,
    pub name: String,
}
