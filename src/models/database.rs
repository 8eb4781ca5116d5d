//! Database-related models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Project that owns databases discovered by sync before anyone claims them
pub const DEFAULT_PROJECT_ID: i32 = 1;

/// Principal used for rows written by the runner itself
pub const SYSTEM_BOT_ID: i32 = 1;

/// Label key derived from the instance; immutable at the database level
pub const ENVIRONMENT_LABEL_KEY: &str = "environment";

/// A named schema-bearing unit inside an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Database {
    pub id: i32,
    pub instance_id: i32,
    pub project_id: i32,
    pub environment_id: i32,
    pub name: String,
    pub character_set: String,
    pub collation: String,
    pub schema_version: String,
    pub creator_id: i32,
    pub updater_id: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: Vec<DatabaseLabel>,
}

/// Key/value label attached to a database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct DatabaseLabel {
    #[validate(length(min = 1, max = 63, message = "Label key must be between 1 and 63 characters"))]
    pub key: String,
    #[validate(length(max = 63, message = "Label value must be at most 63 characters"))]
    pub value: String,
}

/// Lookup by natural key (instance, name)
#[derive(Debug, Clone)]
pub struct DatabaseFind {
    pub instance_id: i32,
    pub name: String,
}

/// Insert request for a database row
#[derive(Debug, Clone)]
pub struct DatabaseCreate {
    pub creator_id: i32,
    pub project_id: i32,
    pub instance_id: i32,
    pub environment_id: i32,
    pub name: String,
    pub character_set: String,
    pub collation: String,
    pub schema_version: String,
}

/// Partial update of a database row; `None` fields are left untouched
#[derive(Debug, Clone, Default)]
pub struct DatabasePatch {
    pub id: i32,
    pub updater_id: i32,
    pub project_id: Option<i32>,
    pub character_set: Option<String>,
    pub collation: Option<String>,
    pub schema_version: Option<String>,
    pub last_successful_sync_at: Option<DateTime<Utc>>,
}

impl DatabasePatch {
    pub fn new(id: i32, updater_id: i32) -> Self {
        Self {
            id,
            updater_id,
            ..Default::default()
        }
    }
}

/// Drop the environment label and anything failing validation
pub fn assignable_labels(labels: &[DatabaseLabel]) -> Vec<DatabaseLabel> {
    labels
        .iter()
        .filter(|l| l.key != ENVIRONMENT_LABEL_KEY)
        .filter(|l| l.validate().is_ok())
        .cloned()
        .collect()
}
