//! Task payload documents
//!
//! Payloads are JSON with an optional `version` field. Anything that fails
//! to decode or validate is an invalid payload and fails the task for good.

use crate::error::{invalid_payload, AppResult};
use crate::models::DatabaseLabel;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Highest payload version this runner understands
pub const PAYLOAD_VERSION: u32 = 1;

/// Payload of a `database.create` task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseCreatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[validate(length(min = 1, max = 64, message = "Database name must be between 1 and 64 characters"))]
    pub database_name: String,
    #[validate(range(min = 1, message = "Project id must be positive"))]
    pub project_id: i32,
    /// Initial schema version label; a timestamp is used when empty
    #[serde(default)]
    pub schema_version: String,
    #[serde(default)]
    pub character_set: String,
    #[serde(default)]
    pub collation: String,
    #[serde(default)]
    pub labels: Vec<DatabaseLabel>,
    pub statement: String,
}

/// Payload of a `database.schema.update` task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SchemaUpdatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default)]
    pub schema_version: String,
    #[serde(default)]
    #[validate(length(max = 1024, message = "Description must be at most 1024 characters"))]
    pub description: String,
    pub statement: String,
}

/// Payloads that carry an optional document version
pub trait Versioned {
    fn payload_version(&self) -> Option<u32>;
}

impl Versioned for DatabaseCreatePayload {
    fn payload_version(&self) -> Option<u32> {
        self.version
    }
}

impl Versioned for SchemaUpdatePayload {
    fn payload_version(&self) -> Option<u32> {
        self.version
    }
}

pub fn decode<T>(raw: &str) -> AppResult<T>
where
    T: DeserializeOwned + Validate + Versioned,
{
    let payload: T = serde_json::from_str(raw).map_err(|e| invalid_payload(format!("malformed task payload: {}", e)))?;
    if let Some(version) = payload.payload_version() {
        if version > PAYLOAD_VERSION {
            return Err(invalid_payload(format!(
                "unsupported payload version {} (max {})",
                version, PAYLOAD_VERSION
            )));
        }
    }
    payload.validate().map_err(|e| invalid_payload(e.to_string()))?;
    Ok(payload)
}
