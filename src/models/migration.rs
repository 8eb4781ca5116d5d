//! Migration history models

use crate::error::{driver_error, AppError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who initiated the migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationSource {
    Ui,
    Vcs,
    Libraries,
}

impl MigrationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationSource::Ui => "UI",
            MigrationSource::Vcs => "VCS",
            MigrationSource::Libraries => "LIBRARIES",
        }
    }
}

/// Baseline records mark the initial state; the rest are incremental
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationType {
    Baseline,
    Migrate,
    Data,
}

impl MigrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationType::Baseline => "BASELINE",
            MigrationType::Migrate => "MIGRATE",
            MigrationType::Data => "DATA",
        }
    }

    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value {
            "BASELINE" => Ok(MigrationType::Baseline),
            "MIGRATE" => Ok(MigrationType::Migrate),
            "DATA" => Ok(MigrationType::Data),
            other => Err(driver_error(format!("unknown migration type {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatus {
    Pending,
    Done,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "PENDING",
            MigrationStatus::Done => "DONE",
            MigrationStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value {
            "PENDING" => Ok(MigrationStatus::Pending),
            "DONE" => Ok(MigrationStatus::Done),
            "FAILED" => Ok(MigrationStatus::Failed),
            other => Err(driver_error(format!("unknown migration status {:?}", other))),
        }
    }
}

/// Descriptor attached to one migration-history record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationInfo {
    pub release_version: String,
    pub version: String,
    /// Database name the record is scoped to
    pub namespace: String,
    pub database: String,
    pub environment: String,
    pub source: MigrationSource,
    pub migration_type: MigrationType,
    pub description: String,
    /// Empty when the principal could not be resolved
    pub creator: String,
    /// Empty when the originating issue could not be resolved
    pub issue_id: String,
    pub create_database: bool,
    pub force: bool,
}

/// Append-only migration-history entry as read back from a driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub id: i64,
    pub namespace: String,
    pub version: String,
    pub migration_type: MigrationType,
    pub status: MigrationStatus,
    pub statement: String,
    pub creator: String,
    pub issue_id: String,
    pub created_at: DateTime<Utc>,
    pub execution_duration_ns: i64,
}

/// Returned by a successful migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationOutcome {
    pub migration_id: i64,
    pub version: String,
}
