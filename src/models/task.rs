//! Task models shared by the scheduler, executors and the store

use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of pipeline work, one executor per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    #[serde(rename = "database.create")]
    DatabaseCreate,
    #[serde(rename = "database.schema.update")]
    SchemaUpdate,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::DatabaseCreate => "database.create",
            TaskType::SchemaUpdate => "database.schema.update",
        }
    }

    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value {
            "database.create" => Ok(TaskType::DatabaseCreate),
            "database.schema.update" => Ok(TaskType::SchemaUpdate),
            other => Err(AppError::Internal(format!("unknown task type {:?}", other))),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted task lifecycle. Terminal states never go back to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Result<Self, AppError> {
        match value {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" => Ok(TaskStatus::Running),
            "DONE" => Ok(TaskStatus::Done),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(AppError::Internal(format!("unknown task status {:?}", other))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

/// One unit of pipeline work
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: i32,
    pub pipeline_id: i32,
    pub instance_id: i32,
    /// Unset for database creation until the executor links the new row
    pub database_id: Option<i32>,
    pub name: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// Type-specific JSON document, decoded by the executor
    pub payload: String,
    pub creator_id: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskRunResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Insert request for a task
#[derive(Debug, Clone)]
pub struct TaskCreate {
    pub pipeline_id: i32,
    pub instance_id: i32,
    pub database_id: Option<i32>,
    pub name: String,
    pub task_type: TaskType,
    pub payload: String,
    pub creator_id: i32,
}

/// Partial update of a task row
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub id: i32,
    pub updater_id: i32,
    pub database_id: Option<i32>,
}

/// Terminal outcome written back by the scheduler
#[derive(Debug, Clone)]
pub enum TaskCompletion {
    Succeeded(TaskRunResult),
    Failed(String),
}

/// Structured result of a successful run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunResult {
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration_id: Option<i64>,
    pub version: String,
}

/// Transient, best-effort progress of a long-running task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total_unit: i64,
    pub completed_unit: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}
