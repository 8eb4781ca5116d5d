//! Store layer
//!
//! Narrow repository interface over the runner's own metadata: instances,
//! databases, tasks, projects, principals, issues and the latest schema
//! snapshot per database. Every lookup returns `Ok(None)` for a missing row;
//! callers decide whether that is fatal.
//!
//! `(instance_id, name)` is unique for databases in every implementation, so
//! two creators racing on the same database are serialized by the store
//! itself: the loser gets [`AppError::Conflict`](crate::error::AppError::Conflict).

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::AppResult;
use crate::models::{
    Database, DatabaseCreate, DatabaseFind, DatabaseLabel, DatabasePatch, Instance, InstanceCreate, Issue,
    Principal, Project, Task, TaskCompletion, TaskCreate, TaskPatch, TaskStatus,
};
use crate::schema::SchemaSnapshot;
use async_trait::async_trait;

#[async_trait]
pub trait Store: Send + Sync {
    async fn find_instance(&self, id: i32) -> AppResult<Option<Instance>>;
    async fn create_instance(&self, create: &InstanceCreate) -> AppResult<Instance>;
    async fn list_instances(&self) -> AppResult<Vec<Instance>>;

    async fn find_database(&self, find: &DatabaseFind) -> AppResult<Option<Database>>;
    async fn get_database(&self, id: i32) -> AppResult<Option<Database>>;
    /// Fails with `Conflict` when `(instance_id, name)` already exists
    async fn create_database(&self, create: &DatabaseCreate) -> AppResult<Database>;
    /// Only the `Some` fields of `patch` are written
    async fn patch_database(&self, patch: &DatabasePatch) -> AppResult<Database>;
    async fn list_databases(&self, instance_id: i32) -> AppResult<Vec<Database>>;
    /// Replace the database's labels with `labels`
    async fn set_database_labels(&self, database_id: i32, labels: &[DatabaseLabel], updater_id: i32) -> AppResult<()>;

    async fn find_project(&self, id: i32) -> AppResult<Option<Project>>;
    async fn find_principal(&self, id: i32) -> AppResult<Option<Principal>>;
    async fn find_issue_by_pipeline(&self, pipeline_id: i32) -> AppResult<Option<Issue>>;

    async fn create_task(&self, create: &TaskCreate) -> AppResult<Task>;
    async fn find_task(&self, id: i32) -> AppResult<Option<Task>>;
    async fn patch_task(&self, patch: &TaskPatch) -> AppResult<Task>;
    async fn list_tasks(&self, status: Option<TaskStatus>) -> AppResult<Vec<Task>>;
    /// `PENDING -> RUNNING`; `None` if the task was not pending (someone
    /// else claimed it, or it is already terminal)
    async fn claim_task(&self, id: i32) -> AppResult<Option<Task>>;
    /// `RUNNING -> DONE | FAILED`
    async fn complete_task(&self, id: i32, completion: &TaskCompletion) -> AppResult<Task>;

    /// Replace the stored snapshot for `database_id`
    async fn save_schema(&self, database_id: i32, snapshot: &SchemaSnapshot) -> AppResult<()>;
    async fn find_schema(&self, database_id: i32) -> AppResult<Option<SchemaSnapshot>>;
}

impl TaskCompletion {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskCompletion::Succeeded(_) => TaskStatus::Done,
            TaskCompletion::Failed(_) => TaskStatus::Failed,
        }
    }
}
