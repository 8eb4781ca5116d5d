//! Task executor framework
//!
//! Every task kind is one variant of [`TaskExecutor`]. The scheduler drives an
//! executor with [`TaskExecutor::run_once`] until an attempt terminates;
//! status readers on other tasks poll [`TaskExecutor::is_completed`] and
//! [`TaskExecutor::progress`] without blocking.

pub mod database_create;
pub mod payload;
pub mod scheduler;
pub mod schema_update;

pub use database_create::DatabaseCreateExecutor;
pub use scheduler::Scheduler;
pub use schema_update::SchemaUpdateExecutor;

use crate::driver::DriverRegistry;
use crate::error::{AppError, AppResult};
use crate::models::{Progress, Task, TaskRunResult, TaskType};
use crate::store::Store;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Outcome of one `run_once` call
#[derive(Debug)]
pub enum Attempt {
    Succeeded(TaskRunResult),
    /// Terminal; the error text is surfaced to the pipeline verbatim
    Failed(AppError),
    /// Not finished; invoke again later
    Pending,
}

impl Attempt {
    pub fn terminated(&self) -> bool {
        !matches!(self, Attempt::Pending)
    }
}

/// Shared collaborators handed to every executor
pub struct ExecutorContext {
    pub store: Arc<dyn Store>,
    pub drivers: Arc<DriverRegistry>,
    /// Recorded on every migration-history row
    pub release_version: String,
    /// Fail database creation when the originating issue cannot be found
    pub require_issue_lineage: bool,
    /// Longest a schema update waits on another migration's PENDING record
    pub pending_migration_timeout: Duration,
}

/// Set-once completion marker, readable from any thread
#[derive(Debug, Default)]
pub struct CompletionFlag(AtomicBool);

impl CompletionFlag {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Arm a guard that sets the flag when dropped, whichever way the
    /// attempt exits.
    fn guard(&self) -> CompletionGuard<'_> {
        CompletionGuard { flag: self, armed: true }
    }
}

struct CompletionGuard<'a> {
    flag: &'a CompletionFlag,
    armed: bool,
}

impl CompletionGuard<'_> {
    /// The attempt did not terminate; leave the flag alone
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.flag.0.store(true, Ordering::Release);
        }
    }
}

/// Wrap one attempt so the completion flag is set unless it reports
/// `Pending`. Dropping the future mid-attempt also counts as completion.
async fn guarded<F>(flag: &CompletionFlag, attempt: F) -> Attempt
where
    F: std::future::Future<Output = Attempt>,
{
    let guard = flag.guard();
    let attempt = attempt.await;
    if !attempt.terminated() {
        guard.disarm();
    }
    attempt
}

/// Closed set of executors, one per task type
pub enum TaskExecutor {
    DatabaseCreate(DatabaseCreateExecutor),
    SchemaUpdate(SchemaUpdateExecutor),
}

impl TaskExecutor {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskExecutor::DatabaseCreate(_) => TaskType::DatabaseCreate,
            TaskExecutor::SchemaUpdate(_) => TaskType::SchemaUpdate,
        }
    }

    /// One execution attempt. Never call again after a terminated attempt.
    pub async fn run_once(&self, ctx: &ExecutorContext, task: &Task, cancel: &CancellationToken) -> Attempt {
        match self {
            TaskExecutor::DatabaseCreate(e) => guarded(&e.completed, e.run_once(ctx, task, cancel)).await,
            TaskExecutor::SchemaUpdate(e) => guarded(&e.completed, e.run_once(ctx, task, cancel)).await,
        }
    }

    /// Whether an attempt has terminated, regardless of outcome
    pub fn is_completed(&self) -> bool {
        match self {
            TaskExecutor::DatabaseCreate(e) => e.completed.is_set(),
            TaskExecutor::SchemaUpdate(e) => e.completed.is_set(),
        }
    }

    pub fn progress(&self) -> Progress {
        match self {
            TaskExecutor::DatabaseCreate(_) => Progress::default(),
            TaskExecutor::SchemaUpdate(e) => e.progress(),
        }
    }
}

type Constructor = fn() -> TaskExecutor;

/// Task type -> executor constructor
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    constructors: HashMap<TaskType, Constructor>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(TaskType::DatabaseCreate, || {
            TaskExecutor::DatabaseCreate(DatabaseCreateExecutor::new())
        });
        registry.register(TaskType::SchemaUpdate, || {
            TaskExecutor::SchemaUpdate(SchemaUpdateExecutor::new())
        });
        registry
    }

    pub fn register(&mut self, task_type: TaskType, constructor: Constructor) {
        self.constructors.insert(task_type, constructor);
    }

    /// A fresh executor for one task
    pub fn create(&self, task_type: TaskType) -> AppResult<TaskExecutor> {
        self.constructors
            .get(&task_type)
            .map(|constructor| constructor())
            .ok_or_else(|| AppError::Internal(format!("no executor registered for {}", task_type)))
    }
}

/// Principal name and issue id for the history record.
///
/// Both are best effort: a missing principal or issue leaves the field
/// empty. A missing issue fails only when `required` is set.
pub(crate) async fn resolve_lineage(ctx: &ExecutorContext, task: &Task, required: bool) -> AppResult<(String, String)> {
    let creator = match ctx.store.find_principal(task.creator_id).await {
        Ok(Some(principal)) => principal.name,
        Ok(None) => {
            warn!(task_id = task.id, principal_id = task.creator_id, "task creator not found");
            String::new()
        }
        Err(e) => {
            warn!(task_id = task.id, error = %e, "failed to look up task creator");
            String::new()
        }
    };

    let issue_id = match ctx.store.find_issue_by_pipeline(task.pipeline_id).await {
        Ok(Some(issue)) => issue.id.to_string(),
        Ok(None) if required => {
            return Err(AppError::NotFound(format!(
                "no issue found for pipeline {}",
                task.pipeline_id
            )))
        }
        Ok(None) => {
            warn!(task_id = task.id, pipeline_id = task.pipeline_id, "originating issue not found");
            String::new()
        }
        Err(e) if required => return Err(e),
        Err(e) => {
            warn!(task_id = task.id, error = %e, "failed to look up originating issue");
            String::new()
        }
    };

    Ok((creator, issue_id))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::driver::fake::FakeServer;
    use crate::models::{ConnectionConfig, Instance, InstanceCreate, TaskCreate};
    use crate::store::MemoryStore;

    pub struct Harness {
        pub server: Arc<FakeServer>,
        pub store: Arc<MemoryStore>,
        pub ctx: ExecutorContext,
        pub instance: Instance,
    }

    pub async fn harness() -> Harness {
        let server = FakeServer::new();
        let store = Arc::new(MemoryStore::new());
        let instance = store
            .create_instance(&InstanceCreate {
                name: "prod-pg".to_string(),
                environment_id: 2,
                environment_name: "prod".to_string(),
                connection: ConnectionConfig::from_url("postgres://admin:secret@db:5432").unwrap(),
            })
            .await
            .unwrap();
        let ctx = ExecutorContext {
            store: store.clone(),
            drivers: server.registry(),
            release_version: "2.0.0".to_string(),
            require_issue_lineage: false,
            pending_migration_timeout: Duration::from_secs(60),
        };
        Harness {
            server,
            store,
            ctx,
            instance,
        }
    }

    impl Harness {
        pub async fn task(&self, task_type: TaskType, database_id: Option<i32>, payload: serde_json::Value) -> Task {
            self.store
                .create_task(&TaskCreate {
                    pipeline_id: 11,
                    instance_id: self.instance.id,
                    database_id,
                    name: format!("{} task", task_type),
                    task_type,
                    payload: payload.to_string(),
                    creator_id: crate::models::SYSTEM_BOT_ID,
                })
                .await
                .unwrap()
        }
    }
}
