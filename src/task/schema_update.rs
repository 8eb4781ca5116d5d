//! `database.schema.update` executor: one incremental migration against a
//! database the task already references

use super::payload::{self, SchemaUpdatePayload};
use super::{resolve_lineage, Attempt, CompletionFlag, ExecutorContext};
use crate::driver::{cancellable, release};
use crate::error::{invalid_payload, AppError, AppResult};
use crate::migration;
use crate::models::{DatabasePatch, Progress, Task, TaskRunResult};
use chrono::Utc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

#[derive(Debug, Default)]
pub struct SchemaUpdateExecutor {
    pub(crate) completed: CompletionFlag,
    progress: Mutex<Progress>,
    /// When the first attempt found another migration in flight
    blocked_since: Mutex<Option<Instant>>,
}

impl SchemaUpdateExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress(&self) -> Progress {
        self.progress.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn record_progress(&self, completed_unit: i64, comment: &str) {
        if let Ok(mut progress) = self.progress.lock() {
            let now = Utc::now();
            progress.total_unit = 1;
            progress.completed_unit = progress.completed_unit.max(completed_unit);
            progress.created_at.get_or_insert(now);
            progress.updated_at = Some(now);
            progress.comment = Some(comment.to_string());
        }
    }

    fn blocked_for(&self) -> Duration {
        match self.blocked_since.lock() {
            Ok(mut since) => since.get_or_insert_with(Instant::now).elapsed(),
            Err(_) => Duration::ZERO,
        }
    }

    pub(super) async fn run_once(&self, ctx: &ExecutorContext, task: &Task, cancel: &CancellationToken) -> Attempt {
        match self.run(ctx, task, cancel).await {
            Ok(result) => Attempt::Succeeded(result),
            // Another migration on this database is still PENDING
            Err(AppError::Conflict(msg)) => {
                let waited = self.blocked_for();
                if waited > ctx.pending_migration_timeout {
                    warn!(task_id = task.id, waited_secs = waited.as_secs(), reason = %msg, "gave up waiting for in-flight migration");
                    return Attempt::Failed(AppError::Conflict(format!(
                        "{}; still pending after {}s, settle the record before retrying",
                        msg,
                        waited.as_secs()
                    )));
                }
                info!(task_id = task.id, reason = %msg, "waiting for in-flight migration");
                self.record_progress(0, "Waiting for an in-flight migration");
                Attempt::Pending
            }
            Err(e) => {
                warn!(task_id = task.id, error = %e, "schema update failed");
                Attempt::Failed(e)
            }
        }
    }

    #[instrument(skip_all, fields(task_id = task.id))]
    async fn run(&self, ctx: &ExecutorContext, task: &Task, cancel: &CancellationToken) -> AppResult<TaskRunResult> {
        let payload: SchemaUpdatePayload = payload::decode(&task.payload)?;
        if payload.statement.trim().is_empty() {
            return Err(invalid_payload("empty migration statement"));
        }
        let database_id = task
            .database_id
            .ok_or_else(|| invalid_payload("schema update task does not reference a database"))?;

        let database = ctx
            .store
            .get_database(database_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("database {} not found", database_id)))?;
        let instance = ctx
            .store
            .find_instance(database.instance_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("instance {} not found", database.instance_id)))?;

        let version = if payload.schema_version.trim().is_empty() {
            migration::default_version(Utc::now())
        } else {
            payload.schema_version.clone()
        };
        let description = if payload.description.trim().is_empty() {
            format!("Update schema of {}", database.name)
        } else {
            payload.description.clone()
        };
        let mut info = migration::incremental(
            &ctx.release_version,
            &database.name,
            &instance.environment_name,
            &version,
            &description,
        );
        (info.creator, info.issue_id) = resolve_lineage(ctx, task, false).await?;

        self.record_progress(0, "Applying migration");
        let mut driver = cancellable(cancel, ctx.drivers.open(&instance, Some(&database.name))).await?;
        let outcome = migration::execute(driver.as_ref(), &info, &payload.statement, cancel).await;
        release(driver.as_mut()).await;
        let outcome = outcome?;
        self.record_progress(1, "Migration applied");

        let mut patch = DatabasePatch::new(database.id, task.creator_id);
        patch.schema_version = Some(outcome.version.clone());
        ctx.store.patch_database(&patch).await?;

        Ok(TaskRunResult {
            detail: format!("Applied migration {} to database {:?}", outcome.version, database.name),
            migration_id: Some(outcome.migration_id),
            version: outcome.version,
        })
    }
}
