//! `database.create` executor
//!
//! Runs the creation statement as a forced baseline migration, then makes
//! sure exactly one database row exists for `(instance, name)` and that it
//! belongs to the requested project. The schema syncer may discover the new
//! database and register it under the default project at any point during
//! this; the store's uniqueness on `(instance, name)` decides who inserts and
//! the loser patches the project instead of inserting.

use super::payload::{self, DatabaseCreatePayload};
use super::{resolve_lineage, Attempt, CompletionFlag, ExecutorContext};
use crate::driver::{cancellable, release};
use crate::error::{invalid_payload, AppError, AppResult};
use crate::migration;
use crate::models::{
    assignable_labels, Database, DatabaseCreate, DatabaseFind, DatabasePatch, Instance, Task, TaskPatch,
    TaskRunResult,
};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

#[derive(Debug, Default)]
pub struct DatabaseCreateExecutor {
    pub(crate) completed: CompletionFlag,
}

impl DatabaseCreateExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) async fn run_once(&self, ctx: &ExecutorContext, task: &Task, cancel: &CancellationToken) -> Attempt {
        match self.run(ctx, task, cancel).await {
            Ok(result) => Attempt::Succeeded(result),
            Err(e) => {
                warn!(task_id = task.id, error = %e, "database create failed");
                Attempt::Failed(e)
            }
        }
    }

    #[instrument(skip_all, fields(task_id = task.id))]
    async fn run(&self, ctx: &ExecutorContext, task: &Task, cancel: &CancellationToken) -> AppResult<TaskRunResult> {
        let payload: DatabaseCreatePayload = payload::decode(&task.payload)?;
        if payload.statement.trim().is_empty() {
            return Err(invalid_payload("empty create database statement"));
        }

        let instance = ctx
            .store
            .find_instance(task.instance_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("instance {} not found", task.instance_id)))?;
        ctx.store
            .find_project(payload.project_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("project {} not found", payload.project_id)))?;

        let version = if payload.schema_version.trim().is_empty() {
            migration::default_version(Utc::now())
        } else {
            payload.schema_version.clone()
        };
        let mut info = migration::baseline_for_create(
            &ctx.release_version,
            &payload.database_name,
            &instance.environment_name,
            &version,
        );
        (info.creator, info.issue_id) = resolve_lineage(ctx, task, ctx.require_issue_lineage).await?;

        let mut driver = cancellable(cancel, ctx.drivers.open(&instance, None)).await?;
        let outcome = migration::execute(driver.as_ref(), &info, &payload.statement, cancel).await;
        release(driver.as_mut()).await;
        let outcome = outcome?;
        info!(
            database = %payload.database_name,
            migration_id = outcome.migration_id,
            "database created"
        );

        // The database exists on the server from here on; the store must
        // reflect it and the task must point at it.
        let database = link_database(ctx, &instance, task, &payload, &outcome.version).await?;
        ctx.store
            .patch_task(&TaskPatch {
                id: task.id,
                updater_id: task.creator_id,
                database_id: Some(database.id),
            })
            .await?;

        let labels = assignable_labels(&payload.labels);
        if !labels.is_empty() {
            if let Err(e) = ctx.store.set_database_labels(database.id, &labels, task.creator_id).await {
                warn!(database_id = database.id, error = %e, "failed to apply database labels");
            }
        }

        Ok(TaskRunResult {
            detail: format!(
                "Created database {:?} on instance {:?}",
                payload.database_name, instance.name
            ),
            migration_id: Some(outcome.migration_id),
            version: outcome.version,
        })
    }
}

/// Find-or-create the database row and hand it to the requested project.
/// A row found here (or created concurrently) only has its project changed.
async fn link_database(
    ctx: &ExecutorContext,
    instance: &Instance,
    task: &Task,
    payload: &DatabaseCreatePayload,
    version: &str,
) -> AppResult<Database> {
    let find = DatabaseFind {
        instance_id: instance.id,
        name: payload.database_name.clone(),
    };
    if let Some(existing) = ctx.store.find_database(&find).await? {
        return claim(ctx, existing, task, payload.project_id).await;
    }

    let create = DatabaseCreate {
        creator_id: task.creator_id,
        project_id: payload.project_id,
        instance_id: instance.id,
        environment_id: instance.environment_id,
        name: payload.database_name.clone(),
        character_set: payload.character_set.clone(),
        collation: payload.collation.clone(),
        schema_version: version.to_string(),
    };
    match ctx.store.create_database(&create).await {
        Ok(database) => Ok(database),
        Err(AppError::Conflict(_)) => {
            let existing = ctx.store.find_database(&find).await?.ok_or_else(|| {
                AppError::Internal(format!(
                    "database {:?} conflicted but cannot be found",
                    payload.database_name
                ))
            })?;
            claim(ctx, existing, task, payload.project_id).await
        }
        Err(e) => Err(e),
    }
}

async fn claim(ctx: &ExecutorContext, existing: Database, task: &Task, project_id: i32) -> AppResult<Database> {
    if existing.project_id == project_id {
        return Ok(existing);
    }
    let mut patch = DatabasePatch::new(existing.id, task.creator_id);
    patch.project_id = Some(project_id);
    ctx.store.patch_database(&patch).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatabaseLabel, MigrationType, TaskType, DEFAULT_PROJECT_ID, SYSTEM_BOT_ID};
    use crate::store::Store;
    use crate::sync::SchemaSyncer;
    use crate::task::testing::{harness, Harness};
    use crate::task::TaskExecutor;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn payload(name: &str, project_id: i32, statement: &str) -> serde_json::Value {
        json!({
            "databaseName": name,
            "projectId": project_id,
            "schemaVersion": "0001",
            "characterSet": "UTF8",
            "collation": "en_US.UTF-8",
            "statement": statement,
        })
    }

    async fn run(h: &Harness, task: &Task) -> (TaskExecutor, Attempt) {
        let executor = TaskExecutor::DatabaseCreate(DatabaseCreateExecutor::new());
        assert!(!executor.is_completed());
        let attempt = executor.run_once(&h.ctx, task, &CancellationToken::new()).await;
        (executor, attempt)
    }

    #[tokio::test]
    async fn test_creates_row_and_links_task() {
        let h = harness().await;
        let project = h.store.insert_project("Payments", "PAY").await;
        let task = h
            .task(TaskType::DatabaseCreate, None, payload("app", project.id, "CREATE DATABASE app;"))
            .await;

        let (executor, attempt) = run(&h, &task).await;
        let result = match attempt {
            Attempt::Succeeded(result) => result,
            other => panic!("unexpected attempt {:?}", other),
        };
        assert!(executor.is_completed());
        assert_eq!(result.version, "0001");

        let history = h.server.history_for("app");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].migration_type, MigrationType::Baseline);
        assert_eq!(Some(history[0].id), result.migration_id);
        assert_eq!(history[0].creator, "SchemaFlow Bot");

        let dbs = h.store.list_databases(h.instance.id).await.unwrap();
        assert_eq!(dbs.len(), 1);
        assert_eq!(dbs[0].project_id, project.id);
        assert_eq!(dbs[0].environment_id, h.instance.environment_id);
        let task = h.store.find_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.database_id, Some(dbs[0].id));
        assert_eq!(h.server.opened.load(Ordering::SeqCst), 1);
        assert_eq!(h.server.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blank_statement_writes_nothing() {
        let h = harness().await;
        let task = h
            .task(TaskType::DatabaseCreate, None, payload("app", DEFAULT_PROJECT_ID, "  \n\t "))
            .await;

        let (executor, attempt) = run(&h, &task).await;
        assert!(attempt.terminated());
        assert!(matches!(attempt, Attempt::Failed(AppError::InvalidPayload(_))));
        assert!(executor.is_completed());

        assert!(h.server.history_for("app").is_empty());
        assert!(h.store.list_databases(h.instance.id).await.unwrap().is_empty());
        assert_eq!(h.store.find_task(task.id).await.unwrap().unwrap().database_id, None);
        assert_eq!(h.server.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_terminal() {
        let h = harness().await;
        let task = h.task(TaskType::DatabaseCreate, None, json!({"databaseName": 7})).await;
        let (executor, attempt) = run(&h, &task).await;
        assert!(matches!(attempt, Attempt::Failed(AppError::InvalidPayload(_))));
        assert!(executor.is_completed());
    }

    #[tokio::test]
    async fn test_row_discovered_by_sync_is_reassigned() {
        let h = harness().await;
        let project = h.store.insert_project("Payments", "PAY").await;
        let discovered = h
            .store
            .create_database(&DatabaseCreate {
                creator_id: SYSTEM_BOT_ID,
                project_id: DEFAULT_PROJECT_ID,
                instance_id: h.instance.id,
                environment_id: h.instance.environment_id,
                name: "app".to_string(),
                character_set: "LATIN1".to_string(),
                collation: "C".to_string(),
                schema_version: String::new(),
            })
            .await
            .unwrap();
        let task = h
            .task(TaskType::DatabaseCreate, None, payload("app", project.id, "CREATE DATABASE app"))
            .await;

        let (_, attempt) = run(&h, &task).await;
        assert!(matches!(attempt, Attempt::Succeeded(_)));

        let dbs = h.store.list_databases(h.instance.id).await.unwrap();
        assert_eq!(dbs.len(), 1);
        assert_eq!(dbs[0].id, discovered.id);
        assert_eq!(dbs[0].project_id, project.id);
        // Attributes discovered by sync stay as they were
        assert_eq!(dbs[0].character_set, "LATIN1");
        assert_eq!(dbs[0].collation, "C");
        let task = h.store.find_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.database_id, Some(discovered.id));
    }

    #[tokio::test]
    async fn test_insert_losing_race_patches_project() {
        let h = harness().await;
        let project = h.store.insert_project("Payments", "PAY").await;
        *h.store.race_on_create.lock().unwrap() = Some(DEFAULT_PROJECT_ID);
        let task = h
            .task(TaskType::DatabaseCreate, None, payload("app", project.id, "CREATE DATABASE app"))
            .await;

        let (_, attempt) = run(&h, &task).await;
        assert!(matches!(attempt, Attempt::Succeeded(_)));
        let dbs = h.store.list_databases(h.instance.id).await.unwrap();
        assert_eq!(dbs.len(), 1);
        assert_eq!(dbs[0].project_id, project.id);
        assert_eq!(dbs[0].character_set, "SYNC");
    }

    #[tokio::test]
    async fn test_concurrent_sync_never_duplicates() {
        for _ in 0..20 {
            let h = harness().await;
            *h.server.migration_delay.lock().unwrap() = Some(Duration::from_millis(2));
            let project = h.store.insert_project("Payments", "PAY").await;
            let task = h
                .task(TaskType::DatabaseCreate, None, payload("app", project.id, "CREATE DATABASE app"))
                .await;
            let syncer = SchemaSyncer::new(h.store.clone(), h.ctx.drivers.clone(), Duration::from_secs(60));
            let executor = TaskExecutor::DatabaseCreate(DatabaseCreateExecutor::new());
            let cancel = CancellationToken::new();

            let sync_loop = async {
                for _ in 0..10 {
                    syncer.sync_instance(&h.instance, &cancel).await.unwrap();
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            };
            let (attempt, _) = tokio::join!(executor.run_once(&h.ctx, &task, &cancel), sync_loop);
            assert!(matches!(attempt, Attempt::Succeeded(_)));

            let dbs = h.store.list_databases(h.instance.id).await.unwrap();
            assert_eq!(dbs.len(), 1);
            assert_eq!(dbs[0].project_id, project.id);
        }
    }

    #[tokio::test]
    async fn test_migration_failure_is_terminal_and_releases_driver() {
        let h = harness().await;
        *h.server.fail_migration.lock().unwrap() = Some("permission denied to create database".to_string());
        let task = h
            .task(TaskType::DatabaseCreate, None, payload("app", DEFAULT_PROJECT_ID, "CREATE DATABASE app"))
            .await;

        let (executor, attempt) = run(&h, &task).await;
        match attempt {
            Attempt::Failed(e) => assert!(e.to_string().contains("permission denied")),
            other => panic!("unexpected attempt {:?}", other),
        }
        assert!(executor.is_completed());
        assert!(h.store.list_databases(h.instance.id).await.unwrap().is_empty());
        assert_eq!(h.server.opened.load(Ordering::SeqCst), h.server.released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancelled_run_fails_and_releases_driver() {
        let h = harness().await;
        *h.server.migration_delay.lock().unwrap() = Some(Duration::from_secs(30));
        let task = h
            .task(TaskType::DatabaseCreate, None, payload("app", DEFAULT_PROJECT_ID, "CREATE DATABASE app"))
            .await;
        let executor = TaskExecutor::DatabaseCreate(DatabaseCreateExecutor::new());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let attempt = executor.run_once(&h.ctx, &task, &cancel).await;
        assert!(matches!(attempt, Attempt::Failed(AppError::Cancelled)));
        assert!(executor.is_completed());
        assert_eq!(h.server.opened.load(Ordering::SeqCst), 1);
        assert_eq!(h.server.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_labels_skip_environment_key() {
        let h = harness().await;
        let mut body = payload("app", DEFAULT_PROJECT_ID, "CREATE DATABASE app");
        body["labels"] = json!([
            {"key": "environment", "value": "dev"},
            {"key": "tenant", "value": "acme"}
        ]);
        let task = h.task(TaskType::DatabaseCreate, None, body).await;

        let (_, attempt) = run(&h, &task).await;
        assert!(matches!(attempt, Attempt::Succeeded(_)));
        let db = h.store.list_databases(h.instance.id).await.unwrap().remove(0);
        assert_eq!(
            db.labels,
            vec![DatabaseLabel {
                key: "tenant".to_string(),
                value: "acme".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_unknown_project_fails_before_any_write() {
        let h = harness().await;
        let task = h
            .task(TaskType::DatabaseCreate, None, payload("app", 42, "CREATE DATABASE app"))
            .await;
        let (_, attempt) = run(&h, &task).await;
        assert!(matches!(attempt, Attempt::Failed(AppError::NotFound(_))));
        assert!(h.server.history_for("app").is_empty());
    }

    #[tokio::test]
    async fn test_required_lineage_blocks_creation() {
        let mut h = harness().await;
        h.ctx.require_issue_lineage = true;
        let task = h
            .task(TaskType::DatabaseCreate, None, payload("app", DEFAULT_PROJECT_ID, "CREATE DATABASE app"))
            .await;
        let (_, attempt) = run(&h, &task).await;
        assert!(matches!(attempt, Attempt::Failed(AppError::NotFound(_))));
        assert!(h.server.history_for("app").is_empty());

        let issue = h.store.insert_issue(task.pipeline_id, DEFAULT_PROJECT_ID, "Create app").await;
        let (_, attempt) = run(&h, &task).await;
        assert!(matches!(attempt, Attempt::Succeeded(_)));
        assert_eq!(h.server.history_for("app")[0].issue_id, issue.id.to_string());
    }
}
