//! Migration history in `<metadata database>.public.migration_history`

use crate::driver::quote_ident;
use crate::error::AppResult;
use crate::models::{MigrationInfo, MigrationRecord, MigrationStatus, MigrationType};
use std::sync::Arc;
use std::time::Instant;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Row};
use tracing::{info, warn};

const CREATE_HISTORY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS migration_history (
    id BIGSERIAL PRIMARY KEY,
    created_by TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    release_version TEXT NOT NULL,
    namespace TEXT NOT NULL,
    sequence BIGINT NOT NULL CHECK (sequence >= 0),
    source TEXT NOT NULL,
    type TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('PENDING', 'DONE', 'FAILED')),
    version TEXT NOT NULL,
    description TEXT NOT NULL,
    statement TEXT NOT NULL,
    execution_duration_ns BIGINT NOT NULL DEFAULT 0,
    issue_id TEXT NOT NULL,
    payload JSONB NOT NULL DEFAULT '{}',
    UNIQUE (namespace, sequence)
);
CREATE INDEX IF NOT EXISTS idx_migration_history_namespace_version ON migration_history (namespace, version);
"#;

/// Create the metadata database if it does not exist yet
pub(super) async fn ensure_metadata_database(admin: &Client, name: &str) -> AppResult<()> {
    let exists = admin
        .query_opt("SELECT 1 FROM pg_database WHERE datname = $1", &[&name])
        .await?
        .is_some();
    if exists {
        return Ok(());
    }

    match admin.batch_execute(&format!("CREATE DATABASE {}", quote_ident(name))).await {
        Ok(()) => {
            info!(database = name, "created metadata database");
            Ok(())
        }
        // Another runner won the race
        Err(e) if matches!(e.code(), Some(c) if *c == SqlState::DUPLICATE_DATABASE || *c == SqlState::UNIQUE_VIOLATION) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub(super) async fn ensure_history_table(meta: &Client) -> AppResult<()> {
    meta.batch_execute(CREATE_HISTORY_TABLE).await?;
    Ok(())
}

pub(super) async fn list(meta: &Client, namespace: &str) -> AppResult<Vec<MigrationRecord>> {
    let rows = meta
        .query(
            "SELECT id, namespace, version, type, status, statement, created_by, issue_id,
                    created_at, execution_duration_ns
             FROM migration_history
             WHERE namespace = $1
             ORDER BY sequence",
            &[&namespace],
        )
        .await?;
    rows.iter().map(record_from_row).collect()
}

fn record_from_row(row: &Row) -> AppResult<MigrationRecord> {
    Ok(MigrationRecord {
        id: row.get("id"),
        namespace: row.get("namespace"),
        version: row.get("version"),
        migration_type: MigrationType::parse(row.get("type"))?,
        status: MigrationStatus::parse(row.get("status"))?,
        statement: row.get("statement"),
        creator: row.get("created_by"),
        issue_id: row.get("issue_id"),
        created_at: row.get("created_at"),
        execution_duration_ns: row.get("execution_duration_ns"),
    })
}

/// A `PENDING` history row that must end up `DONE` or `FAILED`.
///
/// If the guard is dropped unsettled (the caller stopped awaiting), the final
/// status is written from a spawned task.
pub(super) struct PendingMigration {
    meta: Arc<Client>,
    id: i64,
    started: Instant,
    applied: bool,
    settled: bool,
}

impl PendingMigration {
    pub(super) async fn begin(meta: Arc<Client>, info: &MigrationInfo, statement: &str) -> AppResult<Self> {
        let payload = serde_json::json!({
            "database": info.database,
            "environment": info.environment,
            "createDatabase": info.create_database,
            "force": info.force,
        });
        let row = meta
            .query_one(
                "INSERT INTO migration_history (
                    created_by, release_version, namespace, sequence, source, type, status,
                    version, description, statement, issue_id, payload
                 )
                 VALUES (
                    $1, $2, $3,
                    (SELECT COALESCE(MAX(sequence), 0) + 1 FROM migration_history WHERE namespace = $3),
                    $4, $5, 'PENDING', $6, $7, $8, $9, $10
                 )
                 RETURNING id",
                &[
                    &info.creator,
                    &info.release_version,
                    &info.namespace,
                    &info.source.as_str(),
                    &info.migration_type.as_str(),
                    &info.version,
                    &info.description,
                    &statement,
                    &info.issue_id,
                    &payload,
                ],
            )
            .await?;

        Ok(Self {
            meta,
            id: row.get(0),
            started: Instant::now(),
            applied: false,
            settled: false,
        })
    }

    pub(super) fn id(&self) -> i64 {
        self.id
    }

    /// Record the outcome of the statement
    pub(super) async fn finish(mut self, applied: bool) -> AppResult<()> {
        self.applied = applied;
        let status = self.final_status();
        set_status(&self.meta, self.id, status, self.elapsed_ns()).await?;
        self.settled = true;
        Ok(())
    }

    fn final_status(&self) -> MigrationStatus {
        if self.applied {
            MigrationStatus::Done
        } else {
            MigrationStatus::Failed
        }
    }

    fn elapsed_ns(&self) -> i64 {
        self.started.elapsed().as_nanos() as i64
    }
}

impl Drop for PendingMigration {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let meta = self.meta.clone();
        let id = self.id;
        let status = self.final_status();
        let elapsed = self.elapsed_ns();
        warn!(migration_id = id, status = status.as_str(), "migration interrupted; settling history record");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = set_status(&meta, id, status, elapsed).await {
                    warn!(migration_id = id, error = %e, "failed to settle migration history record");
                }
            });
        }
    }
}

async fn set_status(meta: &Client, id: i64, status: MigrationStatus, elapsed_ns: i64) -> AppResult<()> {
    meta.execute(
        "UPDATE migration_history
         SET status = $1, execution_duration_ns = $2, updated_at = now()
         WHERE id = $3",
        &[&status.as_str(), &elapsed_ns, &id],
    )
    .await?;
    Ok(())
}
