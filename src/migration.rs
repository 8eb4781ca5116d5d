//! Migration executor
//!
//! Applies one statement through a driver under exactly one
//! migration-history record. Baseline (database creation) and incremental
//! migrations share the path; they differ in the creation flag and in the
//! history pre-check each driver runs through [`precheck`].

use crate::driver::{cancellable, Driver};
use crate::error::{AppError, AppResult};
use crate::models::{
    MigrationInfo, MigrationOutcome, MigrationRecord, MigrationSource, MigrationStatus, MigrationType,
};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Version recorded when a task does not name one
pub fn default_version(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

/// Descriptor for the forced baseline written when a database is created
pub fn baseline_for_create(
    release_version: &str,
    database: &str,
    environment: &str,
    version: &str,
) -> MigrationInfo {
    MigrationInfo {
        release_version: release_version.to_string(),
        version: version.to_string(),
        namespace: database.to_string(),
        database: database.to_string(),
        environment: environment.to_string(),
        source: MigrationSource::Ui,
        migration_type: MigrationType::Baseline,
        description: "Create database".to_string(),
        creator: String::new(),
        issue_id: String::new(),
        create_database: true,
        force: true,
    }
}

/// Descriptor for an incremental change to an existing database
pub fn incremental(
    release_version: &str,
    database: &str,
    environment: &str,
    version: &str,
    description: &str,
) -> MigrationInfo {
    MigrationInfo {
        release_version: release_version.to_string(),
        version: version.to_string(),
        namespace: database.to_string(),
        database: database.to_string(),
        environment: environment.to_string(),
        source: MigrationSource::Ui,
        migration_type: MigrationType::Migrate,
        description: description.to_string(),
        creator: String::new(),
        issue_id: String::new(),
        create_database: false,
        force: false,
    }
}

/// Decide whether `info` may be recorded on top of `history` (the
/// namespace's existing records).
///
/// - a `PENDING` record always blocks: another migration is in flight
/// - forced records skip the version checks
/// - a non-forced baseline is refused once a `DONE` baseline exists
/// - an incremental migration needs every `DONE` version to be older
pub fn precheck(history: &[MigrationRecord], info: &MigrationInfo) -> AppResult<()> {
    if let Some(pending) = history.iter().find(|r| r.status == MigrationStatus::Pending) {
        return Err(AppError::Conflict(format!(
            "database {:?} has a pending migration (id {}, version {:?}); wait for it to finish",
            info.namespace, pending.id, pending.version
        )));
    }
    if info.force {
        return Ok(());
    }

    let done = history.iter().filter(|r| r.status == MigrationStatus::Done);
    match info.migration_type {
        MigrationType::Baseline => {
            if done.clone().any(|r| r.migration_type == MigrationType::Baseline) {
                return Err(AppError::Conflict(format!(
                    "database {:?} already has a baseline migration",
                    info.namespace
                )));
            }
        }
        MigrationType::Migrate | MigrationType::Data => {
            if let Some(newer) = done.filter(|r| r.version >= info.version).max_by(|a, b| a.version.cmp(&b.version)) {
                return Err(AppError::Validation(format!(
                    "database {:?} has already applied version {:?}, which is newer than or equal to {:?}",
                    info.namespace, newer.version, info.version
                )));
            }
        }
    }
    Ok(())
}

fn validate(info: &MigrationInfo, statement: &str) -> AppResult<()> {
    if statement.trim().is_empty() {
        return Err(AppError::InvalidPayload("empty migration statement".to_string()));
    }
    if info.namespace.trim().is_empty() {
        return Err(AppError::InvalidPayload("migration namespace is required".to_string()));
    }
    if info.version.trim().is_empty() {
        return Err(AppError::InvalidPayload("migration version is required".to_string()));
    }
    if info.create_database && info.migration_type != MigrationType::Baseline {
        return Err(AppError::InvalidPayload(
            "database creation must be recorded as a baseline".to_string(),
        ));
    }
    Ok(())
}

/// Run `statement` through `driver`, recording it as described by `info`.
///
/// Cancellation interrupts the wait, not the server: whatever the driver
/// already committed, history included, stays committed.
#[instrument(skip_all, fields(namespace = %info.namespace, version = %info.version, kind = info.migration_type.as_str()))]
pub async fn execute(
    driver: &dyn Driver,
    info: &MigrationInfo,
    statement: &str,
    cancel: &CancellationToken,
) -> AppResult<MigrationOutcome> {
    validate(info, statement)?;
    debug!(create_database = info.create_database, force = info.force, "executing migration");
    let outcome = cancellable(cancel, driver.execute_migration(info, statement.trim())).await?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeServer;
    use crate::models::{ConnectionConfig, Engine, TlsConfig};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn record(version: &str, migration_type: MigrationType, status: MigrationStatus) -> MigrationRecord {
        MigrationRecord {
            id: 1,
            namespace: "app".to_string(),
            version: version.to_string(),
            migration_type,
            status,
            statement: "SELECT 1".to_string(),
            creator: String::new(),
            issue_id: String::new(),
            created_at: Utc::now(),
            execution_duration_ns: 0,
        }
    }

    fn fake_config() -> ConnectionConfig {
        ConnectionConfig {
            engine: Engine::Postgres,
            host: "localhost".to_string(),
            port: 5432,
            username: "postgres".to_string(),
            password: String::new(),
            database: None,
            tls: TlsConfig::default(),
        }
    }

    #[test]
    fn test_default_version_is_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(default_version(at), "20240309070501");
    }

    #[test]
    fn test_baseline_descriptor_is_forced_creation() {
        let info = baseline_for_create("2.0.0", "app", "prod", "v1");
        assert_eq!(info.migration_type, MigrationType::Baseline);
        assert_eq!(info.namespace, "app");
        assert_eq!(info.description, "Create database");
        assert!(info.create_database && info.force);
    }

    #[test]
    fn test_precheck_pending_blocks_even_forced() {
        let history = vec![record("v1", MigrationType::Migrate, MigrationStatus::Pending)];
        let info = baseline_for_create("2.0.0", "app", "prod", "v2");
        assert!(matches!(precheck(&history, &info), Err(AppError::Conflict(_))));
    }

    #[test]
    fn test_precheck_incremental_versions() {
        let history = vec![
            record("0001", MigrationType::Baseline, MigrationStatus::Done),
            record("0003", MigrationType::Migrate, MigrationStatus::Failed),
        ];
        assert!(precheck(&history, &incremental("2.0.0", "app", "prod", "0002", "add index")).is_ok());
        assert!(matches!(
            precheck(&history, &incremental("2.0.0", "app", "prod", "0001", "again")),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_precheck_duplicate_baseline() {
        let history = vec![record("0001", MigrationType::Baseline, MigrationStatus::Done)];
        let mut info = baseline_for_create("2.0.0", "app", "prod", "0002");
        info.force = false;
        assert!(matches!(precheck(&history, &info), Err(AppError::Conflict(_))));
        info.force = true;
        assert!(precheck(&history, &info).is_ok());
    }

    #[tokio::test]
    async fn test_execute_rejects_blank_statement() {
        let server = FakeServer::new();
        let registry = server.registry();
        let driver = registry.open_config(&fake_config()).await.unwrap();
        let info = baseline_for_create("2.0.0", "app", "prod", "v1");

        let res = execute(driver.as_ref(), &info, " \n\t", &CancellationToken::new()).await;
        assert!(matches!(res, Err(AppError::InvalidPayload(_))));
        assert!(server.history_for("app").is_empty());
    }

    #[tokio::test]
    async fn test_execute_records_one_baseline() {
        let server = FakeServer::new();
        let registry = server.registry();
        let driver = registry.open_config(&fake_config()).await.unwrap();
        let info = baseline_for_create("2.0.0", "app", "prod", "v1");

        let outcome = execute(driver.as_ref(), &info, "CREATE DATABASE app;", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.version, "v1");

        let history = server.history_for("app");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, outcome.migration_id);
        assert_eq!(history[0].migration_type, MigrationType::Baseline);
        assert_eq!(history[0].statement, "CREATE DATABASE app;");
    }
}
