//! MySQL driver
//!
//! Built on a small `sqlx` pool with no default database selected. Catalog
//! reads filter `information_schema` by `TABLE_SCHEMA`, so one pool serves
//! instance and database sync alike.

mod sync;

use super::{quote_ident_mysql, visible_databases, Driver, DriverFactory};
use crate::error::{not_found_error, AppError, AppResult};
use crate::migration::precheck;
use crate::models::{
    ConnectionConfig, Engine, MigrationInfo, MigrationOutcome, MigrationRecord, MigrationStatus, MigrationType,
};
use crate::schema::{InstanceMeta, SchemaSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::{ConnectOptions, Connection, Row};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Connection pool timeout
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

const SYSTEM_DATABASES: &[&str] = &[
    "mysql",
    "information_schema",
    "performance_schema",
    "sys",
    "rdsadmin",
    "cloudsql",
    "cloudsqladmin",
];

pub struct MySqlDriverFactory {
    metadata_database: String,
}

impl MySqlDriverFactory {
    pub fn new(metadata_database: &str) -> Self {
        Self {
            metadata_database: metadata_database.to_string(),
        }
    }
}

#[async_trait]
impl DriverFactory for MySqlDriverFactory {
    fn engine(&self) -> Engine {
        Engine::Mysql
    }

    async fn open(&self, config: &ConnectionConfig) -> AppResult<Box<dyn Driver>> {
        let options = connect_options(config, config.database.as_deref());
        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(POOL_CONNECTION_TIMEOUT)
            .connect_with(options)
            .await?;

        // Test connection
        sqlx::query("SELECT 1").fetch_one(&pool).await?;

        Ok(Box::new(MySqlDriver {
            config: config.clone(),
            metadata_database: self.metadata_database.clone(),
            pool,
        }))
    }
}

fn connect_options(config: &ConnectionConfig, database: Option<&str>) -> MySqlConnectOptions {
    let mut options = MySqlConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.username)
        .password(&config.password);
    if let Some(database) = database {
        options = options.database(database);
    }

    if !config.tls.enabled {
        return options.ssl_mode(MySqlSslMode::Preferred);
    }
    options = match &config.tls.ssl_ca {
        Some(ca) => options.ssl_mode(MySqlSslMode::VerifyCa).ssl_ca(ca),
        None => options.ssl_mode(MySqlSslMode::Required),
    };
    if let (Some(cert), Some(key)) = (&config.tls.ssl_cert, &config.tls.ssl_key) {
        options = options.ssl_client_cert(cert).ssl_client_key(key);
    }
    options
}

fn denylist(metadata_database: &str) -> Vec<&str> {
    let mut list = SYSTEM_DATABASES.to_vec();
    list.push(metadata_database);
    list
}

pub struct MySqlDriver {
    config: ConnectionConfig,
    metadata_database: String,
    pool: MySqlPool,
}

impl MySqlDriver {
    fn history_table(&self) -> String {
        format!("{}.migration_history", quote_ident_mysql(&self.metadata_database))
    }

    async fn ensure_history_table(&self) -> AppResult<()> {
        let create_database = format!(
            "CREATE DATABASE IF NOT EXISTS {}",
            quote_ident_mysql(&self.metadata_database)
        );
        sqlx::raw_sql(&create_database).execute(&self.pool).await?;

        let create_table = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id BIGINT AUTO_INCREMENT PRIMARY KEY,
                created_by TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
                release_version VARCHAR(256) NOT NULL,
                namespace VARCHAR(256) NOT NULL,
                `sequence` BIGINT NOT NULL,
                `source` VARCHAR(32) NOT NULL,
                `type` VARCHAR(32) NOT NULL,
                `status` VARCHAR(32) NOT NULL,
                version VARCHAR(256) NOT NULL,
                description TEXT NOT NULL,
                statement LONGTEXT NOT NULL,
                execution_duration_ns BIGINT NOT NULL DEFAULT 0,
                issue_id VARCHAR(256) NOT NULL,
                payload TEXT NOT NULL,
                UNIQUE KEY uk_migration_history_namespace_sequence (namespace, `sequence`),
                KEY idx_migration_history_namespace_version (namespace, version)
            )",
            self.history_table()
        );
        sqlx::raw_sql(&create_table).execute(&self.pool).await?;
        Ok(())
    }

    async fn history(&self, namespace: &str) -> AppResult<Vec<MigrationRecord>> {
        let query = format!(
            "SELECT id, namespace, version, `type`, `status`, statement, created_by, issue_id,
                    created_at, execution_duration_ns
             FROM {}
             WHERE namespace = ?
             ORDER BY `sequence`",
            self.history_table()
        );
        let rows: Vec<MySqlRow> = sqlx::query(&query).bind(namespace).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn insert_pending(&self, info: &MigrationInfo, statement: &str) -> AppResult<PendingMigration> {
        let payload = serde_json::json!({
            "database": info.database,
            "environment": info.environment,
            "createDatabase": info.create_database,
            "force": info.force,
        })
        .to_string();
        let table = self.history_table();
        let query = format!(
            "INSERT INTO {table} (
                created_by, release_version, namespace, `sequence`, `source`, `type`, `status`,
                version, description, statement, issue_id, payload
             )
             SELECT ?, ?, ?, COALESCE(MAX(`sequence`), 0) + 1, ?, ?, 'PENDING', ?, ?, ?, ?, ?
             FROM {table} WHERE namespace = ?"
        );
        let result = sqlx::query(&query)
            .bind(&info.creator)
            .bind(&info.release_version)
            .bind(&info.namespace)
            .bind(info.source.as_str())
            .bind(info.migration_type.as_str())
            .bind(&info.version)
            .bind(&info.description)
            .bind(statement)
            .bind(&info.issue_id)
            .bind(&payload)
            .bind(&info.namespace)
            .execute(&self.pool)
            .await?;
        Ok(PendingMigration {
            pool: self.pool.clone(),
            table,
            id: result.last_insert_id() as i64,
            started: Instant::now(),
            settled: false,
        })
    }

    /// Run a script in one transaction on the namespace database
    async fn execute_in_database(&self, database: &str, statement: &str) -> AppResult<()> {
        let mut conn = connect_options(&self.config, Some(database)).connect().await?;
        let mut tx = conn.begin().await?;
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(statement)).await?;
        tx.commit().await?;
        conn.close().await?;
        Ok(())
    }
}

/// A `PENDING` history row that must end up `DONE` or `FAILED`; settled
/// from a spawned task when dropped unsettled.
struct PendingMigration {
    pool: MySqlPool,
    table: String,
    id: i64,
    started: Instant,
    settled: bool,
}

impl PendingMigration {
    async fn finish(mut self, status: MigrationStatus) -> AppResult<()> {
        set_status(&self.pool, &self.table, self.id, status, elapsed_ns(self.started)).await?;
        self.settled = true;
        Ok(())
    }
}

impl Drop for PendingMigration {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let (pool, table, id) = (self.pool.clone(), self.table.clone(), self.id);
        let elapsed = elapsed_ns(self.started);
        warn!(migration_id = id, "migration interrupted; marking history record failed");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = set_status(&pool, &table, id, MigrationStatus::Failed, elapsed).await {
                    warn!(migration_id = id, error = %e, "failed to settle migration history record");
                }
            });
        }
    }
}

fn elapsed_ns(started: Instant) -> i64 {
    started.elapsed().as_nanos() as i64
}

async fn set_status(pool: &MySqlPool, table: &str, id: i64, status: MigrationStatus, elapsed_ns: i64) -> AppResult<()> {
    let query = format!("UPDATE {} SET `status` = ?, execution_duration_ns = ? WHERE id = ?", table);
    sqlx::query(&query)
        .bind(status.as_str())
        .bind(elapsed_ns)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

fn record_from_row(row: &MySqlRow) -> AppResult<MigrationRecord> {
    let migration_type: String = row.try_get("type")?;
    let status: String = row.try_get("status")?;
    Ok(MigrationRecord {
        id: row.try_get("id")?,
        namespace: row.try_get("namespace")?,
        version: row.try_get("version")?,
        migration_type: MigrationType::parse(&migration_type)?,
        status: MigrationStatus::parse(&status)?,
        statement: row.try_get("statement")?,
        creator: row.try_get("created_by")?,
        issue_id: row.try_get("issue_id")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        execution_duration_ns: row.try_get("execution_duration_ns")?,
    })
}

#[async_trait]
impl Driver for MySqlDriver {
    fn engine(&self) -> Engine {
        Engine::Mysql
    }

    async fn execute(&self, statement: &str) -> AppResult<u64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(statement)).await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn execute_migration(&self, info: &MigrationInfo, statement: &str) -> AppResult<MigrationOutcome> {
        self.ensure_history_table().await?;
        precheck(&self.history(&info.namespace).await?, info)?;

        let pending = self.insert_pending(info, statement).await?;
        let id = pending.id;
        debug!(migration_id = id, namespace = %info.namespace, "migration started");

        let applied = if info.create_database {
            sqlx::Executor::execute(&self.pool, sqlx::raw_sql(statement))
                .await
                .map(|_| ())
                .map_err(AppError::from)
        } else {
            self.execute_in_database(&info.namespace, statement).await
        };

        match applied {
            Ok(()) => {
                pending.finish(MigrationStatus::Done).await?;
                info!(migration_id = id, namespace = %info.namespace, version = %info.version, "migration applied");
                Ok(MigrationOutcome {
                    migration_id: id,
                    version: info.version.clone(),
                })
            }
            Err(e) => {
                if let Err(mark_err) = pending.finish(MigrationStatus::Failed).await {
                    warn!(migration_id = id, error = %mark_err, "failed to mark migration as failed");
                }
                Err(e)
            }
        }
    }

    async fn sync_instance(&self) -> AppResult<InstanceMeta> {
        let version = sync::server_version(&self.pool).await?;
        let users = sync::users(&self.pool).await?;
        let databases = visible_databases(sync::databases(&self.pool).await?, &denylist(&self.metadata_database));
        Ok(InstanceMeta {
            version,
            users,
            databases,
        })
    }

    async fn sync_database_schema(&self, database: &str) -> AppResult<SchemaSnapshot> {
        let meta = sync::databases(&self.pool)
            .await?
            .into_iter()
            .find(|db| db.name == database)
            .ok_or_else(|| not_found_error(format!("database {:?} not found", database)))?;

        let mut conn = self.pool.acquire().await?;
        // Applies to the next transaction only
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *conn)
            .await?;
        // Rolled back on drop if any query below fails
        let mut tx = conn.begin().await?;
        let snapshot = sync::snapshot(&mut tx, meta).await?;
        tx.commit().await?;
        Ok(snapshot)
    }

    async fn close(&mut self) -> AppResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TlsConfig;

    fn config(tls: TlsConfig) -> ConnectionConfig {
        ConnectionConfig {
            engine: Engine::Mysql,
            host: "db.internal".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: "secret".to_string(),
            database: None,
            tls,
        }
    }

    #[test]
    fn test_denylist() {
        let list = denylist("schemaflow");
        for name in ["mysql", "sys", "performance_schema", "information_schema", "schemaflow"] {
            assert!(list.contains(&name), "{} should be hidden", name);
        }
        assert!(!list.contains(&"app"));
    }

    #[test]
    fn test_connect_options_follow_tls_settings() {
        let plain = connect_options(&config(TlsConfig::default()), Some("app"));
        assert_eq!(plain.get_database(), Some("app"));

        let tls = TlsConfig {
            enabled: true,
            ssl_ca: Some("/etc/ssl/ca.pem".to_string()),
            ssl_cert: None,
            ssl_key: None,
        };
        let secured = connect_options(&config(tls), None);
        assert_eq!(secured.get_host(), "db.internal");
        assert_eq!(secured.get_database(), None);
    }
}
