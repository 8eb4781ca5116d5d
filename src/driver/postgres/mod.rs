//! PostgreSQL driver
//!
//! One `tokio-postgres` client per driver, with optional rustls TLS. Schema
//! sync opens its own short-lived connection to the target database because
//! PostgreSQL catalogs are per database.

mod migration;
mod sync;

use super::{split_statements, visible_databases, Driver, DriverFactory};
use crate::migration::precheck;
use crate::error::{AppError, AppResult};
use crate::models::{ConnectionConfig, Engine, MigrationInfo, MigrationOutcome, TlsConfig};
use crate::schema::{InstanceMeta, SchemaSnapshot};
use async_trait::async_trait;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, IsolationLevel, NoTls};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ADMIN_DATABASE: &str = "postgres";

/// Databases never shown to users besides the metadata database
const SYSTEM_DATABASES: &[&str] = &["template0", "template1", "rdsadmin", "cloudsql", "cloudsqladmin"];

pub struct PgDriverFactory {
    metadata_database: String,
}

impl PgDriverFactory {
    pub fn new(metadata_database: &str) -> Self {
        Self {
            metadata_database: metadata_database.to_string(),
        }
    }
}

#[async_trait]
impl DriverFactory for PgDriverFactory {
    fn engine(&self) -> Engine {
        Engine::Postgres
    }

    async fn open(&self, config: &ConnectionConfig) -> AppResult<Box<dyn Driver>> {
        let database = config.database.as_deref().unwrap_or(ADMIN_DATABASE);
        let (client, connection) = connect(config, database).await?;
        Ok(Box::new(PgDriver {
            config: config.clone(),
            metadata_database: self.metadata_database.clone(),
            client: Mutex::new(client),
            connection,
        }))
    }
}

pub struct PgDriver {
    config: ConnectionConfig,
    metadata_database: String,
    client: Mutex<Client>,
    connection: JoinHandle<()>,
}

impl Drop for PgDriver {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

fn denylist(metadata_database: &str) -> Vec<&str> {
    let mut list = SYSTEM_DATABASES.to_vec();
    list.push(metadata_database);
    list
}

impl PgDriver {
    /// Run a creation script statement by statement outside any transaction
    async fn execute_creation(&self, statement: &str) -> AppResult<()> {
        let client = self.client.lock().await;
        for stmt in split_statements(statement) {
            client.batch_execute(&stmt).await?;
        }
        Ok(())
    }

    /// Run a script in one transaction on the namespace database
    async fn execute_in_database(&self, database: &str, statement: &str) -> AppResult<()> {
        let (mut client, _connection) = connect(&self.config, database).await?;
        let tx = client.transaction().await?;
        tx.batch_execute(statement).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Driver for PgDriver {
    fn engine(&self) -> Engine {
        Engine::Postgres
    }

    async fn execute(&self, statement: &str) -> AppResult<u64> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        let mut affected = 0;
        for stmt in split_statements(statement) {
            affected += tx.execute(stmt.as_str(), &[]).await?;
        }
        tx.commit().await?;
        Ok(affected)
    }

    async fn execute_migration(&self, info: &MigrationInfo, statement: &str) -> AppResult<MigrationOutcome> {
        {
            let admin = self.client.lock().await;
            migration::ensure_metadata_database(&admin, &self.metadata_database).await?;
        }
        let (meta, _meta_connection) = connect(&self.config, &self.metadata_database).await?;
        let meta = Arc::new(meta);
        migration::ensure_history_table(&meta).await?;
        precheck(&migration::list(&meta, &info.namespace).await?, info)?;

        let pending = migration::PendingMigration::begin(meta.clone(), info, statement).await?;
        let id = pending.id();
        debug!(migration_id = id, namespace = %info.namespace, "migration started");

        let applied = if info.create_database {
            self.execute_creation(statement).await
        } else {
            self.execute_in_database(&info.namespace, statement).await
        };

        match applied {
            Ok(()) => {
                pending.finish(true).await?;
                info!(
                    migration_id = id,
                    namespace = %info.namespace,
                    version = %info.version,
                    "migration applied"
                );
                Ok(MigrationOutcome {
                    migration_id: id,
                    version: info.version.clone(),
                })
            }
            Err(e) => {
                if let Err(mark_err) = pending.finish(false).await {
                    warn!(migration_id = id, error = %mark_err, "failed to mark migration as failed");
                }
                Err(e)
            }
        }
    }

    async fn sync_instance(&self) -> AppResult<InstanceMeta> {
        let client = self.client.lock().await;
        let version = sync::server_version(&client).await?;
        let users = sync::users(&client).await?;
        let databases = visible_databases(sync::databases(&client).await?, &denylist(&self.metadata_database));
        Ok(InstanceMeta {
            version,
            users,
            databases,
        })
    }

    async fn sync_database_schema(&self, database: &str) -> AppResult<SchemaSnapshot> {
        let meta = {
            let client = self.client.lock().await;
            sync::databases(&client)
                .await?
                .into_iter()
                .find(|db| db.name == database)
                .ok_or_else(|| AppError::NotFound(format!("database {:?} not found", database)))?
        };

        let (mut client, _connection) = connect(&self.config, database).await?;
        // Rolled back on drop if any query below fails
        let tx = client
            .build_transaction()
            .isolation_level(IsolationLevel::RepeatableRead)
            .read_only(true)
            .start()
            .await?;

        let snapshot = sync::snapshot(&tx, meta).await?;
        tx.commit().await?;
        Ok(snapshot)
    }

    async fn close(&mut self) -> AppResult<()> {
        self.connection.abort();
        Ok(())
    }
}

/// Open a client to `database` and spawn its connection task
pub(crate) async fn connect(config: &ConnectionConfig, database: &str) -> AppResult<(Client, JoinHandle<()>)> {
    let mut pg = tokio_postgres::Config::new();
    pg.host(&config.host)
        .port(config.port)
        .user(&config.username)
        .password(config.password.as_str())
        .dbname(database)
        .application_name("schemaflow-runner")
        .connect_timeout(CONNECT_TIMEOUT);

    if config.tls.enabled {
        let (client, connection) = pg.connect(tls_connector(&config.tls)?).await?;
        let handle = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection closed with error");
            }
        });
        Ok((client, handle))
    } else {
        let (client, connection) = pg.connect(NoTls).await?;
        let handle = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection closed with error");
            }
        });
        Ok((client, handle))
    }
}

/// Build a rustls connector: the given CA (or the native roots) plus an
/// optional client certificate.
pub(crate) fn tls_connector(tls: &TlsConfig) -> AppResult<tokio_postgres_rustls::MakeRustlsConnect> {
    let mut root_store = rustls::RootCertStore::empty();
    match &tls.ssl_ca {
        Some(path) => {
            let certs = CertificateDer::pem_file_iter(path).map_err(|e| tls_error("ssl-ca", e))?;
            for cert in certs {
                let cert = cert.map_err(|e| tls_error("ssl-ca", e))?;
                root_store.add(cert).map_err(|e| tls_error("ssl-ca", e))?;
            }
        }
        None => {
            let certs = rustls_native_certs::load_native_certs();
            for cert in certs.certs {
                root_store.add(cert).ok();
            }
        }
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(root_store);
    let config = match (&tls.ssl_cert, &tls.ssl_key) {
        (Some(cert), Some(key)) => {
            let chain = CertificateDer::pem_file_iter(cert)
                .map_err(|e| tls_error("ssl-cert", e))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| tls_error("ssl-cert", e))?;
            let key = PrivateKeyDer::from_pem_file(key).map_err(|e| tls_error("ssl-key", e))?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| tls_error("client certificate", e))?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(tokio_postgres_rustls::MakeRustlsConnect::new(config))
}

fn tls_error(what: &str, e: impl std::fmt::Debug) -> AppError {
    AppError::Config(format!("invalid {}: {:?}", what, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_ca_file_is_config_error() {
        let tls = TlsConfig {
            enabled: true,
            ssl_ca: Some("/nonexistent/ca.pem".to_string()),
            ssl_cert: None,
            ssl_key: None,
        };
        assert!(matches!(tls_connector(&tls), Err(AppError::Config(_))));
    }

    #[test]
    fn test_denylist_includes_metadata_database() {
        let list = denylist("schemaflow");
        assert!(list.contains(&"schemaflow"));
        assert!(list.contains(&"cloudsqladmin"));
        assert!(!list.contains(&"postgres"));
    }
}
