//! Schema sync engine
//!
//! Pulls instance and database metadata through the driver layer into the
//! store. Instance sync registers newly discovered databases under the
//! default project; database sync replaces the stored snapshot only when a
//! whole pass succeeds, so the previous snapshot stays the last known good
//! state after any failure.

use crate::driver::{cancellable, release, DriverRegistry};
use crate::error::{AppError, AppResult};
use crate::models::{
    Database, DatabaseCreate, DatabaseFind, DatabasePatch, Instance, DEFAULT_PROJECT_ID, SYSTEM_BOT_ID,
};
use crate::schema::{DatabaseMeta, SchemaSnapshot};
use crate::store::Store;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// What one instance sync changed in the store
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstanceSyncSummary {
    pub version: String,
    /// Principals reported by the server; logged, not persisted
    pub users: usize,
    pub discovered: usize,
    pub updated: usize,
}

#[derive(Clone)]
pub struct SchemaSyncer {
    store: Arc<dyn Store>,
    drivers: Arc<DriverRegistry>,
    interval: Duration,
}

impl SchemaSyncer {
    pub fn new(store: Arc<dyn Store>, drivers: Arc<DriverRegistry>, interval: Duration) -> Self {
        Self {
            store,
            drivers,
            interval,
        }
    }

    /// Register every user-visible database on `instance`.
    ///
    /// Existing rows keep their project; only character set and collation
    /// follow the server.
    #[instrument(skip_all, fields(instance = %instance.name))]
    pub async fn sync_instance(&self, instance: &Instance, cancel: &CancellationToken) -> AppResult<InstanceSyncSummary> {
        let mut driver = cancellable(cancel, self.drivers.open(instance, None)).await?;
        let meta = cancellable(cancel, driver.sync_instance()).await;
        release(driver.as_mut()).await;
        let meta = meta?;

        let mut summary = InstanceSyncSummary {
            version: meta.version,
            users: meta.users.len(),
            ..Default::default()
        };
        for db in &meta.databases {
            match self.upsert_database(instance, db).await? {
                Upsert::Created => summary.discovered += 1,
                Upsert::Updated => summary.updated += 1,
                Upsert::Unchanged => {}
            }
        }
        info!(
            version = %summary.version,
            users = summary.users,
            discovered = summary.discovered,
            updated = summary.updated,
            "instance synced"
        );
        Ok(summary)
    }

    async fn upsert_database(&self, instance: &Instance, meta: &DatabaseMeta) -> AppResult<Upsert> {
        let find = DatabaseFind {
            instance_id: instance.id,
            name: meta.name.clone(),
        };
        if let Some(existing) = self.store.find_database(&find).await? {
            return self.refresh(&existing, meta).await;
        }

        let create = DatabaseCreate {
            creator_id: SYSTEM_BOT_ID,
            project_id: DEFAULT_PROJECT_ID,
            instance_id: instance.id,
            environment_id: instance.environment_id,
            name: meta.name.clone(),
            character_set: meta.character_set.clone(),
            collation: meta.collation.clone(),
            schema_version: String::new(),
        };
        match self.store.create_database(&create).await {
            Ok(db) => {
                debug!(database = %db.name, "discovered database");
                Ok(Upsert::Created)
            }
            // A create task registered it first; its project wins
            Err(AppError::Conflict(_)) => match self.store.find_database(&find).await? {
                Some(existing) => self.refresh(&existing, meta).await,
                None => Err(AppError::Internal(format!(
                    "database {:?} conflicted but cannot be found",
                    meta.name
                ))),
            },
            Err(e) => Err(e),
        }
    }

    async fn refresh(&self, existing: &Database, meta: &DatabaseMeta) -> AppResult<Upsert> {
        if existing.character_set == meta.character_set && existing.collation == meta.collation {
            return Ok(Upsert::Unchanged);
        }
        let mut patch = DatabasePatch::new(existing.id, SYSTEM_BOT_ID);
        patch.character_set = Some(meta.character_set.clone());
        patch.collation = Some(meta.collation.clone());
        self.store.patch_database(&patch).await?;
        Ok(Upsert::Updated)
    }

    /// Take a fresh snapshot of `database` and publish it
    #[instrument(skip_all, fields(instance = %instance.name, database = %database.name))]
    pub async fn sync_database(
        &self,
        instance: &Instance,
        database: &Database,
        cancel: &CancellationToken,
    ) -> AppResult<SchemaSnapshot> {
        let mut driver = cancellable(cancel, self.drivers.open(instance, None)).await?;
        let snapshot = cancellable(cancel, driver.sync_database_schema(&database.name)).await;
        release(driver.as_mut()).await;
        let snapshot = snapshot?;

        self.store.save_schema(database.id, &snapshot).await?;
        let mut patch = DatabasePatch::new(database.id, SYSTEM_BOT_ID);
        patch.last_successful_sync_at = Some(Utc::now());
        self.store.patch_database(&patch).await?;

        debug!(tables = snapshot.tables.len(), checksum = %snapshot.checksum, "schema snapshot published");
        Ok(snapshot)
    }

    /// One pass over every instance and each of its databases. Failures are
    /// logged per object and do not stop the pass.
    pub async fn sync_all(&self, cancel: &CancellationToken) -> AppResult<()> {
        for instance in self.store.list_instances().await? {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            if let Err(e) = self.sync_instance(&instance, cancel).await {
                warn!(instance = %instance.name, kind = ?e.kind(), error = %e, "instance sync failed");
                continue;
            }
            for database in self.store.list_databases(instance.id).await? {
                if let Err(e) = self.sync_database(&instance, &database, cancel).await {
                    warn!(
                        instance = %instance.name,
                        database = %database.name,
                        error = %e,
                        "database sync failed; keeping previous snapshot"
                    );
                }
            }
        }
        Ok(())
    }

    /// Sync everything every interval until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "schema sync loop started");
        loop {
            match self.sync_all(&cancel).await {
                Ok(()) | Err(AppError::Cancelled) => {}
                Err(e) => error!(error = %e, "schema sync pass failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("schema sync loop stopped");
    }
}

enum Upsert {
    Created,
    Updated,
    Unchanged,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeServer;
    use crate::models::{ConnectionConfig, InstanceCreate};
    use crate::schema::{Table, View};
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;

    async fn setup() -> (Arc<FakeServer>, Arc<MemoryStore>, SchemaSyncer, Instance) {
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
        let syncer = SchemaSyncer::new(store.clone(), server.registry(), Duration::from_secs(60));
        (server, store, syncer, instance)
    }

    fn snapshot(name: &str, tables: &[&str]) -> SchemaSnapshot {
        let tables = tables
            .iter()
            .map(|t| Table {
                schema: "public".to_string(),
                name: t.to_string(),
                owner: "app".to_string(),
                table_type: "BASE TABLE".to_string(),
                comment: None,
                row_count: 0,
                data_size: 8192,
                index_size: 0,
                columns: Vec::new(),
                indexes: Vec::new(),
                constraints: Vec::new(),
            })
            .collect();
        SchemaSnapshot::new(name, "UTF8", "en_US.UTF-8", tables, Vec::<View>::new(), Vec::new())
    }

    #[tokio::test]
    async fn test_instance_sync_registers_under_default_project() {
        let (server, store, syncer, instance) = setup().await;
        server.add_database("app");
        server.add_database("billing");

        let summary = syncer.sync_instance(&instance, &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.discovered, 2);
        assert_eq!((summary.version.as_str(), summary.users), ("16.2", 1));

        let dbs = store.list_databases(instance.id).await.unwrap();
        assert_eq!(dbs.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(), vec!["app", "billing"]);
        assert!(dbs.iter().all(|d| d.project_id == DEFAULT_PROJECT_ID && d.environment_id == 2));
        assert_eq!(server.opened.load(Ordering::SeqCst), server.released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_instance_sync_never_reassigns_project() {
        let (server, store, syncer, instance) = setup().await;
        server.add_database("app");
        let create = DatabaseCreate {
            creator_id: SYSTEM_BOT_ID,
            project_id: 5,
            instance_id: instance.id,
            environment_id: 2,
            name: "app".to_string(),
            character_set: "LATIN1".to_string(),
            collation: "C".to_string(),
            schema_version: "v1".to_string(),
        };
        store.create_database(&create).await.unwrap();

        let summary = syncer.sync_instance(&instance, &CancellationToken::new()).await.unwrap();
        assert_eq!((summary.discovered, summary.updated), (0, 1));
        let db = store.list_databases(instance.id).await.unwrap().remove(0);
        assert_eq!(db.project_id, 5);
        assert_eq!(db.character_set, "UTF8");
        assert_eq!(db.schema_version, "v1");

        // A conflicting insert racing the lookup resolves to the same outcome
        server.add_database("late");
        *store.race_on_create.lock().unwrap() = Some(9);
        syncer.sync_instance(&instance, &CancellationToken::new()).await.unwrap();
        let late = store
            .find_database(&DatabaseFind {
                instance_id: instance.id,
                name: "late".to_string(),
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(late.project_id, 9);
        assert_eq!(store.list_databases(instance.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_database_sync_publishes_snapshot() {
        let (server, store, syncer, instance) = setup().await;
        server.add_database("app");
        syncer.sync_instance(&instance, &CancellationToken::new()).await.unwrap();
        let db = store.list_databases(instance.id).await.unwrap().remove(0);
        server.set_schema("app", Ok(snapshot("app", &["users"])));

        let published = syncer.sync_database(&instance, &db, &CancellationToken::new()).await.unwrap();
        assert_eq!(store.find_schema(db.id).await.unwrap(), Some(published));
        let db = store.get_database(db.id).await.unwrap().unwrap();
        assert!(db.last_successful_sync_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_sync_keeps_last_known_good() {
        let (server, store, syncer, instance) = setup().await;
        server.add_database("app");
        syncer.sync_instance(&instance, &CancellationToken::new()).await.unwrap();
        let db = store.list_databases(instance.id).await.unwrap().remove(0);

        server.set_schema("app", Ok(snapshot("app", &["users"])));
        let good = syncer.sync_database(&instance, &db, &CancellationToken::new()).await.unwrap();

        server.set_schema(
            "app",
            Err("schema \"public\" view \"v\" has empty definition".to_string()),
        );
        let err = syncer.sync_database(&instance, &db, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AppError::Privilege(_)));
        assert_eq!(store.find_schema(db.id).await.unwrap(), Some(good));
        assert_eq!(server.opened.load(Ordering::SeqCst), server.released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancelled_sync_publishes_nothing() {
        let (server, store, syncer, instance) = setup().await;
        server.add_database("app");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = syncer.sync_instance(&instance, &cancel).await.unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
        assert!(store.list_databases(instance.id).await.unwrap().is_empty());
    }
}
