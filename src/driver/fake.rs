//! In-process driver used by unit tests
//!
//! A `FakeServer` stands in for a live instance: it remembers its databases,
//! its migration history and the snapshot each database sync should return.

use super::{Driver, DriverFactory, DriverRegistry};
use crate::error::{AppError, AppResult};
use crate::models::{
    ConnectionConfig, Engine, MigrationInfo, MigrationOutcome, MigrationRecord, MigrationStatus,
};
use crate::schema::{DatabaseMeta, InstanceMeta, InstanceUser, SchemaSnapshot};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct FakeServer {
    pub databases: Mutex<Vec<DatabaseMeta>>,
    pub history: Mutex<Vec<MigrationRecord>>,
    /// Per-database sync outcome; `Err` text becomes a privilege error
    pub schemas: Mutex<HashMap<String, Result<SchemaSnapshot, String>>>,
    pub fail_migration: Mutex<Option<String>>,
    pub migration_delay: Mutex<Option<Duration>>,
    pub opened: AtomicUsize,
    pub released: AtomicUsize,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_database(&self, name: &str) {
        self.databases.lock().unwrap().push(DatabaseMeta {
            name: name.to_string(),
            character_set: "UTF8".to_string(),
            collation: "en_US.UTF-8".to_string(),
        });
    }

    pub fn set_schema(&self, database: &str, outcome: Result<SchemaSnapshot, String>) {
        self.schemas.lock().unwrap().insert(database.to_string(), outcome);
    }

    pub fn history_for(&self, namespace: &str) -> Vec<MigrationRecord> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.namespace == namespace)
            .cloned()
            .collect()
    }

    /// Registry whose postgres engine is served by this fake
    pub fn registry(self: &Arc<Self>) -> Arc<DriverRegistry> {
        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(FakeDriverFactory { server: self.clone() }));
        Arc::new(registry)
    }
}

pub struct FakeDriverFactory {
    server: Arc<FakeServer>,
}

#[async_trait]
impl DriverFactory for FakeDriverFactory {
    fn engine(&self) -> Engine {
        Engine::Postgres
    }

    async fn open(&self, _config: &ConnectionConfig) -> AppResult<Box<dyn Driver>> {
        self.server.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeDriver {
            server: self.server.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct FakeDriver {
    server: Arc<FakeServer>,
    closed: AtomicBool,
}

impl FakeDriver {
    fn ensure_open(&self) -> AppResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::Driver("driver is closed".to_string()));
        }
        Ok(())
    }
}

impl Drop for FakeDriver {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.server.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn engine(&self) -> Engine {
        Engine::Postgres
    }

    async fn execute(&self, _statement: &str) -> AppResult<u64> {
        self.ensure_open()?;
        Ok(0)
    }

    async fn execute_migration(&self, info: &MigrationInfo, statement: &str) -> AppResult<MigrationOutcome> {
        self.ensure_open()?;
        let delay = *self.server.migration_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        crate::migration::precheck(&self.server.history_for(&info.namespace), info)?;
        if let Some(msg) = self.server.fail_migration.lock().unwrap().clone() {
            return Err(AppError::Driver(msg));
        }
        if info.create_database {
            self.server.add_database(&info.database);
        }
        let mut history = self.server.history.lock().unwrap();
        let id = history.len() as i64 + 1;
        history.push(MigrationRecord {
            id,
            namespace: info.namespace.clone(),
            version: info.version.clone(),
            migration_type: info.migration_type,
            status: MigrationStatus::Done,
            statement: statement.to_string(),
            creator: info.creator.clone(),
            issue_id: info.issue_id.clone(),
            created_at: Utc::now(),
            execution_duration_ns: 0,
        });
        Ok(MigrationOutcome {
            migration_id: id,
            version: info.version.clone(),
        })
    }

    async fn sync_instance(&self) -> AppResult<InstanceMeta> {
        self.ensure_open()?;
        Ok(InstanceMeta {
            version: "16.2".to_string(),
            users: vec![InstanceUser {
                name: "admin".to_string(),
                grant: "SUPERUSER LOGIN".to_string(),
            }],
            databases: self.server.databases.lock().unwrap().clone(),
        })
    }

    async fn sync_database_schema(&self, database: &str) -> AppResult<SchemaSnapshot> {
        self.ensure_open()?;
        match self.server.schemas.lock().unwrap().get(database) {
            Some(Ok(snapshot)) => Ok(snapshot.clone()),
            Some(Err(msg)) => Err(AppError::Privilege(msg.clone())),
            None => Err(AppError::NotFound(format!("database {:?} not found", database))),
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.server.released.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
