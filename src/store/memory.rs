//! In-memory store for development and tests
//!
//! One `RwLock` guards every table, so the `(instance_id, name)` uniqueness
//! check and the insert happen under the same write lock.

use super::Store;
use crate::error::{AppError, AppResult};
use crate::models::{
    Database, DatabaseCreate, DatabaseFind, DatabaseLabel, DatabasePatch, Instance, InstanceCreate, Issue,
    Principal, Project, Task, TaskCompletion, TaskCreate, TaskPatch, TaskStatus, DEFAULT_PROJECT_ID,
    SYSTEM_BOT_ID,
};
use crate::schema::SchemaSnapshot;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    instances: BTreeMap<i32, Instance>,
    databases: BTreeMap<i32, Database>,
    projects: BTreeMap<i32, Project>,
    principals: BTreeMap<i32, Principal>,
    issues: BTreeMap<i32, Issue>,
    tasks: BTreeMap<i32, Task>,
    schemas: HashMap<i32, SchemaSnapshot>,
}

fn next_id<T>(table: &BTreeMap<i32, T>) -> i32 {
    table.keys().next_back().map_or(1, |id| id + 1)
}

pub struct MemoryStore {
    tables: RwLock<Tables>,
    /// When set, the next `create_database` loses a race against a sync pass
    /// that registers the same database under this project first.
    #[cfg(test)]
    pub(crate) race_on_create: std::sync::Mutex<Option<i32>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store holding only the default project and the system bot
    pub fn new() -> Self {
        let mut tables = Tables::default();
        tables.projects.insert(
            DEFAULT_PROJECT_ID,
            Project {
                id: DEFAULT_PROJECT_ID,
                name: "Default".to_string(),
                key: "DEFAULT".to_string(),
            },
        );
        tables.principals.insert(
            SYSTEM_BOT_ID,
            Principal {
                id: SYSTEM_BOT_ID,
                name: "SchemaFlow Bot".to_string(),
                email: "bot@schemaflow.local".to_string(),
            },
        );
        Self {
            tables: RwLock::new(tables),
            #[cfg(test)]
            race_on_create: std::sync::Mutex::new(None),
        }
    }

    fn insert_database(tables: &mut Tables, create: &DatabaseCreate) -> AppResult<Database> {
        let taken = tables
            .databases
            .values()
            .any(|db| db.instance_id == create.instance_id && db.name == create.name);
        if taken {
            return Err(AppError::Conflict(format!(
                "database {:?} already exists on instance {}",
                create.name, create.instance_id
            )));
        }
        let now = Utc::now();
        let database = Database {
            id: next_id(&tables.databases),
            instance_id: create.instance_id,
            project_id: create.project_id,
            environment_id: create.environment_id,
            name: create.name.clone(),
            character_set: create.character_set.clone(),
            collation: create.collation.clone(),
            schema_version: create.schema_version.clone(),
            creator_id: create.creator_id,
            updater_id: create.creator_id,
            created_at: now,
            updated_at: now,
            last_successful_sync_at: None,
            labels: Vec::new(),
        };
        tables.databases.insert(database.id, database.clone());
        Ok(database)
    }
}

/// Fixtures for rows the runner never creates itself
#[cfg(test)]
impl MemoryStore {
    pub async fn insert_project(&self, name: &str, key: &str) -> Project {
        let mut tables = self.tables.write().await;
        let project = Project {
            id: next_id(&tables.projects),
            name: name.to_string(),
            key: key.to_string(),
        };
        tables.projects.insert(project.id, project.clone());
        project
    }

    pub async fn insert_issue(&self, pipeline_id: i32, project_id: i32, name: &str) -> Issue {
        let mut tables = self.tables.write().await;
        let issue = Issue {
            id: next_id(&tables.issues),
            pipeline_id,
            project_id,
            name: name.to_string(),
        };
        tables.issues.insert(issue.id, issue.clone());
        issue
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_instance(&self, id: i32) -> AppResult<Option<Instance>> {
        Ok(self.tables.read().await.instances.get(&id).cloned())
    }

    async fn create_instance(&self, create: &InstanceCreate) -> AppResult<Instance> {
        let mut tables = self.tables.write().await;
        if tables.instances.values().any(|i| i.name == create.name) {
            return Err(AppError::Conflict(format!("instance {:?} already exists", create.name)));
        }
        let conn = &create.connection;
        let instance = Instance {
            id: next_id(&tables.instances),
            name: create.name.clone(),
            engine: conn.engine,
            host: conn.host.clone(),
            port: conn.port,
            username: conn.username.clone(),
            password: conn.password.clone(),
            environment_id: create.environment_id,
            environment_name: create.environment_name.clone(),
            tls: conn.tls.clone(),
        };
        tables.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn list_instances(&self) -> AppResult<Vec<Instance>> {
        Ok(self.tables.read().await.instances.values().cloned().collect())
    }

    async fn find_database(&self, find: &DatabaseFind) -> AppResult<Option<Database>> {
        Ok(self
            .tables
            .read()
            .await
            .databases
            .values()
            .find(|db| db.instance_id == find.instance_id && db.name == find.name)
            .cloned())
    }

    async fn get_database(&self, id: i32) -> AppResult<Option<Database>> {
        Ok(self.tables.read().await.databases.get(&id).cloned())
    }

    async fn create_database(&self, create: &DatabaseCreate) -> AppResult<Database> {
        let mut tables = self.tables.write().await;
        #[cfg(test)]
        {
            let racer = self.race_on_create.lock().unwrap().take();
            if let Some(project_id) = racer {
                let discovered = DatabaseCreate {
                    project_id,
                    creator_id: SYSTEM_BOT_ID,
                    character_set: "SYNC".to_string(),
                    ..create.clone()
                };
                Self::insert_database(&mut tables, &discovered)?;
            }
        }
        Self::insert_database(&mut tables, create)
    }

    async fn patch_database(&self, patch: &DatabasePatch) -> AppResult<Database> {
        let mut tables = self.tables.write().await;
        let db = tables
            .databases
            .get_mut(&patch.id)
            .ok_or_else(|| AppError::NotFound(format!("database {} not found", patch.id)))?;
        db.updater_id = patch.updater_id;
        if let Some(project_id) = patch.project_id {
            db.project_id = project_id;
        }
        if let Some(character_set) = &patch.character_set {
            db.character_set = character_set.clone();
        }
        if let Some(collation) = &patch.collation {
            db.collation = collation.clone();
        }
        if let Some(schema_version) = &patch.schema_version {
            db.schema_version = schema_version.clone();
        }
        if let Some(at) = patch.last_successful_sync_at {
            db.last_successful_sync_at = Some(at);
        }
        db.updated_at = Utc::now();
        Ok(db.clone())
    }

    async fn list_databases(&self, instance_id: i32) -> AppResult<Vec<Database>> {
        let tables = self.tables.read().await;
        let mut databases: Vec<Database> = tables
            .databases
            .values()
            .filter(|db| db.instance_id == instance_id)
            .cloned()
            .collect();
        databases.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(databases)
    }

    async fn set_database_labels(&self, database_id: i32, labels: &[DatabaseLabel], updater_id: i32) -> AppResult<()> {
        let mut tables = self.tables.write().await;
        let db = tables
            .databases
            .get_mut(&database_id)
            .ok_or_else(|| AppError::NotFound(format!("database {} not found", database_id)))?;
        let mut labels = labels.to_vec();
        labels.sort_by(|a, b| a.key.cmp(&b.key));
        labels.dedup_by(|a, b| a.key == b.key);
        db.labels = labels;
        db.updater_id = updater_id;
        db.updated_at = Utc::now();
        Ok(())
    }

    async fn find_project(&self, id: i32) -> AppResult<Option<Project>> {
        Ok(self.tables.read().await.projects.get(&id).cloned())
    }

    async fn find_principal(&self, id: i32) -> AppResult<Option<Principal>> {
        Ok(self.tables.read().await.principals.get(&id).cloned())
    }

    async fn find_issue_by_pipeline(&self, pipeline_id: i32) -> AppResult<Option<Issue>> {
        Ok(self
            .tables
            .read()
            .await
            .issues
            .values()
            .find(|issue| issue.pipeline_id == pipeline_id)
            .cloned())
    }

    async fn create_task(&self, create: &TaskCreate) -> AppResult<Task> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        let task = Task {
            id: next_id(&tables.tasks),
            pipeline_id: create.pipeline_id,
            instance_id: create.instance_id,
            database_id: create.database_id,
            name: create.name.clone(),
            task_type: create.task_type,
            status: TaskStatus::Pending,
            payload: create.payload.clone(),
            creator_id: create.creator_id,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
        };
        tables.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn find_task(&self, id: i32) -> AppResult<Option<Task>> {
        Ok(self.tables.read().await.tasks.get(&id).cloned())
    }

    async fn patch_task(&self, patch: &TaskPatch) -> AppResult<Task> {
        let mut tables = self.tables.write().await;
        let task = tables
            .tasks
            .get_mut(&patch.id)
            .ok_or_else(|| AppError::NotFound(format!("task {} not found", patch.id)))?;
        if let Some(database_id) = patch.database_id {
            task.database_id = Some(database_id);
        }
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> AppResult<Vec<Task>> {
        Ok(self
            .tables
            .read()
            .await
            .tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect())
    }

    async fn claim_task(&self, id: i32) -> AppResult<Option<Task>> {
        let mut tables = self.tables.write().await;
        match tables.tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Running;
                task.updated_at = Utc::now();
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn complete_task(&self, id: i32, completion: &TaskCompletion) -> AppResult<Task> {
        let mut tables = self.tables.write().await;
        let task = tables
            .tasks
            .get_mut(&id)
            .filter(|t| t.status == TaskStatus::Running)
            .ok_or_else(|| AppError::Conflict(format!("task {} is not running", id)))?;
        task.status = completion.status();
        match completion {
            TaskCompletion::Succeeded(result) => task.result = Some(result.clone()),
            TaskCompletion::Failed(message) => task.error = Some(message.clone()),
        }
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn save_schema(&self, database_id: i32, snapshot: &SchemaSnapshot) -> AppResult<()> {
        self.tables
            .write()
            .await
            .schemas
            .insert(database_id, snapshot.clone());
        Ok(())
    }

    async fn find_schema(&self, database_id: i32) -> AppResult<Option<SchemaSnapshot>> {
        Ok(self.tables.read().await.schemas.get(&database_id).cloned())
    }
}
