//! PostgreSQL-backed store

use super::Store;
use crate::error::{AppError, AppResult};
use crate::models::{
    Database, DatabaseCreate, DatabaseFind, DatabaseLabel, DatabasePatch, Engine, Instance, InstanceCreate,
    Issue, Principal, Project, Task, TaskCompletion, TaskCreate, TaskPatch, TaskRunResult, TaskStatus,
    TaskType, TlsConfig, DEFAULT_PROJECT_ID, SYSTEM_BOT_ID,
};
use crate::schema::SchemaSnapshot;
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::error::SqlState;
use tokio_postgres::Row;
use tracing::info;

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS principal (
    id SERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS project (
    id SERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    key TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS issue (
    id SERIAL PRIMARY KEY,
    pipeline_id INTEGER NOT NULL UNIQUE,
    project_id INTEGER NOT NULL REFERENCES project (id),
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS instance (
    id SERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    engine TEXT NOT NULL,
    host TEXT NOT NULL,
    port INTEGER NOT NULL,
    username TEXT NOT NULL,
    password TEXT NOT NULL,
    environment_id INTEGER NOT NULL,
    environment_name TEXT NOT NULL,
    tls JSONB NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS db (
    id SERIAL PRIMARY KEY,
    instance_id INTEGER NOT NULL REFERENCES instance (id),
    project_id INTEGER NOT NULL REFERENCES project (id),
    environment_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    character_set TEXT NOT NULL,
    collation_name TEXT NOT NULL,
    schema_version TEXT NOT NULL,
    creator_id INTEGER NOT NULL REFERENCES principal (id),
    updater_id INTEGER NOT NULL REFERENCES principal (id),
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    last_successful_sync_at TIMESTAMPTZ,
    UNIQUE (instance_id, name)
);

CREATE TABLE IF NOT EXISTS db_label (
    database_id INTEGER NOT NULL REFERENCES db (id) ON DELETE CASCADE,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (database_id, key)
);

CREATE TABLE IF NOT EXISTS task (
    id SERIAL PRIMARY KEY,
    pipeline_id INTEGER NOT NULL,
    instance_id INTEGER NOT NULL REFERENCES instance (id),
    database_id INTEGER REFERENCES db (id),
    name TEXT NOT NULL,
    task_type TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('PENDING', 'RUNNING', 'DONE', 'FAILED')),
    payload TEXT NOT NULL,
    creator_id INTEGER NOT NULL REFERENCES principal (id),
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    result JSONB,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_task_status ON task (status);

CREATE TABLE IF NOT EXISTS db_schema (
    database_id INTEGER PRIMARY KEY REFERENCES db (id) ON DELETE CASCADE,
    checksum TEXT NOT NULL,
    captured_at TIMESTAMPTZ NOT NULL,
    snapshot JSONB NOT NULL
);
"#;

const DATABASE_COLUMNS: &str = "d.id, d.instance_id, d.project_id, d.environment_id, d.name, d.character_set,
    d.collation_name, d.schema_version, d.creator_id, d.updater_id, d.created_at, d.updated_at,
    d.last_successful_sync_at,
    COALESCE(
        (SELECT json_agg(json_build_object('key', l.key, 'value', l.value) ORDER BY l.key)
         FROM db_label l WHERE l.database_id = d.id),
        '[]'::json
    ) AS labels";

const TASK_COLUMNS: &str = "id, pipeline_id, instance_id, database_id, name, task_type, status, payload,
    creator_id, created_at, updated_at, result, error";

const INSTANCE_COLUMNS: &str =
    "id, name, engine, host, port, username, password, environment_id, environment_name, tls";

pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool from a `postgres://` URL and verify it with `SELECT 1`
    pub async fn connect(database_url: &str, max_connections: usize) -> AppResult<Self> {
        let config = database_url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| AppError::Config(format!("Failed to parse DATABASE_URL: {}", e)))?;

        let host = match config.get_hosts().first() {
            Some(tokio_postgres::config::Host::Tcp(host)) => host.clone(),
            Some(_) => return Err(AppError::Config("Unix socket connections are not supported".to_string())),
            None => return Err(AppError::Config("No host in DATABASE_URL".to_string())),
        };

        let mut cfg = Config::new();
        cfg.host = Some(host);
        cfg.port = Some(config.get_ports().first().copied().unwrap_or(5432));
        cfg.user = config.get_user().map(str::to_string);
        cfg.password = config
            .get_password()
            .map(|p| String::from_utf8_lossy(p).to_string());
        cfg.dbname = config.get_dbname().map(str::to_string);
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(max_connections));

        let use_tls = database_url.contains("sslmode=require");
        let pool = if use_tls {
            let tls = crate::driver::postgres::tls_connector(&TlsConfig {
                enabled: true,
                ..TlsConfig::default()
            })?;
            cfg.create_pool(Some(Runtime::Tokio1), tls)
        } else {
            cfg.create_pool(Some(Runtime::Tokio1), tokio_postgres::NoTls)
        }
        .map_err(|e| AppError::Config(format!("Failed to create pool: {}", e)))?;

        let client = pool.get().await?;
        client.query_one("SELECT 1", &[]).await?;
        info!(tls = use_tls, "metadata store connection established");

        Ok(Self::new(pool))
    }

    /// Create tables and the default project and system bot
    pub async fn bootstrap(&self) -> AppResult<()> {
        let client = self.pool.get().await?;
        client.batch_execute(CREATE_TABLES).await?;

        client
            .execute(
                "INSERT INTO principal (id, name, email) VALUES ($1, 'SchemaFlow Bot', 'bot@schemaflow.local')
                 ON CONFLICT (id) DO NOTHING",
                &[&SYSTEM_BOT_ID],
            )
            .await?;
        client
            .execute(
                "INSERT INTO project (id, name, key) VALUES ($1, 'Default', 'DEFAULT')
                 ON CONFLICT (id) DO NOTHING",
                &[&DEFAULT_PROJECT_ID],
            )
            .await?;
        // Explicit ids above bypass the sequences
        client
            .batch_execute(
                "SELECT setval(pg_get_serial_sequence('principal', 'id'), GREATEST((SELECT MAX(id) FROM principal), 1));
                 SELECT setval(pg_get_serial_sequence('project', 'id'), GREATEST((SELECT MAX(id) FROM project), 1));",
            )
            .await?;

        info!("metadata store tables ready");
        Ok(())
    }
}

fn is_unique_violation(e: &tokio_postgres::Error) -> bool {
    e.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

fn instance_from_row(row: &Row) -> AppResult<Instance> {
    let engine: String = row.try_get("engine")?;
    let port: i32 = row.try_get("port")?;
    let tls: serde_json::Value = row.try_get("tls")?;
    Ok(Instance {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        engine: Engine::parse(&engine)?,
        host: row.try_get("host")?,
        port: u16::try_from(port).map_err(|_| AppError::Internal(format!("invalid port {}", port)))?,
        username: row.try_get("username")?,
        password: row.try_get("password")?,
        environment_id: row.try_get("environment_id")?,
        environment_name: row.try_get("environment_name")?,
        tls: serde_json::from_value(tls)?,
    })
}

fn database_from_row(row: &Row) -> AppResult<Database> {
    let labels: serde_json::Value = row.try_get("labels")?;
    Ok(Database {
        id: row.try_get("id")?,
        instance_id: row.try_get("instance_id")?,
        project_id: row.try_get("project_id")?,
        environment_id: row.try_get("environment_id")?,
        name: row.try_get("name")?,
        character_set: row.try_get("character_set")?,
        collation: row.try_get("collation_name")?,
        schema_version: row.try_get("schema_version")?,
        creator_id: row.try_get("creator_id")?,
        updater_id: row.try_get("updater_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_successful_sync_at: row.try_get("last_successful_sync_at")?,
        labels: serde_json::from_value(labels)?,
    })
}

fn task_from_row(row: &Row) -> AppResult<Task> {
    let task_type: String = row.try_get("task_type")?;
    let status: String = row.try_get("status")?;
    let result: Option<serde_json::Value> = row.try_get("result")?;
    Ok(Task {
        id: row.try_get("id")?,
        pipeline_id: row.try_get("pipeline_id")?,
        instance_id: row.try_get("instance_id")?,
        database_id: row.try_get("database_id")?,
        name: row.try_get("name")?,
        task_type: TaskType::parse(&task_type)?,
        status: TaskStatus::parse(&status)?,
        payload: row.try_get("payload")?,
        creator_id: row.try_get("creator_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        result: result.map(serde_json::from_value::<TaskRunResult>).transpose()?,
        error: row.try_get("error")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn find_instance(&self, id: i32) -> AppResult<Option<Instance>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(&format!("SELECT {} FROM instance WHERE id = $1", INSTANCE_COLUMNS), &[&id])
            .await?;
        row.as_ref().map(instance_from_row).transpose()
    }

    async fn create_instance(&self, create: &InstanceCreate) -> AppResult<Instance> {
        let client = self.pool.get().await?;
        let conn = &create.connection;
        let tls = serde_json::to_value(&conn.tls)?;
        let row = client
            .query_one(
                &format!(
                    "INSERT INTO instance (name, engine, host, port, username, password, environment_id, environment_name, tls)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                     RETURNING {}",
                    INSTANCE_COLUMNS
                ),
                &[
                    &create.name,
                    &conn.engine.as_str(),
                    &conn.host,
                    &i32::from(conn.port),
                    &conn.username,
                    &conn.password,
                    &create.environment_id,
                    &create.environment_name,
                    &tls,
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::Conflict(format!("instance {:?} already exists", create.name))
                } else {
                    e.into()
                }
            })?;
        instance_from_row(&row)
    }

    async fn list_instances(&self) -> AppResult<Vec<Instance>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(&format!("SELECT {} FROM instance ORDER BY id", INSTANCE_COLUMNS), &[])
            .await?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn find_database(&self, find: &DatabaseFind) -> AppResult<Option<Database>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {} FROM db d WHERE d.instance_id = $1 AND d.name = $2", DATABASE_COLUMNS),
                &[&find.instance_id, &find.name],
            )
            .await?;
        row.as_ref().map(database_from_row).transpose()
    }

    async fn get_database(&self, id: i32) -> AppResult<Option<Database>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(&format!("SELECT {} FROM db d WHERE d.id = $1", DATABASE_COLUMNS), &[&id])
            .await?;
        row.as_ref().map(database_from_row).transpose()
    }

    async fn create_database(&self, create: &DatabaseCreate) -> AppResult<Database> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "INSERT INTO db (
                    instance_id, project_id, environment_id, name, character_set, collation_name,
                    schema_version, creator_id, updater_id
                 )
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
                 RETURNING id",
                &[
                    &create.instance_id,
                    &create.project_id,
                    &create.environment_id,
                    &create.name,
                    &create.character_set,
                    &create.collation,
                    &create.schema_version,
                    &create.creator_id,
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::Conflict(format!(
                        "database {:?} already exists on instance {}",
                        create.name, create.instance_id
                    ))
                } else {
                    e.into()
                }
            })?;
        let id: i32 = row.try_get("id")?;
        drop(client);

        self.get_database(id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("database {} vanished after insert", id)))
    }

    async fn patch_database(&self, patch: &DatabasePatch) -> AppResult<Database> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE db SET
                    updater_id = $2,
                    project_id = COALESCE($3, project_id),
                    character_set = COALESCE($4, character_set),
                    collation_name = COALESCE($5, collation_name),
                    schema_version = COALESCE($6, schema_version),
                    last_successful_sync_at = COALESCE($7, last_successful_sync_at),
                    updated_at = now()
                 WHERE id = $1",
                &[
                    &patch.id,
                    &patch.updater_id,
                    &patch.project_id,
                    &patch.character_set,
                    &patch.collation,
                    &patch.schema_version,
                    &patch.last_successful_sync_at,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(AppError::NotFound(format!("database {} not found", patch.id)));
        }
        drop(client);

        self.get_database(patch.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("database {} not found", patch.id)))
    }

    async fn list_databases(&self, instance_id: i32) -> AppResult<Vec<Database>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!("SELECT {} FROM db d WHERE d.instance_id = $1 ORDER BY d.name", DATABASE_COLUMNS),
                &[&instance_id],
            )
            .await?;
        rows.iter().map(database_from_row).collect()
    }

    async fn set_database_labels(&self, database_id: i32, labels: &[DatabaseLabel], updater_id: i32) -> AppResult<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let touched = tx
            .execute(
                "UPDATE db SET updater_id = $2, updated_at = now() WHERE id = $1",
                &[&database_id, &updater_id],
            )
            .await?;
        if touched == 0 {
            return Err(AppError::NotFound(format!("database {} not found", database_id)));
        }
        tx.execute("DELETE FROM db_label WHERE database_id = $1", &[&database_id])
            .await?;
        for label in labels {
            tx.execute(
                "INSERT INTO db_label (database_id, key, value) VALUES ($1, $2, $3)",
                &[&database_id, &label.key, &label.value],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find_project(&self, id: i32) -> AppResult<Option<Project>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT id, name, key FROM project WHERE id = $1", &[&id])
            .await?;
        row.map(|r| -> AppResult<Project> {
            Ok(Project {
                id: r.try_get("id")?,
                name: r.try_get("name")?,
                key: r.try_get("key")?,
            })
        })
        .transpose()
    }

    async fn find_principal(&self, id: i32) -> AppResult<Option<Principal>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT id, name, email FROM principal WHERE id = $1", &[&id])
            .await?;
        row.map(|r| -> AppResult<Principal> {
            Ok(Principal {
                id: r.try_get("id")?,
                name: r.try_get("name")?,
                email: r.try_get("email")?,
            })
        })
        .transpose()
    }

    async fn find_issue_by_pipeline(&self, pipeline_id: i32) -> AppResult<Option<Issue>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, pipeline_id, project_id, name FROM issue WHERE pipeline_id = $1",
                &[&pipeline_id],
            )
            .await?;
        row.map(|r| -> AppResult<Issue> {
            Ok(Issue {
                id: r.try_get("id")?,
                pipeline_id: r.try_get("pipeline_id")?,
                project_id: r.try_get("project_id")?,
                name: r.try_get("name")?,
            })
        })
        .transpose()
    }

    async fn create_task(&self, create: &TaskCreate) -> AppResult<Task> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                &format!(
                    "INSERT INTO task (pipeline_id, instance_id, database_id, name, task_type, status, payload, creator_id)
                     VALUES ($1, $2, $3, $4, $5, 'PENDING', $6, $7)
                     RETURNING {}",
                    TASK_COLUMNS
                ),
                &[
                    &create.pipeline_id,
                    &create.instance_id,
                    &create.database_id,
                    &create.name,
                    &create.task_type.as_str(),
                    &create.payload,
                    &create.creator_id,
                ],
            )
            .await?;
        task_from_row(&row)
    }

    async fn find_task(&self, id: i32) -> AppResult<Option<Task>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(&format!("SELECT {} FROM task WHERE id = $1", TASK_COLUMNS), &[&id])
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn patch_task(&self, patch: &TaskPatch) -> AppResult<Task> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "UPDATE task SET database_id = COALESCE($2, database_id), updated_at = now()
                     WHERE id = $1
                     RETURNING {}",
                    TASK_COLUMNS
                ),
                &[&patch.id, &patch.database_id],
            )
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {} not found", patch.id)))?;
        task_from_row(&row)
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> AppResult<Vec<Task>> {
        let client = self.pool.get().await?;
        let status = status.map(|s| s.as_str());
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM task WHERE ($1::TEXT IS NULL OR status = $1) ORDER BY id",
                    TASK_COLUMNS
                ),
                &[&status],
            )
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn claim_task(&self, id: i32) -> AppResult<Option<Task>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "UPDATE task SET status = 'RUNNING', updated_at = now()
                     WHERE id = $1 AND status = 'PENDING'
                     RETURNING {}",
                    TASK_COLUMNS
                ),
                &[&id],
            )
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn complete_task(&self, id: i32, completion: &TaskCompletion) -> AppResult<Task> {
        let client = self.pool.get().await?;
        let (result, error) = match completion {
            TaskCompletion::Succeeded(result) => (Some(serde_json::to_value(result)?), None),
            TaskCompletion::Failed(message) => (None, Some(message.as_str())),
        };
        let row = client
            .query_opt(
                &format!(
                    "UPDATE task SET status = $2, result = $3, error = $4, updated_at = now()
                     WHERE id = $1 AND status = 'RUNNING'
                     RETURNING {}",
                    TASK_COLUMNS
                ),
                &[&id, &completion.status().as_str(), &result, &error],
            )
            .await?
            .ok_or_else(|| AppError::Conflict(format!("task {} is not running", id)))?;
        task_from_row(&row)
    }

    async fn save_schema(&self, database_id: i32, snapshot: &SchemaSnapshot) -> AppResult<()> {
        let client = self.pool.get().await?;
        let document = serde_json::to_value(snapshot)?;
        client
            .execute(
                "INSERT INTO db_schema (database_id, checksum, captured_at, snapshot)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (database_id) DO UPDATE
                 SET checksum = EXCLUDED.checksum, captured_at = EXCLUDED.captured_at, snapshot = EXCLUDED.snapshot",
                &[&database_id, &snapshot.checksum, &snapshot.captured_at, &document],
            )
            .await?;
        Ok(())
    }

    async fn find_schema(&self, database_id: i32) -> AppResult<Option<SchemaSnapshot>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT snapshot FROM db_schema WHERE database_id = $1", &[&database_id])
            .await?;
        match row {
            Some(row) => {
                let document: serde_json::Value = row.try_get("snapshot")?;
                Ok(Some(serde_json::from_value(document)?))
            }
            None => Ok(None),
        }
    }
}
