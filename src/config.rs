//! Application configuration module
//!
//! Handles loading and validating configuration from environment variables.

use crate::models::ConnectionConfig;
use crate::task::scheduler::SchedulerConfig;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Status API listener
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::new(0, 0, 0, 0),
            port: 3000,
        }
    }
}

/// Metadata store; absent means the in-memory store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub max_connections: usize,
}

/// CORS configuration
#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3001".to_string()],
        }
    }
}

/// Settings recorded on or governing migrations
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub release_version: String,
    /// Per-instance database holding migration history
    pub metadata_database: String,
    pub require_issue_lineage: bool,
    /// Schema updates blocked this long by a PENDING record fail
    pub pending_migration_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            release_version: env!("CARGO_PKG_VERSION").to_string(),
            metadata_database: "schemaflow".to_string(),
            require_issue_lineage: false,
            pending_migration_timeout: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

/// Instance registered at startup from `SEED_INSTANCES`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedInstance {
    pub name: String,
    pub environment_id: i32,
    pub environment_name: String,
    pub connection: ConnectionConfig,
}

/// Complete application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub store: Option<StoreConfig>,
    pub cors: CorsConfig,
    pub scheduler: SchedulerConfig,
    pub sync_interval: Duration,
    pub runner: RunnerConfig,
    pub log_format: LogFormat,
    pub seed_instances: Vec<SeedInstance>,
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{}={:?}", key, raw))),
        None => Ok(default),
    }
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();

        let server = ServerConfig {
            host: parse_var("HOST", ServerConfig::default().host)?,
            port: parse_var("PORT", ServerConfig::default().port)?,
        };

        let store = match var("DATABASE_URL") {
            Some(url) => Some(StoreConfig {
                url,
                max_connections: parse_var("DB_MAX_CONNECTIONS", 10)?,
            }),
            None => None,
        };

        let cors = CorsConfig {
            allowed_origins: var("ALLOWED_ORIGINS")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|| CorsConfig::default().allowed_origins),
        };

        let scheduler = SchedulerConfig {
            interval: Duration::from_millis(parse_var("SCHEDULER_INTERVAL_MS", 1000)?),
            max_concurrent_tasks: parse_var("SCHEDULER_MAX_CONCURRENT_TASKS", 8)?,
            task_poll_interval: Duration::from_millis(parse_var("TASK_POLL_INTERVAL_MS", 5000)?),
        };

        let defaults = RunnerConfig::default();
        let runner = RunnerConfig {
            release_version: var("RELEASE_VERSION").unwrap_or(defaults.release_version),
            metadata_database: var("METADATA_DATABASE").unwrap_or(defaults.metadata_database),
            require_issue_lineage: parse_var("REQUIRE_ISSUE_LINEAGE", defaults.require_issue_lineage)?,
            pending_migration_timeout: Duration::from_secs(parse_var(
                "PENDING_MIGRATION_TIMEOUT_SECS",
                defaults.pending_migration_timeout.as_secs(),
            )?),
        };

        let log_format = match var("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            Some("compact") | None => LogFormat::Compact,
            Some(other) => return Err(ConfigError::InvalidValue(format!("LOG_FORMAT={:?}", other))),
        };

        Ok(Self {
            server,
            store,
            cors,
            scheduler,
            sync_interval: Duration::from_secs(parse_var("SYNC_INTERVAL_SECS", 600)?),
            runner,
            log_format,
            seed_instances: parse_seed_instances(&var("SEED_INSTANCES").unwrap_or_default())?,
        })
    }
}

/// Parse `name[@environment]=url` entries separated by commas. Environment
/// ids are assigned in order of first appearance.
pub fn parse_seed_instances(raw: &str) -> Result<Vec<SeedInstance>, ConfigError> {
    let mut environments: Vec<String> = Vec::new();
    let mut seeds = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (label, url) = entry
            .split_once('=')
            .ok_or_else(|| ConfigError::ParseError(format!("expected name=url, got {:?}", entry)))?;
        let (name, environment) = match label.split_once('@') {
            Some((name, env)) => (name.trim(), env.trim()),
            None => (label.trim(), "default"),
        };
        if name.is_empty() {
            return Err(ConfigError::ParseError(format!("missing instance name in {:?}", entry)));
        }

        let connection = ConnectionConfig::from_url(url.trim())
            .map_err(|e| ConfigError::InvalidValue(format!("instance {:?}: {}", name, e)))?;
        let environment_id = match environments.iter().position(|e| e == environment) {
            Some(index) => index,
            None => {
                environments.push(environment.to_string());
                environments.len() - 1
            }
        } as i32
            + 1;

        seeds.push(SeedInstance {
            name: name.to_string(),
            environment_id,
            environment_name: environment.to_string(),
            connection: connection.with_database(None),
        });
    }
    Ok(seeds)
}
