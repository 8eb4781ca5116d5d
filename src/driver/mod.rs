//! Driver layer
//!
//! Per-engine adapters behind one contract: open a connection, execute a
//! statement, run a tracked migration and introspect instance and database
//! metadata. Drivers are looked up through an explicit [`DriverRegistry`]
//! built at startup and handed to whoever needs to open connections.
//!
//! A driver owns exactly one server connection. Dropping it releases the
//! connection; [`Driver::close`] is the explicit, awaited form.

pub mod mysql;
pub mod postgres;

#[cfg(test)]
pub mod fake;

use crate::error::{AppError, AppResult};
use crate::models::{ConnectionConfig, Engine, Instance, MigrationInfo, MigrationOutcome};
use crate::schema::{DatabaseMeta, InstanceMeta, SchemaSnapshot};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// An open connection to one database server
#[async_trait]
pub trait Driver: Send + Sync {
    fn engine(&self) -> Engine;

    /// Run `statement` inside a single transaction; returns affected rows
    async fn execute(&self, statement: &str) -> AppResult<u64>;

    /// Run `statement` and append exactly one migration-history record
    /// described by `info`.
    async fn execute_migration(
        &self,
        info: &MigrationInfo,
        statement: &str,
    ) -> AppResult<MigrationOutcome>;

    /// Server version, principals and the user-visible databases
    async fn sync_instance(&self) -> AppResult<InstanceMeta>;

    /// Full snapshot of one database, read inside one read-only transaction
    async fn sync_database_schema(&self, database: &str) -> AppResult<SchemaSnapshot>;

    /// Release the connection. Later calls on this driver fail.
    async fn close(&mut self) -> AppResult<()>;
}

/// Opens drivers for one engine
#[async_trait]
pub trait DriverFactory: Send + Sync {
    fn engine(&self) -> Engine;

    async fn open(&self, config: &ConnectionConfig) -> AppResult<Box<dyn Driver>>;
}

/// Engine -> factory mapping, populated explicitly at startup
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: HashMap<Engine, Arc<dyn DriverFactory>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the PostgreSQL and MySQL drivers. Migration history is
    /// kept in `metadata_database` on every managed instance.
    pub fn with_builtins(metadata_database: &str) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(postgres::PgDriverFactory::new(metadata_database)));
        registry.register(Arc::new(mysql::MySqlDriverFactory::new(metadata_database)));
        registry
    }

    /// Add or replace the factory for its engine
    pub fn register(&mut self, factory: Arc<dyn DriverFactory>) {
        self.factories.insert(factory.engine(), factory);
    }

    pub fn engines(&self) -> Vec<Engine> {
        let mut engines: Vec<Engine> = self.factories.keys().copied().collect();
        engines.sort_by_key(|e| e.as_str());
        engines
    }

    /// Open a connection to `instance`. `database: None` gives an
    /// administrative connection that selects no database.
    pub async fn open(&self, instance: &Instance, database: Option<&str>) -> AppResult<Box<dyn Driver>> {
        let config = instance.connection_config(database);
        self.open_config(&config).await
    }

    pub async fn open_config(&self, config: &ConnectionConfig) -> AppResult<Box<dyn Driver>> {
        let factory = self.factories.get(&config.engine).ok_or_else(|| {
            AppError::UnsupportedEngine(format!("no driver registered for {}", config.engine))
        })?;
        debug!(server = %config.to_display_string(), "opening driver");
        factory.open(config).await
    }
}

/// Await `fut` unless `cancel` fires first
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    if cancel.is_cancelled() {
        return Err(AppError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AppError::Cancelled),
        res = fut => res,
    }
}

/// Close `driver`, logging instead of failing; the caller already has its
/// result
pub async fn release(driver: &mut dyn Driver) {
    if let Err(e) = driver.close().await {
        warn!(engine = %driver.engine(), error = %e, "failed to close driver");
    }
}

/// Drop databases whose name is in `denylist` (exact, case-sensitive)
pub fn visible_databases(databases: Vec<DatabaseMeta>, denylist: &[&str]) -> Vec<DatabaseMeta> {
    databases
        .into_iter()
        .filter(|db| !denylist.contains(&db.name.as_str()))
        .collect()
}

/// A view without a readable definition means missing privileges
pub fn require_view_definition(schema: &str, name: &str, definition: Option<String>) -> AppResult<String> {
    match definition {
        Some(def) if !def.trim().is_empty() => Ok(def),
        _ => Err(AppError::Privilege(format!(
            "schema {:?} view {:?} has empty definition; please check whether proper privileges have been granted",
            schema, name
        ))),
    }
}

/// Split a script into statements on top-level `;`.
///
/// Semicolons inside quotes (`'`, `"`, `` ` ``), dollar-quoted bodies
/// (`$$`, `$tag$`), `--` line comments and `/* */` block comments do not
/// split. Empty statements are dropped.
pub fn split_statements(script: &str) -> Vec<String> {
    let chars: Vec<char> = script.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut state = Lexeme::Code;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();
        match &mut state {
            Lexeme::LineComment => {
                if ch == '\n' {
                    state = Lexeme::Code;
                }
            }
            Lexeme::BlockComment(depth) => {
                if ch == '*' && next == Some('/') {
                    current.push_str("*/");
                    i += 2;
                    *depth -= 1;
                    if *depth == 0 {
                        state = Lexeme::Code;
                    }
                    continue;
                }
                if ch == '/' && next == Some('*') {
                    current.push_str("/*");
                    i += 2;
                    *depth += 1;
                    continue;
                }
            }
            Lexeme::Quoted(q) => {
                if ch == *q {
                    state = Lexeme::Code;
                }
            }
            Lexeme::Dollar(tag) => {
                if chars[i..].starts_with(tag.as_slice()) {
                    current.extend(tag.iter());
                    i += tag.len();
                    state = Lexeme::Code;
                    continue;
                }
            }
            Lexeme::Code => match ch {
                '\'' | '"' | '`' => state = Lexeme::Quoted(ch),
                '-' if next == Some('-') => state = Lexeme::LineComment,
                '/' if next == Some('*') => {
                    current.push_str("/*");
                    i += 2;
                    state = Lexeme::BlockComment(1);
                    continue;
                }
                '$' => {
                    let after_ident = i > 0 && is_ident_char(chars[i - 1]);
                    if let Some(tag) = dollar_tag(&chars[i..]).filter(|_| !after_ident) {
                        current.extend(tag.iter());
                        i += tag.len();
                        state = Lexeme::Dollar(tag);
                        continue;
                    }
                }
                ';' => {
                    push_statement(&mut statements, &current);
                    current.clear();
                    i += 1;
                    continue;
                }
                _ => {}
            },
        }
        current.push(ch);
        i += 1;
    }
    push_statement(&mut statements, &current);
    statements
}

enum Lexeme {
    Code,
    Quoted(char),
    LineComment,
    /// Nesting depth; PostgreSQL block comments nest
    BlockComment(u32),
    /// Opening tag including both `$`
    Dollar(Vec<char>),
}

fn is_ident_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_'
}

/// `$$` or `$tag$` at the start of `rest`. `$1` is a parameter, not a tag.
fn dollar_tag(rest: &[char]) -> Option<Vec<char>> {
    let mut end = 1;
    while end < rest.len() && is_ident_char(rest[end]) {
        end += 1;
    }
    if rest.get(end) != Some(&'$') {
        return None;
    }
    if rest.get(1).is_some_and(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(rest[..=end].to_vec())
}

fn push_statement(statements: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
}

/// Double-quote an identifier for PostgreSQL
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Backtick-quote an identifier for MySQL
pub fn quote_ident_mysql(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn meta(name: &str) -> DatabaseMeta {
        DatabaseMeta {
            name: name.to_string(),
            character_set: "UTF8".to_string(),
            collation: "C".to_string(),
        }
    }

    #[test]
    fn test_split_statements() {
        let script = "CREATE DATABASE \"a;b\" ENCODING 'UTF8';\n-- note; still comment\nALTER DATABASE x OWNER TO y;;";
        assert_eq!(
            split_statements(script),
            vec![
                "CREATE DATABASE \"a;b\" ENCODING 'UTF8'",
                "-- note; still comment\nALTER DATABASE x OWNER TO y",
            ]
        );
        assert!(split_statements("  ;\n ").is_empty());
    }

    #[test]
    fn test_split_statements_keeps_dollar_quotes_whole() {
        assert_eq!(
            split_statements("CREATE DATABASE app; COMMENT ON DATABASE app IS $$owned by team; do not drop$$;"),
            vec![
                "CREATE DATABASE app",
                "COMMENT ON DATABASE app IS $$owned by team; do not drop$$",
            ]
        );
        assert_eq!(
            split_statements("DO $body$ BEGIN PERFORM 'a;$$'; END $body$; SELECT $1"),
            vec!["DO $body$ BEGIN PERFORM 'a;$$'; END $body$", "SELECT $1"]
        );
    }

    #[test]
    fn test_split_statements_skips_block_comments() {
        assert_eq!(
            split_statements("CREATE DATABASE app; /* it's new; /* nested */ still */ ALTER DATABASE app OWNER TO x;"),
            vec![
                "CREATE DATABASE app",
                "/* it's new; /* nested */ still */ ALTER DATABASE app OWNER TO x",
            ]
        );
    }

    #[test]
    fn test_denylist_is_exact_match() {
        let dbs = vec![meta("app"), meta("rdsadmin"), meta("RDSADMIN"), meta("template1")];
        let names: Vec<String> = visible_databases(dbs, &["rdsadmin", "template1"])
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["app", "RDSADMIN"]);
    }

    #[test]
    fn test_view_without_definition_is_privilege_error() {
        let err = require_view_definition("public", "v_users", None).unwrap_err();
        assert!(matches!(err, AppError::Privilege(_)));
        assert!(err.to_string().contains("\"v_users\""));
        assert!(require_view_definition("public", "v", Some("  ".to_string())).is_err());
        assert_eq!(
            require_view_definition("public", "v", Some(" SELECT 1;".to_string())).unwrap(),
            " SELECT 1;"
        );
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_ident_mysql("a`b"), "`a``b`");
    }

    #[test]
    fn test_builtin_registry_engines() {
        let registry = DriverRegistry::with_builtins("schemaflow");
        assert_eq!(registry.engines(), vec![Engine::Mysql, Engine::Postgres]);
    }

    #[tokio::test]
    async fn test_cancellable_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let res = cancellable(&token, async { Ok::<_, AppError>(1) }).await;
        assert!(matches!(res, Err(AppError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancellable_interrupts_pending_io() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });
        let res = cancellable(&token, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, AppError>(())
        })
        .await;
        assert!(matches!(res, Err(AppError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancellable_passes_result_through() {
        let token = CancellationToken::new();
        assert_eq!(cancellable(&token, async { Ok::<_, AppError>(7) }).await.unwrap(), 7);
    }
}
