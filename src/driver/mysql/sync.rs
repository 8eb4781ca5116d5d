//! Catalog introspection for MySQL
//!
//! Text columns from `information_schema` and `mysql.user` are cast to CHAR
//! since their collations vary across server versions.

use crate::driver::{quote_ident_mysql, require_view_definition};
use crate::error::AppResult;
use crate::schema::{
    Column, Constraint, DatabaseMeta, Index, InstanceUser, SchemaSnapshot, Table, View,
};
use sqlx::mysql::{MySqlConnection, MySqlPool, MySqlRow};
use sqlx::Row;
use std::collections::HashMap;

pub(super) async fn server_version(pool: &MySqlPool) -> AppResult<String> {
    let row: MySqlRow = sqlx::query("SELECT CAST(VERSION() AS CHAR) AS version").fetch_one(pool).await?;
    Ok(row.try_get("version")?)
}

pub(super) async fn users(pool: &MySqlPool) -> AppResult<Vec<InstanceUser>> {
    let rows: Vec<MySqlRow> = sqlx::query(
        "SELECT CAST(User AS CHAR) AS user_name, CAST(Host AS CHAR) AS host
         FROM mysql.user
         ORDER BY user_name, host",
    )
    .fetch_all(pool)
    .await?;

    let mut users = Vec::with_capacity(rows.len());
    for row in rows {
        let user: String = row.try_get("user_name")?;
        let host: String = row.try_get("host")?;
        let show = format!("SHOW GRANTS FOR {}@{}", quote_literal(&user), quote_literal(&host));
        let grants: Vec<MySqlRow> = sqlx::raw_sql(&show).fetch_all(pool).await?;
        let grant = grants
            .iter()
            .map(|g| g.try_get::<String, _>(0))
            .collect::<Result<Vec<_>, _>>()?
            .join("\n");
        users.push(InstanceUser {
            name: format!("{}@{}", quote_literal(&user), quote_literal(&host)),
            grant,
        });
    }
    Ok(users)
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

/// Every schema on the server, denylist not applied
pub(super) async fn databases(pool: &MySqlPool) -> AppResult<Vec<DatabaseMeta>> {
    let rows: Vec<MySqlRow> = sqlx::query(
        "SELECT CAST(SCHEMA_NAME AS CHAR) AS name,
                CAST(DEFAULT_CHARACTER_SET_NAME AS CHAR) AS character_set,
                CAST(DEFAULT_COLLATION_NAME AS CHAR) AS collation_name
         FROM information_schema.SCHEMATA
         ORDER BY name",
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> AppResult<DatabaseMeta> {
            Ok(DatabaseMeta {
                name: row.try_get("name")?,
                character_set: row.try_get("character_set")?,
                collation: row.try_get("collation_name")?,
            })
        })
        .collect()
}

/// Gather the whole snapshot on `conn`, which holds an open read-only
/// transaction.
pub(super) async fn snapshot(conn: &mut MySqlConnection, meta: DatabaseMeta) -> AppResult<SchemaSnapshot> {
    let database = meta.name.clone();
    let mut columns = columns(conn, &database).await?;
    let mut indexes = indexes(conn, &database).await?;
    let mut constraints = constraints(conn, &database).await?;

    let mut tables = tables(conn, &database).await?;
    for table in &mut tables {
        let count = format!(
            "SELECT COUNT(1) AS row_count FROM {}.{}",
            quote_ident_mysql(&database),
            quote_ident_mysql(&table.name)
        );
        let row: MySqlRow = sqlx::query(&count).fetch_one(&mut *conn).await?;
        table.row_count = row.try_get("row_count")?;
        table.columns = columns.remove(&table.name).unwrap_or_default();
        table.indexes = indexes.remove(&table.name).unwrap_or_default();
        table.constraints = constraints.remove(&table.name).unwrap_or_default();
    }

    let views = views(conn, &database).await?;

    Ok(SchemaSnapshot::new(
        meta.name,
        meta.character_set,
        meta.collation,
        tables,
        views,
        Vec::new(),
    ))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

async fn tables(conn: &mut MySqlConnection, database: &str) -> AppResult<Vec<Table>> {
    let rows: Vec<MySqlRow> = sqlx::query(
        "SELECT CAST(TABLE_NAME AS CHAR) AS table_name,
                CAST(TABLE_TYPE AS CHAR) AS table_type,
                CAST(COALESCE(DATA_LENGTH, 0) AS SIGNED) AS data_size,
                CAST(COALESCE(INDEX_LENGTH, 0) AS SIGNED) AS index_size,
                CAST(TABLE_COMMENT AS CHAR) AS comment
         FROM information_schema.TABLES
         WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'
         ORDER BY table_name",
    )
    .bind(database)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| -> AppResult<Table> {
            Ok(Table {
                schema: String::new(),
                name: row.try_get("table_name")?,
                owner: String::new(),
                table_type: row.try_get("table_type")?,
                comment: non_empty(row.try_get("comment")?),
                row_count: 0,
                data_size: row.try_get("data_size")?,
                index_size: row.try_get("index_size")?,
                columns: Vec::new(),
                indexes: Vec::new(),
                constraints: Vec::new(),
            })
        })
        .collect()
}

async fn columns(conn: &mut MySqlConnection, database: &str) -> AppResult<HashMap<String, Vec<Column>>> {
    let rows: Vec<MySqlRow> = sqlx::query(
        "SELECT CAST(TABLE_NAME AS CHAR) AS table_name,
                CAST(COLUMN_NAME AS CHAR) AS column_name,
                CAST(ORDINAL_POSITION AS SIGNED) AS position,
                CAST(COLUMN_TYPE AS CHAR) AS data_type,
                CAST(IS_NULLABLE AS CHAR) AS is_nullable,
                CAST(COLUMN_DEFAULT AS CHAR) AS column_default,
                CAST(CASE
                    WHEN CHARACTER_MAXIMUM_LENGTH > 2147483647 THEN -1
                    ELSE CHARACTER_MAXIMUM_LENGTH
                END AS SIGNED) AS max_length,
                CAST(COLLATION_NAME AS CHAR) AS collation_name,
                CAST(COLUMN_COMMENT AS CHAR) AS comment
         FROM information_schema.COLUMNS
         WHERE TABLE_SCHEMA = ?
         ORDER BY TABLE_NAME, ORDINAL_POSITION",
    )
    .bind(database)
    .fetch_all(&mut *conn)
    .await?;

    let mut result: HashMap<String, Vec<Column>> = HashMap::new();
    for row in rows {
        let table: String = row.try_get("table_name")?;
        let position: i64 = row.try_get("position")?;
        let max_length: Option<i64> = row.try_get("max_length")?;
        let is_nullable: String = row.try_get("is_nullable")?;
        result.entry(table).or_default().push(Column {
            name: row.try_get("column_name")?,
            position: position as i32,
            data_type: row.try_get("data_type")?,
            nullable: is_nullable == "YES",
            default_value: row.try_get("column_default")?,
            character_maximum_length: max_length.map(|l| l as i32),
            collation: row.try_get("collation_name")?,
            comment: non_empty(row.try_get("comment")?),
        });
    }
    Ok(result)
}

async fn indexes(conn: &mut MySqlConnection, database: &str) -> AppResult<HashMap<String, Vec<Index>>> {
    let rows: Vec<MySqlRow> = sqlx::query(
        "SELECT CAST(TABLE_NAME AS CHAR) AS table_name,
                CAST(INDEX_NAME AS CHAR) AS index_name,
                CAST(COLUMN_NAME AS CHAR) AS column_name,
                CAST(NON_UNIQUE AS SIGNED) AS non_unique,
                CAST(INDEX_TYPE AS CHAR) AS index_type,
                CAST(INDEX_COMMENT AS CHAR) AS comment
         FROM information_schema.STATISTICS
         WHERE TABLE_SCHEMA = ?
         ORDER BY TABLE_NAME, INDEX_NAME, SEQ_IN_INDEX",
    )
    .bind(database)
    .fetch_all(&mut *conn)
    .await?;

    let mut result: HashMap<String, Vec<Index>> = HashMap::new();
    for row in rows {
        let table: String = row.try_get("table_name")?;
        let name: String = row.try_get("index_name")?;
        let column: Option<String> = row.try_get("column_name")?;
        let indexes = result.entry(table).or_default();

        // Rows arrive grouped per index in key order
        if indexes.last().map(|i| i.name != name).unwrap_or(true) {
            let non_unique: i64 = row.try_get("non_unique")?;
            let method: String = row.try_get("index_type")?;
            indexes.push(Index {
                primary: name == "PRIMARY",
                name,
                expressions: Vec::new(),
                method: method.to_lowercase(),
                unique: non_unique == 0,
                comment: non_empty(row.try_get("comment")?),
            });
        }
        if let (Some(index), Some(column)) = (indexes.last_mut(), column) {
            index.expressions.push(column);
        }
    }
    Ok(result)
}

async fn constraints(conn: &mut MySqlConnection, database: &str) -> AppResult<HashMap<String, Vec<Constraint>>> {
    let rows: Vec<MySqlRow> = sqlx::query(
        "SELECT CAST(TABLE_NAME AS CHAR) AS table_name,
                CAST(CONSTRAINT_NAME AS CHAR) AS name,
                CAST(CONSTRAINT_TYPE AS CHAR) AS definition
         FROM information_schema.TABLE_CONSTRAINTS
         WHERE TABLE_SCHEMA = ?
         ORDER BY TABLE_NAME, CONSTRAINT_NAME",
    )
    .bind(database)
    .fetch_all(&mut *conn)
    .await?;

    let mut result: HashMap<String, Vec<Constraint>> = HashMap::new();
    for row in rows {
        let table: String = row.try_get("table_name")?;
        result.entry(table).or_default().push(Constraint {
            name: row.try_get("name")?,
            definition: row.try_get("definition")?,
        });
    }
    Ok(result)
}

async fn views(conn: &mut MySqlConnection, database: &str) -> AppResult<Vec<View>> {
    let rows: Vec<MySqlRow> = sqlx::query(
        "SELECT CAST(TABLE_NAME AS CHAR) AS view_name,
                CAST(VIEW_DEFINITION AS CHAR) AS definition
         FROM information_schema.VIEWS
         WHERE TABLE_SCHEMA = ?
         ORDER BY view_name",
    )
    .bind(database)
    .fetch_all(&mut *conn)
    .await?;

    let mut views = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("view_name")?;
        let definition = require_view_definition(database, &name, row.try_get("definition")?)?;
        views.push(View {
            schema: String::new(),
            name,
            definition,
            comment: None,
        });
    }
    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("app"), "'app'");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
        assert_eq!(quote_literal("a\\b"), "'a\\\\b'");
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(Some(String::new())), None);
        assert_eq!(non_empty(Some("x".to_string())), Some("x".to_string()));
    }
}
