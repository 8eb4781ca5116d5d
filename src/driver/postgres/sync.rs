//! Catalog introspection for PostgreSQL
//!
//! Instance queries run on the driver's admin client. Database queries run
//! inside the caller's read-only transaction so every sub-query sees the
//! same catalog snapshot.

use crate::driver::{quote_ident, require_view_definition};
use crate::error::AppResult;
use crate::schema::index_def::{index_column_expressions, index_method};
use crate::schema::{
    Column, Constraint, DatabaseMeta, Extension, Index, InstanceUser, SchemaSnapshot, Table, View,
};
use std::collections::HashMap;
use tokio_postgres::{Client, Transaction};

const USER_SCHEMAS: &str = "NOT IN ('pg_catalog', 'information_schema')";

pub(super) async fn server_version(client: &Client) -> AppResult<String> {
    let row = client.query_one("SELECT current_setting('server_version')", &[]).await?;
    Ok(row.try_get(0)?)
}

pub(super) async fn users(client: &Client) -> AppResult<Vec<InstanceUser>> {
    let rows = client
        .query(
            "SELECT usename::text AS role_name,
                CASE
                    WHEN usesuper AND usecreatedb THEN CAST('superuser, create database' AS pg_catalog.text)
                    WHEN usesuper THEN CAST('superuser' AS pg_catalog.text)
                    WHEN usecreatedb THEN CAST('create database' AS pg_catalog.text)
                    ELSE CAST('' AS pg_catalog.text)
                END AS role_attributes
             FROM pg_catalog.pg_user
             ORDER BY role_name",
            &[],
        )
        .await?;

    rows.iter()
        .map(|row| -> AppResult<InstanceUser> {
            Ok(InstanceUser {
                name: row.try_get("role_name")?,
                grant: row.try_get("role_attributes")?,
            })
        })
        .collect()
}

/// Every database on the server, denylist not applied
pub(super) async fn databases(client: &Client) -> AppResult<Vec<DatabaseMeta>> {
    let rows = client
        .query(
            "SELECT datname::text AS name,
                    pg_encoding_to_char(encoding)::text AS character_set,
                    datcollate::text AS collation
             FROM pg_catalog.pg_database
             ORDER BY datname",
            &[],
        )
        .await?;

    rows.iter()
        .map(|row| -> AppResult<DatabaseMeta> {
            Ok(DatabaseMeta {
                name: row.try_get("name")?,
                character_set: row.try_get("character_set")?,
                collation: row.try_get("collation")?,
            })
        })
        .collect()
}

/// Gather the whole snapshot. Any failing sub-query fails the pass.
pub(super) async fn snapshot(tx: &Transaction<'_>, meta: DatabaseMeta) -> AppResult<SchemaSnapshot> {
    let mut indexes = indexes(tx).await?;
    let mut constraints = constraints(tx).await?;
    let mut columns = columns(tx).await?;

    let mut tables = tables(tx).await?;
    for table in &mut tables {
        let key = table_key(&table.schema, &table.name);
        table.row_count = row_count(tx, &table.schema, &table.name).await?;
        table.columns = columns.remove(&key).unwrap_or_default();
        table.indexes = indexes.remove(&key).unwrap_or_default();
        table.constraints = constraints.remove(&key).unwrap_or_default();
    }

    let views = views(tx).await?;
    let extensions = extensions(tx).await?;

    Ok(SchemaSnapshot::new(
        meta.name,
        meta.character_set,
        meta.collation,
        tables,
        views,
        extensions,
    ))
}

fn table_key(schema: &str, table: &str) -> String {
    format!("{}.{}", schema, table)
}

async fn indexes(tx: &Transaction<'_>) -> AppResult<HashMap<String, Vec<Index>>> {
    let query = format!(
        "SELECT n.nspname::text AS schema_name,
                t.relname::text AS table_name,
                i.relname::text AS index_name,
                pg_get_indexdef(ix.indexrelid) AS definition,
                ix.indisunique AS is_unique,
                ix.indisprimary AS is_primary,
                obj_description(ix.indexrelid, 'pg_class') AS comment
         FROM pg_catalog.pg_index ix
         JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid
         JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
         JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
         WHERE n.nspname {} AND n.nspname NOT LIKE 'pg_toast%'
         ORDER BY 1, 2, 3",
        USER_SCHEMAS
    );

    let mut result: HashMap<String, Vec<Index>> = HashMap::new();
    for row in tx.query(query.as_str(), &[]).await? {
        let schema: String = row.try_get("schema_name")?;
        let table: String = row.try_get("table_name")?;
        let definition: String = row.try_get("definition")?;
        result.entry(table_key(&schema, &table)).or_default().push(Index {
            name: row.try_get("index_name")?,
            expressions: index_column_expressions(&definition)?,
            method: index_method(&definition),
            unique: row.try_get("is_unique")?,
            primary: row.try_get("is_primary")?,
            comment: row.try_get("comment")?,
        });
    }
    Ok(result)
}

async fn tables(tx: &Transaction<'_>) -> AppResult<Vec<Table>> {
    let query = format!(
        "SELECT tbl.schemaname::text AS schema_name,
                tbl.tablename::text AS table_name,
                tbl.tableowner::text AS owner,
                pg_table_size(c.oid) AS data_size,
                pg_indexes_size(c.oid) AS index_size,
                obj_description(c.oid, 'pg_class') AS comment
         FROM pg_catalog.pg_tables tbl
         JOIN pg_catalog.pg_namespace n ON n.nspname = tbl.schemaname
         JOIN pg_catalog.pg_class c ON c.relnamespace = n.oid AND c.relname = tbl.tablename
         WHERE tbl.schemaname {}
         ORDER BY 1, 2",
        USER_SCHEMAS
    );

    tx.query(query.as_str(), &[])
        .await?
        .iter()
        .map(|row| -> AppResult<Table> {
            Ok(Table {
                schema: row.try_get("schema_name")?,
                name: row.try_get("table_name")?,
                owner: row.try_get("owner")?,
                table_type: "BASE TABLE".to_string(),
                comment: row.try_get("comment")?,
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

async fn row_count(tx: &Transaction<'_>, schema: &str, table: &str) -> AppResult<i64> {
    let query = format!("SELECT COUNT(1) FROM {}.{}", quote_ident(schema), quote_ident(table));
    let row = tx.query_one(query.as_str(), &[]).await?;
    Ok(row.try_get(0)?)
}

async fn columns(tx: &Transaction<'_>) -> AppResult<HashMap<String, Vec<Column>>> {
    let query = format!(
        "SELECT cols.table_schema::text AS table_schema,
                cols.table_name::text AS table_name,
                cols.column_name::text AS column_name,
                cols.data_type::text AS data_type,
                cols.udt_schema::text AS udt_schema,
                cols.udt_name::text AS udt_name,
                cols.ordinal_position::int AS position,
                cols.character_maximum_length::int AS max_length,
                cols.column_default::text AS column_default,
                cols.is_nullable::text AS is_nullable,
                cols.collation_name::text AS collation_name,
                col_description(c.oid, cols.ordinal_position::int) AS comment
         FROM information_schema.columns cols
         JOIN pg_catalog.pg_namespace n ON n.nspname = cols.table_schema
         JOIN pg_catalog.pg_class c ON c.relnamespace = n.oid AND c.relname = cols.table_name
         WHERE cols.table_schema {}
         ORDER BY cols.table_schema, cols.table_name, cols.ordinal_position",
        USER_SCHEMAS
    );

    let mut result: HashMap<String, Vec<Column>> = HashMap::new();
    for row in tx.query(query.as_str(), &[]).await? {
        let schema: String = row.try_get("table_schema")?;
        let table: String = row.try_get("table_name")?;
        let data_type: String = row.try_get("data_type")?;
        let udt_schema: String = row.try_get("udt_schema")?;
        let udt_name: String = row.try_get("udt_name")?;
        let is_nullable: String = row.try_get("is_nullable")?;

        result.entry(table_key(&schema, &table)).or_default().push(Column {
            name: row.try_get("column_name")?,
            position: row.try_get("position")?,
            data_type: resolve_column_type(&data_type, &udt_schema, &udt_name),
            nullable: is_nullable == "YES",
            default_value: row.try_get("column_default")?,
            character_maximum_length: row.try_get("max_length")?,
            collation: row.try_get("collation_name")?,
            comment: row.try_get("comment")?,
        });
    }
    Ok(result)
}

/// `USER-DEFINED` becomes `schema.type`, `ARRAY` becomes the element type
/// name (`_int4`); everything else is kept as reported.
pub(super) fn resolve_column_type(data_type: &str, udt_schema: &str, udt_name: &str) -> String {
    match data_type {
        "USER-DEFINED" => format!("{}.{}", udt_schema, udt_name),
        "ARRAY" => udt_name.to_string(),
        other => other.to_string(),
    }
}

async fn constraints(tx: &Transaction<'_>) -> AppResult<HashMap<String, Vec<Constraint>>> {
    let query = format!(
        "SELECT n.nspname::text AS schema_name,
                c.conrelid::regclass::text AS table_name,
                c.conname::text AS name,
                pg_get_constraintdef(c.oid) AS definition
         FROM pg_catalog.pg_constraint c
         JOIN pg_catalog.pg_namespace n ON n.oid = c.connamespace
         WHERE n.nspname {} AND c.conrelid <> 0
         ORDER BY 1, 2, 3",
        USER_SCHEMAS
    );

    let mut result: HashMap<String, Vec<Constraint>> = HashMap::new();
    for row in tx.query(query.as_str(), &[]).await? {
        let schema: String = row.try_get("schema_name")?;
        let regclass: String = row.try_get("table_name")?;
        result
            .entry(table_key(&schema, &unqualified_table_name(&regclass)))
            .or_default()
            .push(Constraint {
                name: row.try_get("name")?,
                definition: row.try_get("definition")?,
            });
    }
    Ok(result)
}

/// `regclass` text is schema-qualified and quoted when the name needs it
/// (`audit."Event Log"`); reduce it to the bare table name.
pub(super) fn unqualified_table_name(regclass: &str) -> String {
    let mut last = String::new();
    let mut in_quotes = false;
    let mut chars = regclass.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                last.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            '.' if !in_quotes => last.clear(),
            _ => last.push(ch),
        }
    }
    last
}

async fn views(tx: &Transaction<'_>) -> AppResult<Vec<View>> {
    let query = format!(
        "SELECT v.schemaname::text AS schema_name,
                v.viewname::text AS view_name,
                v.definition,
                obj_description(c.oid, 'pg_class') AS comment
         FROM pg_catalog.pg_views v
         JOIN pg_catalog.pg_namespace n ON n.nspname = v.schemaname
         JOIN pg_catalog.pg_class c ON c.relnamespace = n.oid AND c.relname = v.viewname
         WHERE v.schemaname {}
         ORDER BY 1, 2",
        USER_SCHEMAS
    );

    let mut result = Vec::new();
    for row in tx.query(query.as_str(), &[]).await? {
        let schema: String = row.try_get("schema_name")?;
        let name: String = row.try_get("view_name")?;
        let definition: Option<String> = row.try_get("definition")?;
        let definition = require_view_definition(&schema, &name, definition)?;
        result.push(View {
            schema,
            name,
            definition,
            comment: row.try_get("comment")?,
        });
    }
    Ok(result)
}

async fn extensions(tx: &Transaction<'_>) -> AppResult<Vec<Extension>> {
    let rows = tx
        .query(
            "SELECT e.extname::text AS name,
                    e.extversion AS version,
                    n.nspname::text AS schema_name,
                    d.description
             FROM pg_catalog.pg_extension e
             LEFT JOIN pg_catalog.pg_namespace n ON n.oid = e.extnamespace
             LEFT JOIN pg_catalog.pg_description d
                 ON d.objoid = e.oid AND d.classoid = 'pg_catalog.pg_extension'::pg_catalog.regclass
             WHERE n.nspname <> 'pg_catalog'
             ORDER BY 1",
            &[],
        )
        .await?;

    rows.iter()
        .map(|row| -> AppResult<Extension> {
            Ok(Extension {
                name: row.try_get("name")?,
                version: row.try_get("version")?,
                schema: row.try_get("schema_name")?,
                description: row.try_get("description")?,
            })
        })
        .collect()
}
