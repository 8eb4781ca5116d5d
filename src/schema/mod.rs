//! Canonical schema model
//!
//! Engine-neutral description of what a sync pass found on a live server.
//! A [`SchemaSnapshot`] is produced wholesale by one database sync and is
//! never edited afterwards; the next successful pass replaces it.

pub mod index_def;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Point-in-time description of one database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSnapshot {
    pub id: Uuid,
    pub database_name: String,
    pub character_set: String,
    pub collation: String,
    pub captured_at: DateTime<Utc>,
    pub tables: Vec<Table>,
    pub views: Vec<View>,
    pub extensions: Vec<Extension>,
    pub checksum: String,
}

impl SchemaSnapshot {
    /// Assemble a snapshot from fully gathered parts
    pub fn new(
        database_name: impl Into<String>,
        character_set: impl Into<String>,
        collation: impl Into<String>,
        tables: Vec<Table>,
        views: Vec<View>,
        extensions: Vec<Extension>,
    ) -> Self {
        let checksum = Self::compute_checksum(&tables, &views, &extensions);
        Self {
            id: Uuid::new_v4(),
            database_name: database_name.into(),
            character_set: character_set.into(),
            collation: collation.into(),
            captured_at: Utc::now(),
            tables,
            views,
            extensions,
            checksum,
        }
    }

    /// Compute checksum from schema content. Row counts and sizes are
    /// statistics and stay out of the hash; object order does not matter.
    pub fn compute_checksum(tables: &[Table], views: &[View], extensions: &[Extension]) -> String {
        let mut hasher = Sha256::new();

        let mut sorted: Vec<&Table> = tables.iter().collect();
        sorted.sort_by(|a, b| (&a.schema, &a.name).cmp(&(&b.schema, &b.name)));

        for table in sorted {
            hasher.update(
                format!(
                    "TBL:{}:{}:{}:{:?}\n",
                    table.full_name(),
                    table.owner,
                    table.table_type,
                    table.comment
                )
                .as_bytes(),
            );
            for col in &table.columns {
                hasher.update(
                    format!(
                        "COL:{}:{}:{}:{}:{:?}:{:?}:{:?}:{:?}\n",
                        col.position,
                        col.name,
                        col.data_type,
                        col.nullable,
                        col.default_value,
                        col.character_maximum_length,
                        col.collation,
                        col.comment
                    )
                    .as_bytes(),
                );
            }
            for idx in &table.indexes {
                hasher.update(
                    format!(
                        "IDX:{}({}):{}:{}:{}:{:?}\n",
                        idx.name,
                        idx.expressions.join(","),
                        idx.method,
                        idx.unique,
                        idx.primary,
                        idx.comment
                    )
                    .as_bytes(),
                );
            }
            for c in &table.constraints {
                hasher.update(format!("CON:{}:{}\n", c.name, c.definition).as_bytes());
            }
        }

        let mut views: Vec<&View> = views.iter().collect();
        views.sort_by(|a, b| (&a.schema, &a.name).cmp(&(&b.schema, &b.name)));
        for view in views {
            hasher.update(
                format!("VIEW:{}.{}:{}:{:?}\n", view.schema, view.name, view.definition, view.comment).as_bytes(),
            );
        }

        let mut extensions: Vec<&Extension> = extensions.iter().collect();
        extensions.sort_by(|a, b| (&a.schema, &a.name).cmp(&(&b.schema, &b.name)));
        for ext in extensions {
            hasher.update(format!("EXT:{}.{}@{}\n", ext.schema, ext.name, ext.version).as_bytes());
        }

        format!("{:x}", hasher.finalize())
    }

    pub fn table(&self, schema: &str, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.schema == schema && t.name == name)
    }
}

/// Table representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub schema: String,
    pub name: String,
    pub owner: String,
    pub table_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub row_count: i64,
    pub data_size: i64,
    pub index_size: i64,
    pub columns: Vec<Column>,
    pub indexes: Vec<Index>,
    pub constraints: Vec<Constraint>,
}

impl Table {
    /// `schema.table`, the key used to attach indexes and constraints
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Column representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    pub position: i32,
    pub data_type: String,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_maximum_length: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Index representation; `expressions` keeps key order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub name: String,
    pub expressions: Vec<String>,
    pub method: String,
    pub unique: bool,
    pub primary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Table constraint with its catalog definition text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    pub name: String,
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct View {
    pub schema: String,
    pub name: String,
    pub definition: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extension {
    pub name: String,
    pub version: String,
    pub schema: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Result of an instance-level sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMeta {
    pub version: String,
    pub users: Vec<InstanceUser>,
    pub databases: Vec<DatabaseMeta>,
}

/// Server principal with a privilege summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceUser {
    pub name: String,
    pub grant: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseMeta {
    pub name: String,
    pub character_set: String,
    pub collation: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn users_table() -> Table {
        Table {
            schema: "public".to_string(),
            name: "users".to_string(),
            owner: "app".to_string(),
            table_type: "BASE TABLE".to_string(),
            comment: Some("registered users".to_string()),
            row_count: 42,
            data_size: 8192,
            index_size: 16384,
            columns: vec![
                Column {
                    name: "id".to_string(),
                    position: 1,
                    data_type: "integer".to_string(),
                    nullable: false,
                    default_value: Some("nextval('users_id_seq'::regclass)".to_string()),
                    character_maximum_length: None,
                    collation: None,
                    comment: None,
                },
                Column {
                    name: "tags".to_string(),
                    position: 2,
                    data_type: "_text".to_string(),
                    nullable: true,
                    default_value: None,
                    character_maximum_length: None,
                    collation: Some("C".to_string()),
                    comment: Some("free-form".to_string()),
                },
            ],
            indexes: vec![Index {
                name: "users_pkey".to_string(),
                expressions: vec!["id".to_string()],
                method: "btree".to_string(),
                unique: true,
                primary: true,
                comment: None,
            }],
            constraints: vec![Constraint {
                name: "users_pkey".to_string(),
                definition: "PRIMARY KEY (id)".to_string(),
            }],
        }
    }

    fn sample_snapshot() -> SchemaSnapshot {
        SchemaSnapshot::new(
            "app",
            "UTF8",
            "en_US.UTF-8",
            vec![users_table()],
            vec![View {
                schema: "public".to_string(),
                name: "active_users".to_string(),
                definition: " SELECT users.id FROM users;".to_string(),
                comment: None,
            }],
            vec![Extension {
                name: "pgcrypto".to_string(),
                version: "1.3".to_string(),
                schema: "public".to_string(),
                description: Some("cryptographic functions".to_string()),
            }],
        )
    }

    #[test]
    fn test_checksum_consistency() {
        let tables = vec![users_table()];
        let checksum1 = SchemaSnapshot::compute_checksum(&tables, &[], &[]);
        let checksum2 = SchemaSnapshot::compute_checksum(&tables, &[], &[]);
        assert_eq!(checksum1, checksum2);
    }

    #[test]
    fn test_checksum_changes_with_column_type() {
        let mut altered = users_table();
        altered.columns[0].data_type = "bigint".to_string();
        assert_ne!(
            SchemaSnapshot::compute_checksum(&[users_table()], &[], &[]),
            SchemaSnapshot::compute_checksum(&[altered], &[], &[])
        );
    }

    #[test]
    fn test_checksum_covers_index_and_default_attributes() {
        let base = SchemaSnapshot::compute_checksum(&[users_table()], &[], &[]);

        let mut not_unique = users_table();
        not_unique.indexes[0].unique = false;
        assert_ne!(base, SchemaSnapshot::compute_checksum(&[not_unique], &[], &[]));

        let mut no_default = users_table();
        no_default.columns[0].default_value = None;
        assert_ne!(base, SchemaSnapshot::compute_checksum(&[no_default], &[], &[]));

        let mut hash_index = users_table();
        hash_index.indexes[0].method = "hash".to_string();
        assert_ne!(base, SchemaSnapshot::compute_checksum(&[hash_index], &[], &[]));
    }

    #[test]
    fn test_checksum_ignores_statistics_and_object_order() {
        let snapshot = sample_snapshot();
        let mut grown = users_table();
        grown.row_count = 10_000;
        grown.data_size = 1 << 20;
        assert_eq!(
            SchemaSnapshot::compute_checksum(&[grown], &snapshot.views, &snapshot.extensions),
            snapshot.checksum
        );

        let view = |name: &str| View {
            schema: "public".to_string(),
            name: name.to_string(),
            definition: "SELECT 1".to_string(),
            comment: None,
        };
        let ext = |name: &str| Extension {
            name: name.to_string(),
            version: "1.0".to_string(),
            schema: "public".to_string(),
            description: None,
        };
        assert_eq!(
            SchemaSnapshot::compute_checksum(&[], &[view("a"), view("b")], &[ext("x"), ext("y")]),
            SchemaSnapshot::compute_checksum(&[], &[view("b"), view("a")], &[ext("y"), ext("x")])
        );
    }

    #[test]
    fn test_snapshot_json_is_lossless() {
        let snapshot = sample_snapshot();
        let encoded = serde_json::to_string(&snapshot).unwrap();
        let decoded: SchemaSnapshot = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn test_lookup_by_schema_and_name() {
        let snapshot = sample_snapshot();
        assert_eq!(snapshot.table("public", "users").map(|t| t.row_count), Some(42));
        assert!(snapshot.table("audit", "users").is_none());
    }
}
