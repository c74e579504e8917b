//! Table schema metadata.
//!
//! Returned by [`DatabaseConnection::get_table_schema`](super::connection::DatabaseConnection::get_table_schema)
//! and consumed by the mutation builders, which need primary-key and
//! auto-increment information.

use serde::Serialize;

use super::row::Column;

/// Information about a foreign key relationship
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForeignKeyInfo {
    /// Constraint name
    pub name: String,
    /// Columns in the source table
    pub columns: Vec<String>,
    /// Referenced table
    pub ref_table: String,
    /// Referenced columns, positionally matching `columns`
    pub ref_columns: Vec<String>,
    /// `ON DELETE` action
    pub on_delete: String,
    /// `ON UPDATE` action
    pub on_update: String,
}

impl ForeignKeyInfo {
    /// Create a new foreign key info with `NO ACTION` rules
    pub fn new(name: impl Into<String>, ref_table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            ref_table: ref_table.into(),
            ref_columns: Vec::new(),
            on_delete: "NO ACTION".to_string(),
            on_update: "NO ACTION".to_string(),
        }
    }

    /// Append a column pair
    pub fn with_pair(mut self, column: impl Into<String>, ref_column: impl Into<String>) -> Self {
        self.columns.push(column.into());
        self.ref_columns.push(ref_column.into());
        self
    }

    /// Set referential actions
    pub fn with_actions(mut self, on_delete: impl Into<String>, on_update: impl Into<String>) -> Self {
        self.on_delete = on_delete.into();
        self.on_update = on_update.into();
        self
    }
}

/// Information about an index
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexInfo {
    /// Index name
    pub name: String,
    /// Columns included in the index
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness
    pub unique: bool,
    /// Whether this is the primary key index
    pub primary: bool,
    /// Index method (btree, hash, gin, ...)
    pub index_type: String,
}

impl IndexInfo {
    /// Create a new index info
    pub fn new(name: impl Into<String>, columns: Vec<String>, index_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            unique: false,
            primary: false,
            index_type: index_type.into(),
        }
    }

    /// Mark as unique index
    pub fn as_unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Mark as primary key index
    pub fn as_primary(mut self) -> Self {
        self.primary = true;
        self.unique = true;
        self
    }
}

/// Complete schema information for a table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSchema {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub columns: Vec<Column>,
    pub indexes: Vec<IndexInfo>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
    /// Estimated or exact number of rows, `-1` when unknown
    pub row_count: i64,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, schema: Option<String>) -> Self {
        Self {
            name: name.into(),
            schema,
            columns: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            row_count: -1,
        }
    }

    /// Get the fully qualified name (schema.table)
    pub fn full_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.name),
            None => self.name.clone(),
        }
    }

    /// Look up a column by name
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Names of the primary key columns, in table order
    pub fn primary_key_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Copy single-column foreign key targets onto the columns as `table.column`.
    pub fn link_foreign_keys(&mut self) {
        for fk in &self.foreign_keys {
            for (column, ref_column) in fk.columns.iter().zip(&fk.ref_columns) {
                if let Some(col) = self.columns.iter_mut().find(|c| &c.name == column) {
                    col.foreign_key = Some(format!("{}.{}", fk.ref_table, ref_column));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableSchema {
        let mut schema = TableSchema::new("users", None);
        schema.columns = vec![
            Column::new("id", "INTEGER").with_primary_key(true).with_auto_increment(true),
            Column::new("team_id", "INTEGER"),
            Column::new("name", "TEXT").with_nullable(false),
        ];
        schema
    }

    #[test]
    fn test_primary_key_columns() {
        assert_eq!(users().primary_key_columns(), vec!["id"]);
        assert!(users().column("name").is_some_and(|c| !c.nullable));
        assert!(users().column("missing").is_none());
    }

    #[test]
    fn test_full_name() {
        assert_eq!(users().full_name(), "users");
        let schema = TableSchema::new("orders", Some("sales".into()));
        assert_eq!(schema.full_name(), "sales.orders");
    }

    #[test]
    fn test_link_foreign_keys() {
        let mut schema = users();
        schema.foreign_keys.push(
            ForeignKeyInfo::new("fk_team", "teams")
                .with_pair("team_id", "id")
                .with_actions("CASCADE", "NO ACTION"),
        );
        schema.link_foreign_keys();
        assert_eq!(
            schema.column("team_id").and_then(|c| c.foreign_key.clone()),
            Some("teams.id".to_string())
        );
        assert_eq!(schema.column("name").and_then(|c| c.foreign_key.clone()), None);
    }

    #[test]
    fn test_index_builders() {
        let idx = IndexInfo::new("pk", vec!["id".into()], "btree").as_primary();
        assert!(idx.primary && idx.unique);
        let idx = IndexInfo::new("uq", vec!["email".into()], "btree").as_unique();
        assert!(idx.unique && !idx.primary);
    }
}
