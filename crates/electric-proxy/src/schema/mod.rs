//! Table schema value objects
//!
//! Produced only by the loader, immutable once built, cached per
//! transaction keyed by table name.

pub mod loader;

pub use loader::{introspection_query, SchemaCache};

use serde::{Deserialize, Serialize};

use crate::parser::ddl::TableRef;

/// One column, in table order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub type_name: String,
    pub nullable: bool,
    pub default: Option<String>,
}

/// Referential action on a foreign key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefAction {
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl RefAction {
    /// Decode the single-character action code from pg_constraint
    pub fn from_code(code: &str) -> Self {
        match code {
            "r" => RefAction::Restrict,
            "c" => RefAction::Cascade,
            "n" => RefAction::SetNull,
            "d" => RefAction::SetDefault,
            _ => RefAction::NoAction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub referenced_table: TableRefValue,
    pub referenced_columns: Vec<String>,
    pub on_delete: RefAction,
    pub on_update: RefAction,
}

/// Serializable mirror of [`TableRef`] for schema values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRefValue {
    pub schema: String,
    pub name: String,
}

impl From<&TableRef> for TableRefValue {
    fn from(table: &TableRef) -> Self {
        Self {
            schema: table.schema.clone().unwrap_or_else(|| "public".into()),
            name: table.name.clone(),
        }
    }
}

/// The resolved layout of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: TableRefValue,
    pub columns: Vec<Column>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
    /// Whether the table is already registered for replication
    pub electrified: bool,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_primary_key(&self) -> bool {
        !self.primary_key.is_empty()
    }
}
