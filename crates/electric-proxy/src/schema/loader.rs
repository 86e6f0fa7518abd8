//! Schema introspection
//!
//! One bundled catalog query per table resolves columns, primary key,
//! foreign keys and electrification status in a single round trip. The
//! injector runs the query on the session's server connection, hides
//! the reply from the client, and hands the accumulated rows to
//! [`parse_schema`]. Results are cached for the life of the transaction.

use std::collections::HashMap;

use electric_common::error::{ProxyError, Result};
use tracing::debug;

use super::{Column, ForeignKey, RefAction, TableRefValue, TableSchema};
use crate::parser::ddl::TableRef;

/// The bundled introspection SQL for one table.
///
/// Every result row is `(kind, f1, f2, f3, f4, f5)` in text format:
///
/// | kind          | f1            | f2               | f3          | f4        | f5        |
/// |---------------|---------------|------------------|-------------|-----------|-----------|
/// | `column`      | name          | type             | nullable t/f| default   |           |
/// | `pk`          | column name   |                  |             |           |           |
/// | `fk`          | local cols    | referenced table | ref cols    | del code  | upd code  |
/// | `electrified` | t/f           |                  |             |           |           |
///
/// Multi-column lists are comma-joined in attnum order.
pub fn introspection_query(table: &TableRef) -> String {
    let schema = escape(table.schema.as_deref().unwrap_or("public"));
    let name = escape(&table.name);
    format!(
        "SELECT 'column' AS kind, a.attname::text AS f1, \
                format_type(a.atttypid, a.atttypmod) AS f2, \
                CASE WHEN a.attnotnull THEN 'f' ELSE 't' END AS f3, \
                pg_get_expr(d.adbin, d.adrelid) AS f4, NULL::text AS f5 \
         FROM pg_attribute a \
         LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum \
         WHERE a.attrelid = to_regclass('{schema}.{name}') \
           AND a.attnum > 0 AND NOT a.attisdropped \
         UNION ALL \
         SELECT 'pk', a.attname::text, NULL, NULL, NULL, NULL \
         FROM pg_index i \
         JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
         WHERE i.indrelid = to_regclass('{schema}.{name}') AND i.indisprimary \
         UNION ALL \
         SELECT 'fk', \
                (SELECT string_agg(att.attname, ',' ORDER BY k.ord) \
                 FROM unnest(c.conkey) WITH ORDINALITY AS k(attnum, ord) \
                 JOIN pg_attribute att ON att.attrelid = c.conrelid AND att.attnum = k.attnum), \
                c.confrelid::regclass::text, \
                (SELECT string_agg(att.attname, ',' ORDER BY k.ord) \
                 FROM unnest(c.confkey) WITH ORDINALITY AS k(attnum, ord) \
                 JOIN pg_attribute att ON att.attrelid = c.confrelid AND att.attnum = k.attnum), \
                c.confdeltype::text, c.confupdtype::text \
         FROM pg_constraint c \
         WHERE c.conrelid = to_regclass('{schema}.{name}') AND c.contype = 'f' \
         UNION ALL \
         SELECT 'electrified', \
                CASE WHEN EXISTS (SELECT 1 FROM electric.electrified e \
                                  WHERE e.schema_name = '{schema}' AND e.table_name = '{name}') \
                     THEN 't' ELSE 'f' END, NULL, NULL, NULL, NULL"
    )
}

/// Build a [`TableSchema`] from the introspection result rows.
/// A table with no `column` rows does not exist.
pub fn parse_schema(table: &TableRef, rows: &[Vec<Option<String>>]) -> Result<TableSchema> {
    let mut columns = Vec::new();
    let mut primary_key = Vec::new();
    let mut foreign_keys = Vec::new();
    let mut electrified = false;

    for row in rows {
        let kind = field(row, 0).unwrap_or_default();
        match kind.as_str() {
            "column" => columns.push(Column {
                name: required(table, row, 1, "column name")?,
                type_name: required(table, row, 2, "column type")?,
                nullable: field(row, 3).as_deref() == Some("t"),
                default: field(row, 4),
            }),
            "pk" => primary_key.push(required(table, row, 1, "primary key column")?),
            "fk" => foreign_keys.push(ForeignKey {
                columns: split_list(&required(table, row, 1, "fk columns")?),
                referenced_table: parse_regclass(&required(table, row, 2, "fk target")?),
                referenced_columns: split_list(&required(table, row, 3, "fk target columns")?),
                on_delete: RefAction::from_code(field(row, 4).as_deref().unwrap_or("a")),
                on_update: RefAction::from_code(field(row, 5).as_deref().unwrap_or("a")),
            }),
            "electrified" => electrified = field(row, 1).as_deref() == Some("t"),
            other => {
                return Err(ProxyError::SchemaIntrospection {
                    table: table.to_string(),
                    detail: format!("unexpected row kind {other:?}"),
                })
            }
        }
    }

    if columns.is_empty() {
        return Err(ProxyError::SchemaIntrospection {
            table: table.to_string(),
            detail: "table does not exist".into(),
        });
    }

    debug!(
        table = %table,
        columns = columns.len(),
        pk = primary_key.len(),
        fks = foreign_keys.len(),
        electrified,
        "introspected table"
    );

    Ok(TableSchema {
        table: TableRefValue::from(table),
        columns,
        primary_key,
        foreign_keys,
        electrified,
    })
}

fn field(row: &[Option<String>], index: usize) -> Option<String> {
    row.get(index).and_then(|v| v.clone())
}

fn required(table: &TableRef, row: &[Option<String>], index: usize, what: &str) -> Result<String> {
    field(row, index).ok_or_else(|| ProxyError::SchemaIntrospection {
        table: table.to_string(),
        detail: format!("missing {what} in introspection row"),
    })
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `regclass::text` prints `name` for tables on the search path and
/// `schema.name` otherwise
fn parse_regclass(raw: &str) -> TableRefValue {
    match raw.split_once('.') {
        Some((schema, name)) => TableRefValue {
            schema: unquote(schema),
            name: unquote(name),
        },
        None => TableRefValue {
            schema: "public".into(),
            name: unquote(raw),
        },
    }
}

fn unquote(part: &str) -> String {
    part.trim_matches('"').replace("\"\"", "\"")
}

fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

/// Registry bootstrap: every table currently electrified, one
/// `schema.table` key per row
pub fn electrified_tables_query() -> &'static str {
    "SELECT schema_name || '.' || table_name FROM electric.electrified ORDER BY 1"
}

/// The persisted global permission rules row
pub fn global_permissions_query() -> &'static str {
    "SELECT rules FROM electric.permission_rules WHERE id = 1"
}

/// Per-transaction schema cache; dropped on every return to idle
#[derive(Debug, Default)]
pub struct SchemaCache {
    entries: HashMap<String, TableSchema>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, table: &TableRef) -> Option<&TableSchema> {
        self.entries.get(&table.key())
    }

    pub fn insert(&mut self, table: &TableRef, schema: TableSchema) {
        self.entries.insert(table.key(), schema);
    }

    /// Flip the electrification marker after an ENABLE/DISABLE ran in
    /// the current transaction
    pub fn set_electrified(&mut self, table: &TableRef, electrified: bool) {
        if let Some(schema) = self.entries.get_mut(&table.key()) {
            schema.electrified = electrified;
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
