//! ELECTRIC command compilation
//!
//! Turns a parsed command plus the loaded schema of its target into the
//! plain SQL the injector runs upstream. Pure function of its inputs.
//! Only electrification touches the server; the permission commands and
//! SQLITE bodies compile to no upstream SQL at all.

use electric_common::error::{ProxyError, Result};

use super::Command;
use crate::schema::TableSchema;

/// Output of compiling one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledCommand {
    /// Statements to run upstream, in order. For `ENABLE`/`DISABLE`
    /// this is exactly one top-level statement; the electrification
    /// procedure owns trigger and shadow-table creation server-side so
    /// that it stays atomic under a single completion.
    pub statements: Vec<String>,
    /// SQL captured for replay on satellite databases only
    pub sqlite_body: Option<String>,
}

impl CompiledCommand {
    fn none() -> Self {
        Self {
            statements: Vec::new(),
            sqlite_body: None,
        }
    }
}

/// Compile `command` against the introspected schema of its target.
/// `schema` is `None` only for commands with no target table.
pub fn compile(command: &Command, schema: Option<&TableSchema>) -> Result<CompiledCommand> {
    match command {
        Command::Enable { table } => {
            let schema = expect_schema(command, schema)?;
            if !schema.has_primary_key() {
                return Err(ProxyError::Permissions(format!(
                    "cannot electrify {table}: table has no primary key"
                )));
            }
            Ok(CompiledCommand {
                statements: vec![format!(
                    "CALL electric.electrify('{}', '{}')",
                    escape(&schema.table.schema),
                    escape(&schema.table.name),
                )],
                sqlite_body: None,
            })
        }
        Command::Disable { table } => {
            let schema = expect_schema(command, schema)?;
            if !schema.electrified {
                return Err(ProxyError::Permissions(format!(
                    "{table} is not electrified"
                )));
            }
            Ok(CompiledCommand {
                statements: vec![format!(
                    "CALL electric.unelectrify('{}', '{}')",
                    escape(&schema.table.schema),
                    escape(&schema.table.name),
                )],
                sqlite_body: None,
            })
        }
        // Permission changes fold into the rules value and persist at
        // commit; nothing runs upstream per command.
        Command::Grant { .. }
        | Command::Revoke { .. }
        | Command::Assign { .. }
        | Command::Unassign { .. } => Ok(CompiledCommand::none()),
        Command::SqliteVerbatim { body } => Ok(CompiledCommand {
            statements: Vec::new(),
            sqlite_body: Some(body.clone()),
        }),
    }
}

fn expect_schema<'a>(
    command: &Command,
    schema: Option<&'a TableSchema>,
) -> Result<&'a TableSchema> {
    schema.ok_or_else(|| {
        ProxyError::Protocol(format!(
            "{} compiled without a loaded schema",
            command.tag()
        ))
    })
}

fn escape(ident: &str) -> String {
    ident.replace('\'', "''")
}
