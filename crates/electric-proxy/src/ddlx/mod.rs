//! The ELECTRIC command vocabulary
//!
//! `ELECTRIC …` statements are a small SQL superset the upstream server
//! never sees. They parse into [`Command`] values, validate against the
//! session's feature flags, and compile into plain SQL (or into pure
//! permission folds) in [`compiler`].

mod compiler;
mod parser;

pub use compiler::{compile, CompiledCommand};
pub use parser::parse_command;

use electric_common::error::{ProxyError, Result};
use electric_common::features::{self, FeatureFlags};
use std::fmt;

use crate::parser::ddl::TableRef;

/// Privilege keyword as written in a GRANT/REVOKE
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Privilege {
    All,
    Read,
    Write,
    Select,
    Insert,
    Update,
    Delete,
}

impl Privilege {
    /// The concrete actions this keyword stands for. `GRANT ALL`
    /// expanding here is what makes (Grant, Revoke) on the same
    /// arguments exact inverses.
    pub fn actions(self) -> &'static [Action] {
        match self {
            Privilege::All => &[Action::Select, Action::Insert, Action::Update, Action::Delete],
            Privilege::Read => &[Action::Select],
            Privilege::Write => &[Action::Insert, Action::Update, Action::Delete],
            Privilege::Select => &[Action::Select],
            Privilege::Insert => &[Action::Insert],
            Privilege::Update => &[Action::Update],
            Privilege::Delete => &[Action::Delete],
        }
    }

    /// Whether any of the expanded actions writes
    pub fn includes_write(self) -> bool {
        self.actions().iter().any(|a| *a != Action::Select)
    }

    fn keyword(self) -> &'static str {
        match self {
            Privilege::All => "ALL",
            Privilege::Read => "READ",
            Privilege::Write => "WRITE",
            Privilege::Select => "SELECT",
            Privilege::Insert => "INSERT",
            Privilege::Update => "UPDATE",
            Privilege::Delete => "DELETE",
        }
    }
}

/// A single grantable action
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub enum Action {
    Select,
    Insert,
    Update,
    Delete,
}

/// The role side of an ASSIGN/UNASSIGN
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RoleExpr {
    /// Scope table for scoped roles: `(projects, …)`
    pub scope: Option<TableRef>,
    pub name: RoleName,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum RoleName {
    /// `'admin'`
    Literal(String),
    /// `user_roles.role_name`
    Column(TableRef, String),
}

/// `table.column` naming where user ids live
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ColumnRef {
    pub table: TableRef,
    pub column: String,
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

impl fmt::Display for RoleExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.scope, &self.name) {
            (Some(scope), name) => write!(f, "({scope}, {name})"),
            (None, name) => write!(f, "{name}"),
        }
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleName::Literal(role) => write!(f, "'{}'", role.replace('\'', "''")),
            RoleName::Column(table, column) => write!(f, "{table}.{column}"),
        }
    }
}

/// A parsed ELECTRIC command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Enable {
        table: TableRef,
    },
    Disable {
        table: TableRef,
    },
    Grant {
        privilege: Privilege,
        table: TableRef,
        role: String,
        columns: Option<Vec<String>>,
        check: Option<String>,
    },
    Revoke {
        privilege: Privilege,
        table: TableRef,
        role: String,
        columns: Option<Vec<String>>,
    },
    Assign {
        role: RoleExpr,
        user: ColumnRef,
        condition: Option<String>,
    },
    Unassign {
        role: RoleExpr,
        user: ColumnRef,
    },
    /// Opaque SQL replayed on satellite databases, never on the server
    SqliteVerbatim {
        body: String,
    },
}

impl Command {
    /// The canonical CommandComplete tag. The single source of truth;
    /// the injector and the tests both read from here.
    pub fn tag(&self) -> &'static str {
        match self {
            Command::Enable { .. } => "ELECTRIC ENABLE",
            Command::Disable { .. } => "ELECTRIC DISABLE",
            Command::Grant { .. } => "ELECTRIC GRANT",
            Command::Revoke { .. } => "ELECTRIC REVOKE",
            Command::Assign { .. } => "ELECTRIC ASSIGN",
            Command::Unassign { .. } => "ELECTRIC UNASSIGN",
            Command::SqliteVerbatim { .. } => "ELECTRIC SQLITE",
        }
    }

    /// The table whose schema must be loaded before this command runs
    pub fn target_table(&self) -> Option<&TableRef> {
        match self {
            Command::Enable { table } | Command::Disable { table } => Some(table),
            Command::Grant { table, .. } | Command::Revoke { table, .. } => Some(table),
            Command::Assign { user, .. } | Command::Unassign { user, .. } => Some(&user.table),
            Command::SqliteVerbatim { .. } => None,
        }
    }

    /// Reject the command if its feature flag is off in this session
    pub fn check_features(&self, flags: &FeatureFlags) -> Result<()> {
        let disabled = |flag: &str| ProxyError::FeatureDisabled {
            command: self.tag().to_string(),
            flag: flag.to_string(),
        };

        match self {
            Command::Enable { .. } | Command::Disable { .. } => Ok(()),
            Command::Grant { privilege, .. } => {
                if !flags.enabled(features::PROXY_DDLX_GRANT) {
                    return Err(disabled(features::PROXY_DDLX_GRANT));
                }
                if privilege.includes_write()
                    && !flags.enabled(features::PROXY_GRANT_WRITE_PERMISSIONS)
                {
                    return Err(disabled(features::PROXY_GRANT_WRITE_PERMISSIONS));
                }
                Ok(())
            }
            Command::Revoke { .. } => {
                if flags.enabled(features::PROXY_DDLX_REVOKE) {
                    Ok(())
                } else {
                    Err(disabled(features::PROXY_DDLX_REVOKE))
                }
            }
            Command::Assign { .. } => {
                if flags.enabled(features::PROXY_DDLX_ASSIGN) {
                    Ok(())
                } else {
                    Err(disabled(features::PROXY_DDLX_ASSIGN))
                }
            }
            Command::Unassign { .. } => {
                if flags.enabled(features::PROXY_DDLX_UNASSIGN) {
                    Ok(())
                } else {
                    Err(disabled(features::PROXY_DDLX_UNASSIGN))
                }
            }
            Command::SqliteVerbatim { .. } => {
                if flags.enabled(features::PROXY_DDLX_SQLITE) {
                    Ok(())
                } else {
                    Err(disabled(features::PROXY_DDLX_SQLITE))
                }
            }
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Enable { table } => write!(f, "ELECTRIC ENABLE {table}"),
            Command::Disable { table } => write!(f, "ELECTRIC DISABLE {table}"),
            Command::Grant {
                privilege,
                table,
                role,
                columns,
                check,
            } => {
                write!(f, "ELECTRIC GRANT {}", privilege.keyword())?;
                if let Some(columns) = columns {
                    write!(f, " ({})", columns.join(", "))?;
                }
                write!(f, " ON {table} TO '{}'", role.replace('\'', "''"))?;
                if let Some(check) = check {
                    write!(f, " WHERE ({check})")?;
                }
                Ok(())
            }
            Command::Revoke {
                privilege,
                table,
                role,
                columns,
            } => {
                write!(f, "ELECTRIC REVOKE {}", privilege.keyword())?;
                if let Some(columns) = columns {
                    write!(f, " ({})", columns.join(", "))?;
                }
                write!(f, " ON {table} FROM '{}'", role.replace('\'', "''"))
            }
            Command::Assign {
                role,
                user,
                condition,
            } => {
                write!(f, "ELECTRIC ASSIGN {role} TO {user}")?;
                if let Some(condition) = condition {
                    write!(f, " IF ({condition})")?;
                }
                Ok(())
            }
            Command::Unassign { role, user } => {
                write!(f, "ELECTRIC UNASSIGN {role} FROM {user}")
            }
            Command::SqliteVerbatim { body } => {
                write!(f, "ELECTRIC SQLITE '{}'", body.replace('\'', "''"))
            }
        }
    }
}
