//! Permission rules
//!
//! The global authorization state is a pure value: ordered sets of
//! grants and assignments. ELECTRIC permission commands fold into a new
//! value; nothing mutates in place. Ordered collections keep the
//! serialized bytes identical for identical inputs, which is what the
//! persisted rules row relies on.

pub mod store;

pub use store::RulesStore;

use std::collections::BTreeSet;

use electric_common::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};

use crate::ddlx::{Action, Command, RoleName};
use crate::schema::TableSchema;

/// One granted action on one table for one role
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GrantRule {
    /// Canonical `schema.table` key
    pub table: String,
    pub role: String,
    pub action: Action,
    /// Restricting column list, if the grant named one
    pub columns: Option<Vec<String>>,
    /// Row filter from the WHERE clause, if any
    pub check: Option<String>,
}

/// Where a role spec draws its value from
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoleSpec {
    Literal(String),
    Column { table: String, column: String },
}

/// One role assignment source
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssignRule {
    /// Scope table for scoped roles
    pub scope: Option<String>,
    pub role: RoleSpec,
    pub user_table: String,
    pub user_column: String,
    pub condition: Option<String>,
}

/// The global authorization rules value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rules {
    pub grants: BTreeSet<GrantRule>,
    pub assigns: BTreeSet<AssignRule>,
}

impl Rules {
    /// Deterministic wire form for the persisted rules row
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("rules value always serializes")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            ProxyError::Permissions(format!("stored rules value does not parse: {e}"))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty() && self.assigns.is_empty()
    }
}

/// Fold one permission command into a new rules value.
///
/// `target` is the introspected schema of the command's target table;
/// the caller loads it first. Contradictions (permissions on a table
/// that is not electrified, unknown columns) are rejected here.
pub fn apply(rules: &Rules, command: &Command, target: Option<&TableSchema>) -> Result<Rules> {
    let mut next = rules.clone();
    match command {
        Command::Grant {
            privilege,
            table,
            role,
            columns,
            check,
        } => {
            let schema = electrified_target(command, target)?;
            if let Some(columns) = columns {
                for column in columns {
                    if schema.column(column).is_none() {
                        return Err(ProxyError::Permissions(format!(
                            "column {column} does not exist on {table}"
                        )));
                    }
                }
            }
            for action in privilege.actions() {
                next.grants.insert(GrantRule {
                    table: table.key(),
                    role: role.clone(),
                    action: *action,
                    columns: columns.clone(),
                    check: check.clone(),
                });
            }
        }
        Command::Revoke {
            privilege,
            table,
            role,
            columns,
        } => {
            electrified_target(command, target)?;
            let key = table.key();
            for action in privilege.actions() {
                next.grants.retain(|g| {
                    !(g.table == key
                        && g.role == *role
                        && g.action == *action
                        && g.columns == *columns)
                });
            }
        }
        Command::Assign {
            role,
            user,
            condition,
        } => {
            let schema = electrified_target(command, target)?;
            if schema.column(&user.column).is_none() {
                return Err(ProxyError::Permissions(format!(
                    "column {} does not exist on {}",
                    user.column, user.table
                )));
            }
            next.assigns.insert(AssignRule {
                scope: role.scope.as_ref().map(|t| t.key()),
                role: role_spec(&role.name),
                user_table: user.table.key(),
                user_column: user.column.clone(),
                condition: condition.clone(),
            });
        }
        Command::Unassign { role, user } => {
            electrified_target(command, target)?;
            let scope = role.scope.as_ref().map(|t| t.key());
            let spec = role_spec(&role.name);
            let table = user.table.key();
            next.assigns.retain(|a| {
                !(a.scope == scope
                    && a.role == spec
                    && a.user_table == table
                    && a.user_column == user.column)
            });
        }
        other => {
            return Err(ProxyError::Permissions(format!(
                "{} does not modify permissions",
                other.tag()
            )))
        }
    }
    Ok(next)
}

fn role_spec(name: &RoleName) -> RoleSpec {
    match name {
        RoleName::Literal(role) => RoleSpec::Literal(role.clone()),
        RoleName::Column(table, column) => RoleSpec::Column {
            table: table.key(),
            column: column.clone(),
        },
    }
}

fn electrified_target<'a>(
    command: &Command,
    target: Option<&'a TableSchema>,
) -> Result<&'a TableSchema> {
    let schema = target.ok_or_else(|| {
        ProxyError::Permissions(format!("{} applied without a loaded schema", command.tag()))
    })?;
    if !schema.electrified {
        return Err(ProxyError::Permissions(format!(
            "{}.{} is not electrified",
            schema.table.schema, schema.table.name
        )));
    }
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddlx::Privilege;
    use crate::parser::ddl::{classify_statement, Statement, TableRef};
    use crate::schema::{Column, TableRefValue};

    fn electrified(name: &str, columns: &[&str]) -> TableSchema {
        TableSchema {
            table: TableRefValue {
                schema: "public".into(),
                name: name.into(),
            },
            columns: columns
                .iter()
                .map(|c| Column {
                    name: (*c).into(),
                    type_name: "text".into(),
                    nullable: true,
                    default: None,
                })
                .collect(),
            primary_key: vec![columns[0].into()],
            foreign_keys: vec![],
            electrified: true,
        }
    }

    fn command(sql: &str) -> Command {
        match classify_statement(sql).unwrap() {
            Statement::Electric(command) => command,
            other => panic!("not an ELECTRIC command: {other:?}"),
        }
    }

    #[test]
    fn test_grant_all_expands_to_four_actions() {
        let schema = electrified("projects", &["id", "name"]);
        let rules = apply(
            &Rules::default(),
            &command("ELECTRIC GRANT ALL ON projects TO 'member'"),
            Some(&schema),
        )
        .unwrap();
        assert_eq!(rules.grants.len(), 4);
        assert!(rules.grants.iter().all(|g| g.table == "public.projects"));
    }

    #[test]
    fn test_grant_then_revoke_is_identity() {
        let schema = electrified("projects", &["id", "name"]);
        let base = apply(
            &Rules::default(),
            &command("ELECTRIC GRANT READ ON projects TO 'viewer'"),
            Some(&schema),
        )
        .unwrap();

        let granted = apply(
            &base,
            &command("ELECTRIC GRANT ALL ON projects TO 'member'"),
            Some(&schema),
        )
        .unwrap();
        let restored = apply(
            &granted,
            &command("ELECTRIC REVOKE ALL ON projects FROM 'member'"),
            Some(&schema),
        )
        .unwrap();
        assert_eq!(restored, base);
    }

    #[test]
    fn test_assign_then_unassign_is_identity() {
        let schema = electrified("memberships", &["id", "user_id", "role_name"]);
        let base = Rules::default();

        let assigned = apply(
            &base,
            &command("ELECTRIC ASSIGN (projects, memberships.role_name) TO memberships.user_id"),
            Some(&schema),
        )
        .unwrap();
        assert_eq!(assigned.assigns.len(), 1);

        let restored = apply(
            &assigned,
            &command("ELECTRIC UNASSIGN (projects, memberships.role_name) FROM memberships.user_id"),
            Some(&schema),
        )
        .unwrap();
        assert_eq!(restored, base);
    }

    #[test]
    fn test_grant_on_non_electrified_table_rejected() {
        let mut schema = electrified("projects", &["id"]);
        schema.electrified = false;
        let err = apply(
            &Rules::default(),
            &command("ELECTRIC GRANT ALL ON projects TO 'member'"),
            Some(&schema),
        )
        .unwrap_err();
        assert!(matches!(err, ProxyError::Permissions(_)));
    }

    #[test]
    fn test_grant_unknown_column_rejected() {
        let schema = electrified("projects", &["id", "name"]);
        let err = apply(
            &Rules::default(),
            &command("ELECTRIC GRANT UPDATE (nope) ON projects TO 'member'"),
            Some(&schema),
        )
        .unwrap_err();
        assert!(matches!(err, ProxyError::Permissions(_)));
    }

    #[test]
    fn test_serialization_is_order_independent() {
        let schema = electrified("projects", &["id", "name"]);
        let a = command("ELECTRIC GRANT READ ON projects TO 'viewer'");
        let b = command("ELECTRIC GRANT WRITE ON projects TO 'editor'");

        let ab = apply(&apply(&Rules::default(), &a, Some(&schema)).unwrap(), &b, Some(&schema))
            .unwrap();
        let ba = apply(&apply(&Rules::default(), &b, Some(&schema)).unwrap(), &a, Some(&schema))
            .unwrap();

        assert_eq!(ab, ba);
        assert_eq!(ab.to_bytes(), ba.to_bytes());
    }

    #[test]
    fn test_bytes_round_trip() {
        let schema = electrified("projects", &["id"]);
        let rules = apply(
            &Rules::default(),
            &command("ELECTRIC GRANT ALL ON projects TO 'member' WHERE (owner_id = auth.uid())"),
            Some(&schema),
        )
        .unwrap();
        let bytes = rules.to_bytes();
        assert_eq!(Rules::from_bytes(&bytes).unwrap(), rules);
    }

    #[test]
    fn test_table_keys_are_schema_qualified() {
        let schema = electrified("projects", &["id"]);
        let rules = apply(
            &Rules::default(),
            &Command::Grant {
                privilege: Privilege::Read,
                table: TableRef::new(Some("app"), "projects"),
                role: "viewer".into(),
                columns: None,
                check: None,
            },
            Some(&schema),
        )
        .unwrap();
        assert!(rules.grants.iter().all(|g| g.table == "app.projects"));
    }
}
