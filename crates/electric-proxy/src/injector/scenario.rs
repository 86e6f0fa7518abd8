//! Client scenario capability
//!
//! The injector behaves identically for ad-hoc sessions, migration
//! frameworks and single-statement clients, but it needs to answer two
//! questions about the connection: which protocol is the client
//! speaking, and did a migration-framework marker appear (whose version
//! value should stamp the version-capture row). This is a capability
//! record the injector queries, not a type hierarchy.

use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

/// Ecto's bookkeeping insert, version captured when written literally
static ECTO_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)insert\s+into\s+"?(?:\w+\.)?schema_migrations"?.*?values\s*\(\s*(\d+)"#)
        .unwrap()
});

/// Any touch of the ecto bookkeeping table (parameterised inserts)
static ECTO_TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)insert\s+into\s+"?(?:\w+\.)?schema_migrations"?"#).unwrap());

/// Prisma's bookkeeping insert; the migration name is the version
static PRISMA_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)insert\s+into\s+"?_prisma_migrations"?.*?'((?:[^']|'')+)'"#).unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolMode {
    Simple,
    Extended,
}

/// What the injector has learned about this connection
#[derive(Debug, Default)]
pub struct Scenario {
    protocol: Option<ProtocolMode>,
    framework: bool,
}

impl Scenario {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the shape of the first frame after ReadyForQuery(Idle).
    /// Later frames never change the inferred protocol mid-transaction.
    pub fn observe_protocol(&mut self, mode: ProtocolMode) {
        if self.protocol.is_none() {
            debug!(?mode, "inferred client protocol");
        }
        self.protocol = Some(mode);
    }

    pub fn protocol(&self) -> ProtocolMode {
        self.protocol.unwrap_or(ProtocolMode::Simple)
    }

    pub fn is_extended(&self) -> bool {
        self.protocol() == ProtocolMode::Extended
    }

    pub fn framework_seen(&self) -> bool {
        self.framework
    }

    /// Inspect a statement for migration-framework markers. Returns the
    /// framework-supplied version when one is written literally.
    pub fn observe_statement(&mut self, sql: &str) -> Option<String> {
        if let Some(captures) = ECTO_MARKER.captures(sql) {
            self.framework = true;
            let version = captures[1].to_string();
            debug!(version = %version, "ecto migration version");
            return Some(version);
        }
        if ECTO_TABLE.is_match(sql) {
            self.framework = true;
            return None;
        }
        if let Some(captures) = PRISMA_MARKER.captures(sql) {
            self.framework = true;
            let version = captures[1].replace("''", "'");
            debug!(version = %version, "prisma migration id");
            return Some(version);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_defaults_to_simple() {
        let scenario = Scenario::new();
        assert_eq!(scenario.protocol(), ProtocolMode::Simple);
        assert!(!scenario.is_extended());
    }

    #[test]
    fn test_ecto_version_extraction() {
        let mut scenario = Scenario::new();
        let version = scenario.observe_statement(
            r#"INSERT INTO "schema_migrations" (version, inserted_at) VALUES (20240117103442, now())"#,
        );
        assert_eq!(version.as_deref(), Some("20240117103442"));
        assert!(scenario.framework_seen());
    }

    #[test]
    fn test_parameterised_ecto_insert_marks_framework_without_version() {
        let mut scenario = Scenario::new();
        let version = scenario
            .observe_statement("INSERT INTO schema_migrations (version, inserted_at) VALUES ($1, $2)");
        assert!(version.is_none());
        assert!(scenario.framework_seen());
    }

    #[test]
    fn test_prisma_marker() {
        let mut scenario = Scenario::new();
        let version = scenario.observe_statement(
            r#"INSERT INTO _prisma_migrations (id, migration_name) VALUES ('a1b2c3', '20240117_init')"#,
        );
        assert_eq!(version.as_deref(), Some("a1b2c3"));
        assert!(scenario.framework_seen());
    }

    #[test]
    fn test_ordinary_inserts_are_not_markers() {
        let mut scenario = Scenario::new();
        assert!(scenario
            .observe_statement("INSERT INTO projects (name) VALUES ('migrations')")
            .is_none());
        assert!(!scenario.framework_seen());
    }
}
