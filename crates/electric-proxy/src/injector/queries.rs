//! Bookkeeping SQL generation
//!
//! The injector never hard-codes the version and rules table names; a
//! query generator supplies the SQL for the version-capture and
//! rules-save statements so deployments (and tests) can redirect them.

use chrono::Utc;

use crate::permissions::Rules;

pub trait QueryGenerator: Send + Sync {
    /// Insert for the version row written at the end of every
    /// transaction that changed electrified schema or permissions
    fn capture_version(&self, version: &str) -> String;

    /// Upsert persisting the folded rules value
    fn save_rules(&self, rules: &Rules) -> String;

    /// Version used when no migration framework supplied one
    fn generate_version(&self) -> String;
}

/// Production generator writing to the proxy's bookkeeping schema
#[derive(Debug, Clone)]
pub struct ServerQueryGenerator {
    pub version_table: String,
    pub rules_table: String,
}

impl Default for ServerQueryGenerator {
    fn default() -> Self {
        Self {
            version_table: "electric.migration_versions".into(),
            rules_table: "electric.permission_rules".into(),
        }
    }
}

impl QueryGenerator for ServerQueryGenerator {
    fn capture_version(&self, version: &str) -> String {
        format!(
            "INSERT INTO {} (version, applied_at, txid) VALUES ('{}', now(), txid_current())",
            self.version_table,
            version.replace('\'', "''"),
        )
    }

    fn save_rules(&self, rules: &Rules) -> String {
        format!(
            "INSERT INTO {} (id, rules, updated_at) VALUES (1, '\\x{}'::bytea, now()) \
             ON CONFLICT (id) DO UPDATE SET rules = EXCLUDED.rules, updated_at = EXCLUDED.updated_at",
            self.rules_table,
            hex(&rules.to_bytes()),
        )
    }

    fn generate_version(&self) -> String {
        // Matches the shape framework-generated versions have, so rows
        // sort correctly next to framework-supplied ones
        Utc::now().format("%Y%m%d%H%M%S%3f").to_string()
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_version_escapes_and_targets_version_table() {
        let generator = ServerQueryGenerator::default();
        let sql = generator.capture_version("2024'0101");
        assert!(sql.starts_with("INSERT INTO electric.migration_versions"));
        assert!(sql.contains("'2024''0101'"));
        assert!(sql.contains("txid_current()"));
    }

    #[test]
    fn test_save_rules_is_a_single_upsert() {
        let generator = ServerQueryGenerator::default();
        let sql = generator.save_rules(&Rules::default());
        assert!(sql.contains("electric.permission_rules"));
        assert!(sql.contains("ON CONFLICT (id) DO UPDATE"));
        assert_eq!(
            crate::parser::ddl::classify_batch(&sql).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_hex_encoding() {
        assert_eq!(hex(&[0x00, 0x7b, 0xff]), "007bff");
    }
}
