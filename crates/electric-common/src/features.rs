//! Proxy feature flags
//!
//! The DDLX permission vocabulary ships behind flags so operators can
//! roll it out table-stakes-first. The map is parsed once from
//! `ELECTRIC_FEATURES` at startup and each session clones it from the
//! validated configuration; nothing mutates it afterwards.

use std::collections::BTreeMap;

/// Flag gating `ELECTRIC GRANT`
pub const PROXY_DDLX_GRANT: &str = "proxy_ddlx_grant";
/// Flag gating `ELECTRIC REVOKE`
pub const PROXY_DDLX_REVOKE: &str = "proxy_ddlx_revoke";
/// Flag gating `ELECTRIC ASSIGN`
pub const PROXY_DDLX_ASSIGN: &str = "proxy_ddlx_assign";
/// Flag gating `ELECTRIC UNASSIGN`
pub const PROXY_DDLX_UNASSIGN: &str = "proxy_ddlx_unassign";
/// Flag gating `ELECTRIC SQLITE`
pub const PROXY_DDLX_SQLITE: &str = "proxy_ddlx_sqlite";
/// Flag additionally gating grants of write privileges
pub const PROXY_GRANT_WRITE_PERMISSIONS: &str = "proxy_grant_write_permissions";

const KNOWN_FLAGS: &[&str] = &[
    PROXY_DDLX_GRANT,
    PROXY_DDLX_REVOKE,
    PROXY_DDLX_ASSIGN,
    PROXY_DDLX_UNASSIGN,
    PROXY_DDLX_SQLITE,
    PROXY_GRANT_WRITE_PERMISSIONS,
];

/// An immutable snapshot of the feature flag map
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    flags: BTreeMap<String, bool>,
}

impl FeatureFlags {
    /// All known flags disabled
    pub fn none() -> Self {
        Self::default()
    }

    /// All known flags enabled (test convenience)
    pub fn all() -> Self {
        let mut flags = BTreeMap::new();
        for flag in KNOWN_FLAGS {
            flags.insert((*flag).to_string(), true);
        }
        Self { flags }
    }

    /// Whether a flag name is one the proxy recognises
    pub fn is_known(name: &str) -> bool {
        KNOWN_FLAGS.contains(&name)
    }

    pub fn enabled(&self, flag: &str) -> bool {
        self.flags.get(flag).copied().unwrap_or(false)
    }

    pub fn set(&mut self, flag: impl Into<String>, value: bool) {
        self.flags.insert(flag.into(), value);
    }

    /// Parse the `ELECTRIC_FEATURES` value: colon-separated `flag=bool`
    /// pairs, e.g. `proxy_ddlx_grant=true:proxy_ddlx_sqlite=false`.
    /// Unknown flags and malformed pairs are reported, not ignored.
    pub fn parse(value: &str) -> Result<Self, String> {
        let mut flags = Self::none();
        for pair in value.split(':').filter(|p| !p.trim().is_empty()) {
            let (name, raw) = pair
                .split_once('=')
                .ok_or_else(|| format!("expected flag=bool, got {pair:?}"))?;
            let name = name.trim();
            if !Self::is_known(name) {
                return Err(format!("unknown feature flag {name:?}"));
            }
            let enabled = match raw.trim() {
                "true" | "1" => true,
                "false" | "0" => false,
                other => return Err(format!("expected boolean for {name}, got {other:?}")),
            };
            flags.set(name, enabled);
        }
        Ok(flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pairs() {
        let flags =
            FeatureFlags::parse("proxy_ddlx_grant=true:proxy_ddlx_sqlite=0").unwrap();
        assert!(flags.enabled(PROXY_DDLX_GRANT));
        assert!(!flags.enabled(PROXY_DDLX_SQLITE));
        assert!(!flags.enabled(PROXY_DDLX_ASSIGN));
    }

    #[test]
    fn test_parse_rejects_unknown_flag() {
        let err = FeatureFlags::parse("proxy_ddlx_frobnicate=true").unwrap_err();
        assert!(err.contains("unknown feature flag"));
    }

    #[test]
    fn test_parse_rejects_malformed_pair() {
        assert!(FeatureFlags::parse("proxy_ddlx_grant").is_err());
        assert!(FeatureFlags::parse("proxy_ddlx_grant=maybe").is_err());
    }

    #[test]
    fn test_clones_are_isolated() {
        let mut original = FeatureFlags::none();
        let session_copy = original.clone();
        original.set(PROXY_DDLX_GRANT, true);
        assert!(!session_copy.enabled(PROXY_DDLX_GRANT));
        assert!(original.enabled(PROXY_DDLX_GRANT));
    }
}
