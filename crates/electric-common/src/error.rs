//! Error types for the Electric proxy

/// Result type alias using ProxyError
pub type Result<T> = std::result::Result<T, ProxyError>;

/// PostgreSQL SQLSTATE error codes used when rendering errors on the wire
/// See: https://www.postgresql.org/docs/current/errcodes-appendix.html
pub mod sqlstate {
    // Class 08 — Connection Exception
    pub const PROTOCOL_VIOLATION: &str = "08P01";
    pub const CONNECTION_FAILURE: &str = "08006";

    // Class 0A — Feature Not Supported
    pub const FEATURE_NOT_SUPPORTED: &str = "0A000";

    // Class 25 — Invalid Transaction State
    pub const IN_FAILED_SQL_TRANSACTION: &str = "25P02";

    // Class 42 — Syntax Error or Access Rule Violation
    pub const SYNTAX_ERROR: &str = "42601";
    pub const INSUFFICIENT_PRIVILEGE: &str = "42501";
    pub const UNDEFINED_TABLE: &str = "42P01";

    // Class 57 — Operator Intervention
    pub const QUERY_CANCELED: &str = "57014";

    // Class XX — Internal Error
    pub const INTERNAL_ERROR: &str = "XX000";
}

/// Main error type for the proxy
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Wire protocol violation (impossible frame length, unknown tag in a
    /// context that requires one, truncated payload)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A statement batch mixed an ELECTRIC command with ordinary SQL
    #[error("cannot mix ELECTRIC commands with other statements in a single query")]
    MixedBatch,

    /// Malformed ELECTRIC command
    #[error("syntax error at line {line}, column {col}: {message}")]
    Parse {
        line: usize,
        col: usize,
        message: String,
    },

    /// ELECTRIC command whose feature flag is disabled
    #[error("{command} is currently disabled; enable the {flag} feature flag to use it")]
    FeatureDisabled { command: String, flag: String },

    /// Table introspection came back empty or unreadable
    #[error("failed to introspect schema for {table}: {detail}")]
    SchemaIntrospection { table: String, detail: String },

    /// Contradictory or invalid permission change
    #[error("invalid permission change: {0}")]
    Permissions(String),

    /// A synthetic upstream request exceeded its deadline
    #[error("upstream request timed out after {0} seconds")]
    Timeout(u64),

    /// Startup misconfiguration
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket-level failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// The SQLSTATE code used when this error is rendered as an
    /// ErrorResponse frame to the client.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            ProxyError::Protocol(_) => sqlstate::PROTOCOL_VIOLATION,
            ProxyError::MixedBatch => sqlstate::SYNTAX_ERROR,
            ProxyError::Parse { .. } => sqlstate::SYNTAX_ERROR,
            ProxyError::FeatureDisabled { .. } => sqlstate::FEATURE_NOT_SUPPORTED,
            ProxyError::SchemaIntrospection { .. } => sqlstate::UNDEFINED_TABLE,
            ProxyError::Permissions(_) => sqlstate::INSUFFICIENT_PRIVILEGE,
            ProxyError::Timeout(_) => sqlstate::QUERY_CANCELED,
            ProxyError::Config(_) => sqlstate::INTERNAL_ERROR,
            ProxyError::Io(_) => sqlstate::CONNECTION_FAILURE,
        }
    }

    /// Proxy-level failures worth an operator's attention. Socket-level
    /// errors are routine peer disconnects and stay quiet.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProxyError::Protocol(_) | ProxyError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_mapping() {
        assert_eq!(ProxyError::MixedBatch.sqlstate(), "42601");
        assert_eq!(
            ProxyError::Permissions("grant on plain table".into()).sqlstate(),
            "42501"
        );
        assert_eq!(ProxyError::Timeout(5).sqlstate(), "57014");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ProxyError::Protocol("bad length".into()).is_fatal());
        assert!(ProxyError::Timeout(30).is_fatal());
        assert!(!ProxyError::MixedBatch.is_fatal());
        assert!(!ProxyError::FeatureDisabled {
            command: "ELECTRIC GRANT".into(),
            flag: "proxy_ddlx_grant".into()
        }
        .is_fatal());
        let disconnect = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer went away");
        assert!(!ProxyError::Io(disconnect).is_fatal());
    }
}
