//! Proxy configuration
//!
//! The proxy is configured entirely through environment variables.
//! Validation collects every fault before reporting, so a misconfigured
//! deployment prints one block naming all offending variables instead of
//! failing one variable at a time.

use crate::features::FeatureFlags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default PostgreSQL wire protocol listen port
pub const DEFAULT_PROXY_PORT: u16 = 65432;

/// Default upper bound for a single synthetic upstream request
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// How the proxy listens for client connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenMode {
    /// Plain TCP on the given port
    Tcp(u16),
    /// TCP on the given port behind the HTTP tunnel collaborator
    HttpTunnel(u16),
}

impl ListenMode {
    pub fn port(&self) -> u16 {
        match self {
            ListenMode::Tcp(port) | ListenMode::HttpTunnel(port) => *port,
        }
    }
}

/// Fully validated proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Client-facing listen mode (`PG_PROXY_PORT`)
    pub listen: ListenMode,
    /// Password clients must present to the proxy (`PG_PROXY_PASSWORD`)
    pub password: String,
    /// Upstream PostgreSQL address, `host:port` (`DATABASE_HOST` / `DATABASE_PORT`)
    pub upstream_addr: String,
    /// Feature flag map (`ELECTRIC_FEATURES`)
    pub features: FeatureFlags,
    /// Frame-level tracing toggle (`PROXY_TRACING_ENABLE`)
    pub tracing_enabled: bool,
    /// Deadline for each synthetic upstream request (`PROXY_QUERY_TIMEOUT`)
    pub query_timeout_secs: u64,
}

/// One offending variable in a failed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFault {
    pub variable: &'static str,
    pub message: String,
}

/// Every fault found during validation; renders the startup error block
#[derive(Debug, Clone)]
pub struct ConfigReport {
    pub faults: Vec<ConfigFault>,
}

impl fmt::Display for ConfigReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", "#".repeat(44))?;
        writeln!(f, "CONFIGURATION ERROR")?;
        writeln!(f)?;
        for fault in &self.faults {
            writeln!(f, "  {}: {}", fault.variable, fault.message)?;
        }
        write!(f, "{}", "#".repeat(44))
    }
}

impl std::error::Error for ConfigReport {}

impl ProxyConfig {
    /// Load and validate from the process environment.
    pub fn from_env() -> Result<Self, ConfigReport> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load and validate from an arbitrary variable source. All faults
    /// are collected before returning.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigReport>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut faults = Vec::new();

        let listen = match lookup("PG_PROXY_PORT") {
            None => ListenMode::Tcp(DEFAULT_PROXY_PORT),
            Some(raw) => match parse_listen_mode(&raw) {
                Ok(mode) => mode,
                Err(message) => {
                    faults.push(ConfigFault {
                        variable: "PG_PROXY_PORT",
                        message,
                    });
                    ListenMode::Tcp(DEFAULT_PROXY_PORT)
                }
            },
        };

        let password = match lookup("PG_PROXY_PASSWORD") {
            Some(p) if !p.is_empty() => p,
            _ => {
                faults.push(ConfigFault {
                    variable: "PG_PROXY_PASSWORD",
                    message: "variable is required and not set".into(),
                });
                String::new()
            }
        };

        let host = lookup("DATABASE_HOST").unwrap_or_else(|| "localhost".into());
        let port = match lookup("DATABASE_PORT") {
            None => 5432,
            Some(raw) => match raw.parse::<u16>() {
                Ok(p) => p,
                Err(_) => {
                    faults.push(ConfigFault {
                        variable: "DATABASE_PORT",
                        message: format!("expected a port number, got {raw:?}"),
                    });
                    5432
                }
            },
        };
        let upstream_addr = format!("{host}:{port}");

        let features = match lookup("ELECTRIC_FEATURES") {
            None => FeatureFlags::none(),
            Some(raw) => match FeatureFlags::parse(&raw) {
                Ok(flags) => flags,
                Err(message) => {
                    faults.push(ConfigFault {
                        variable: "ELECTRIC_FEATURES",
                        message,
                    });
                    FeatureFlags::none()
                }
            },
        };

        let tracing_enabled = match lookup("PROXY_TRACING_ENABLE").as_deref() {
            None => false,
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            Some(other) => {
                faults.push(ConfigFault {
                    variable: "PROXY_TRACING_ENABLE",
                    message: format!("expected a boolean, got {other:?}"),
                });
                false
            }
        };

        let query_timeout_secs = match lookup("PROXY_QUERY_TIMEOUT") {
            None => DEFAULT_QUERY_TIMEOUT_SECS,
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => secs,
                _ => {
                    faults.push(ConfigFault {
                        variable: "PROXY_QUERY_TIMEOUT",
                        message: format!("expected seconds > 0, got {raw:?}"),
                    });
                    DEFAULT_QUERY_TIMEOUT_SECS
                }
            },
        };

        if faults.is_empty() {
            Ok(Self {
                listen,
                password,
                upstream_addr,
                features,
                tracing_enabled,
                query_timeout_secs,
            })
        } else {
            Err(ConfigReport { faults })
        }
    }
}

/// `PG_PROXY_PORT` accepts `<port>` or `http:<port>`; the latter routes
/// the listener through the HTTP tunnel collaborator.
fn parse_listen_mode(raw: &str) -> Result<ListenMode, String> {
    let (tunnel, port_str) = match raw.strip_prefix("http:") {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let port: u16 = port_str
        .parse()
        .map_err(|_| format!("expected a port number, got {raw:?}"))?;
    if port == 0 {
        return Err("port 0 is not a valid listen port".into());
    }
    Ok(if tunnel {
        ListenMode::HttpTunnel(port)
    } else {
        ListenMode::Tcp(port)
    })
}
