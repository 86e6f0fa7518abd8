//! Proxy TCP server
//!
//! Accept loop with keepalive tuning and one session task per client
//! connection. Startup bootstraps the electrified-table registry and
//! the persisted permission rules from the upstream before the first
//! client is accepted.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use socket2::SockRef;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use electric_common::config::ProxyConfig;
use electric_common::error::Result;

use crate::injector::{ElectrifiedRegistry, ServerQueryGenerator};
use crate::permissions::{Rules, RulesStore};
use crate::schema::loader::{electrified_tables_query, global_permissions_query};
use crate::session::{Session, SessionContext};
use crate::upstream;
use crate::wire::FrameBuffer;

const TCP_KEEPALIVE_SECS: u64 = 60;

pub struct ProxyServer {
    config: ProxyConfig,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        Self { config }
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let (registry, rules) = self.bootstrap().await?;

        let ctx = SessionContext {
            upstream_addr: self.config.upstream_addr.clone(),
            flags: self.config.features.clone(),
            registry,
            rules,
            generator: Arc::new(ServerQueryGenerator::default()),
            query_timeout: Duration::from_secs(self.config.query_timeout_secs),
        };

        let addr = format!("0.0.0.0:{}", self.config.listen.port());
        let listener = TcpListener::bind(&addr).await?;
        info!(
            addr = %addr,
            upstream = %self.config.upstream_addr,
            "proxy listening"
        );

        loop {
            let (socket, peer_addr) = listener.accept().await?;
            info!(peer = %peer_addr, "new client connection");
            configure_tcp_keepalive(&socket, TCP_KEEPALIVE_SECS);

            let ctx = ctx.clone();
            tokio::spawn(async move {
                let session = match Session::start(socket, ctx).await {
                    Ok(session) => session,
                    Err(e) => {
                        warn!(peer = %peer_addr, error = %e, "failed to open session");
                        return;
                    }
                };
                if let Err(e) = session.run().await {
                    if e.is_fatal() {
                        error!(peer = %peer_addr, error = %e, "session error");
                    } else {
                        debug!(peer = %peer_addr, error = %e, "session ended");
                    }
                }
            });
        }
    }

    /// Load the electrified-table registry and the persisted rules on
    /// the proxy's own connection before serving clients. A database
    /// without the bookkeeping schema starts empty.
    async fn bootstrap(&self) -> Result<(ElectrifiedRegistry, Arc<RulesStore>)> {
        let registry: ElectrifiedRegistry = Arc::new(RwLock::new(HashSet::new()));
        let mut initial_rules = Rules::default();

        match upstream::connect(&self.config.upstream_addr).await {
            Ok(mut stream) => {
                let mut buffer = FrameBuffer::new();
                // The upstream greets with auth + ReadyForQuery; a
                // trust/local setup needs no credentials from the proxy
                if let Err(e) = wait_until_ready(&mut stream, &mut buffer).await {
                    warn!(error = %e, "bootstrap handshake failed; starting empty");
                    return Ok((registry, RulesStore::new(initial_rules)));
                }

                match upstream::simple_query(&mut stream, &mut buffer, electrified_tables_query())
                    .await
                {
                    Ok(rows) => {
                        let mut set = registry.write();
                        for row in rows {
                            if let Some(Some(key)) = row.first() {
                                set.insert(String::from_utf8_lossy(key).into_owned());
                            }
                        }
                        info!(tables = set.len(), "loaded electrified table registry");
                    }
                    Err(e) => warn!(error = %e, "no electrified-table registry; starting empty"),
                }

                match upstream::simple_query(&mut stream, &mut buffer, global_permissions_query())
                    .await
                {
                    Ok(rows) => {
                        if let Some(Some(raw)) = rows.first().and_then(|r| r.first().cloned()) {
                            match Rules::from_bytes(&raw) {
                                Ok(rules) => {
                                    info!(
                                        grants = rules.grants.len(),
                                        assigns = rules.assigns.len(),
                                        "loaded permission rules"
                                    );
                                    initial_rules = rules;
                                }
                                Err(e) => warn!(error = %e, "stored rules unreadable; starting empty"),
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "no persisted rules; starting empty"),
                }
            }
            Err(e) => {
                warn!(error = %e, "upstream unreachable at startup; registry starts empty");
            }
        }

        Ok((registry, RulesStore::new(initial_rules)))
    }
}

async fn wait_until_ready(
    stream: &mut tokio::net::TcpStream,
    buffer: &mut FrameBuffer,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    // Minimal startup packet for the proxy's own bootstrap connection
    let mut packet = Vec::new();
    packet.extend_from_slice(&[0, 0, 0, 0]);
    packet.extend_from_slice(&196608i32.to_be_bytes());
    packet.extend_from_slice(b"user\0electric\0database\0postgres\0\0");
    let len = packet.len() as i32;
    packet[..4].copy_from_slice(&len.to_be_bytes());
    stream.write_all(&packet).await?;

    loop {
        let frame = upstream::read_frame(stream, buffer).await?;
        match frame.tag {
            b'Z' => return Ok(()),
            // AuthenticationOk carries code 0; anything else means the
            // upstream wants credentials the bootstrap does not have
            b'R' if frame.body.len() >= 4 && frame.body[..4] != [0, 0, 0, 0] => {
                return Err(electric_common::error::ProxyError::Protocol(
                    "upstream requires authentication for the bootstrap connection".into(),
                ))
            }
            b'E' => {
                return Err(electric_common::error::ProxyError::Protocol(
                    "upstream rejected the bootstrap connection".into(),
                ))
            }
            _ => {}
        }
    }
}

/// Configure TCP keepalive so dead clients are noticed before the OS
/// defaults would
pub fn configure_tcp_keepalive(stream: &tokio::net::TcpStream, keepalive_secs: u64) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY: {e}");
    }

    let socket = SockRef::from(stream);
    if let Err(e) = socket.set_keepalive(true) {
        warn!("failed to enable TCP keepalive: {e}");
        return;
    }

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(keepalive_secs))
        .with_interval(Duration::from_secs(keepalive_secs / 2 + 1));

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    let keepalive = keepalive.with_retries(3);

    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        warn!("failed to configure TCP keepalive timing: {e}");
    } else {
        debug!("TCP keepalive configured: {keepalive_secs}s");
    }
}
