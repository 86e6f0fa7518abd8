//! Per-connection session
//!
//! One session per client connection: relays the startup and
//! authentication exchange verbatim, then drives the injector with
//! every frame from either socket. The injector stays synchronous; all
//! awaiting happens here.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use electric_common::error::{sqlstate, ProxyError, Result};
use electric_common::features::FeatureFlags;

use crate::injector::{Actions, ElectrifiedRegistry, Event, Injector, QueryGenerator};
use crate::permissions::RulesStore;
use crate::upstream;
use crate::wire::{
    BackendMessage, FrameBuffer, FrontendMessage, Startup, TransactionStatus,
};

/// Shared collaborators every session starts from
#[derive(Clone)]
pub struct SessionContext {
    pub upstream_addr: String,
    pub flags: FeatureFlags,
    pub registry: ElectrifiedRegistry,
    pub rules: Arc<RulesStore>,
    pub generator: Arc<dyn QueryGenerator>,
    pub query_timeout: Duration,
}

pub struct Session {
    client: TcpStream,
    server: TcpStream,
    client_buf: FrameBuffer,
    server_buf: FrameBuffer,
    injector: Injector,
    rules: Arc<RulesStore>,
    query_timeout: Duration,
    rules_guard: Option<OwnedMutexGuard<()>>,
    peer: String,
}

impl Session {
    pub async fn start(client: TcpStream, ctx: SessionContext) -> Result<Self> {
        let peer = client
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());
        let server = upstream::connect(&ctx.upstream_addr).await?;
        let injector = Injector::new(
            ctx.generator.clone(),
            ctx.flags.clone(),
            ctx.registry.clone(),
            ctx.rules.clone(),
        );
        Ok(Self {
            client,
            server,
            client_buf: FrameBuffer::new(),
            server_buf: FrameBuffer::new(),
            injector,
            rules: ctx.rules,
            query_timeout: ctx.query_timeout,
            rules_guard: None,
            peer,
        })
    }

    /// Drive the connection to completion
    pub async fn run(mut self) -> Result<()> {
        if !self.relay_startup().await? {
            debug!(peer = %self.peer, "cancel request relayed");
            return Ok(());
        }
        info!(peer = %self.peer, "session established");
        let result = self.frame_loop().await;
        self.rules_guard.take();
        result
    }

    /// Forward the startup/authentication exchange verbatim until the
    /// server reports ready. SSL negotiation is declined here; TLS
    /// termination lives in front of the proxy. Returns false when the
    /// connection only carried a cancel request.
    async fn relay_startup(&mut self) -> Result<bool> {
        let mut startup_buf = BytesMut::new();
        loop {
            let packet = loop {
                if let Some(packet) = Startup::next(&mut startup_buf)? {
                    break packet;
                }
                let mut chunk = [0u8; 4096];
                let n = self.client.read(&mut chunk).await?;
                if n == 0 {
                    return Err(disconnect("client closed during startup"));
                }
                startup_buf.extend_from_slice(&chunk[..n]);
            };

            match packet {
                Startup::SslRequest { .. } => {
                    debug!(peer = %self.peer, "declining SSL negotiation");
                    self.client.write_all(b"N").await?;
                }
                Startup::CancelRequest { raw } => {
                    self.server.write_all(&raw).await?;
                    return Ok(false);
                }
                Startup::Protocol { parameters, raw, .. } => {
                    debug!(peer = %self.peer, params = parameters.len(), "relaying startup");
                    self.server.write_all(&raw).await?;
                    break;
                }
            }
        }

        // Authentication exchange passes through untouched until the
        // first ReadyForQuery
        loop {
            tokio::select! {
                frame = upstream::read_frame(&mut self.server, &mut self.server_buf) => {
                    let frame = frame?;
                    let is_ready = frame.tag == b'Z';
                    upstream::write_raw_frame(&mut self.client, &frame).await?;
                    if is_ready {
                        self.client.flush().await?;
                        return Ok(true);
                    }
                }
                read = async {
                    let mut chunk = [0u8; 4096];
                    let n = self.client.read(&mut chunk).await?;
                    Ok::<_, std::io::Error>((n, chunk))
                } => {
                    let (n, chunk) = read?;
                    if n == 0 {
                        return Err(disconnect("client closed during auth"));
                    }
                    self.client_buf.extend(&chunk[..n]);
                    while let Some(frame) = self.client_buf.next_frame()? {
                        upstream::write_raw_frame(&mut self.server, &frame).await?;
                    }
                }
            }
        }
    }

    async fn frame_loop(&mut self) -> Result<()> {
        let mut client_chunk = [0u8; 8192];
        let mut server_chunk = [0u8; 8192];
        loop {
            // Drain any frames already buffered before touching sockets
            if self.pump_buffers().await? {
                return Ok(());
            }

            let awaiting = self.injector.awaiting_synthetic();
            tokio::select! {
                read = self.client.read(&mut client_chunk) => {
                    let n = read?;
                    if n == 0 {
                        return self.client_closed().await;
                    }
                    self.client_buf.extend(&client_chunk[..n]);
                }
                read = self.server.read(&mut server_chunk) => {
                    let n = read?;
                    if n == 0 {
                        return self.server_closed().await;
                    }
                    self.server_buf.extend(&server_chunk[..n]);
                }
                _ = tokio::time::sleep(self.query_timeout), if awaiting => {
                    warn!(peer = %self.peer, "synthetic upstream request timed out");
                    return Err(ProxyError::Timeout(self.query_timeout.as_secs()));
                }
            }
        }
    }

    /// Decode and process every buffered frame. Returns true when the
    /// session is over (client sent Terminate).
    async fn pump_buffers(&mut self) -> Result<bool> {
        loop {
            let mut progressed = false;

            if let Some(frame) = self.client_buf.next_frame()? {
                progressed = true;
                let msg = FrontendMessage::decode(frame)?;
                let terminate = matches!(msg, FrontendMessage::Terminate);
                let actions = self.injector.handle_client(msg)?;
                self.apply(actions).await?;
                if terminate {
                    debug!(peer = %self.peer, "client terminated");
                    return Ok(true);
                }
            }

            if let Some(frame) = self.server_buf.next_frame()? {
                progressed = true;
                let msg = BackendMessage::decode(frame)?;
                let actions = self.injector.handle_server(msg)?;
                self.apply(actions).await?;
            }

            if !progressed {
                return Ok(false);
            }
        }
    }

    async fn apply(&mut self, actions: Actions) -> Result<()> {
        for event in actions.events {
            match event {
                Event::LockRules => {
                    debug!(peer = %self.peer, "acquiring rules persist lock");
                    self.rules_guard = Some(self.rules.lock_for_persist().await);
                }
                Event::ReleaseRules => {
                    self.rules_guard.take();
                }
                Event::SqliteCaptured(body) => {
                    // Handed to the replication pipeline out of band
                    debug!(peer = %self.peer, bytes = body.len(), "captured sqlite migration body");
                }
            }
        }

        if !actions.to_server.is_empty() {
            let mut buf = BytesMut::new();
            for frame in &actions.to_server {
                frame.encode(&mut buf);
            }
            self.server.write_all(&buf).await?;
            self.server.flush().await?;
        }

        if !actions.to_client.is_empty() {
            let mut buf = BytesMut::new();
            for frame in &actions.to_client {
                frame.encode(&mut buf);
            }
            self.client.write_all(&buf).await?;
            self.client.flush().await?;
        }

        Ok(())
    }

    async fn client_closed(&mut self) -> Result<()> {
        debug!(peer = %self.peer, "client closed the connection");
        let mut buf = BytesMut::new();
        FrontendMessage::Terminate.encode(&mut buf);
        let _ = self.server.write_all(&buf).await;
        self.rules_guard.take();
        Ok(())
    }

    async fn server_closed(&mut self) -> Result<()> {
        warn!(peer = %self.peer, "server closed the connection");
        let mut buf = BytesMut::new();
        BackendMessage::error(sqlstate::CONNECTION_FAILURE, "server terminated connection")
            .encode(&mut buf);
        BackendMessage::ReadyForQuery {
            status: TransactionStatus::Idle,
        }
        .encode(&mut buf);
        let _ = self.client.write_all(&buf).await;
        self.rules_guard.take();
        Ok(())
    }
}

fn disconnect(context: &str) -> ProxyError {
    ProxyError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        context.to_string(),
    ))
}
