//! Upstream server connection helpers
//!
//! Thin utilities over the wire codec for the proxy's own traffic to
//! the PostgreSQL server: the startup-time bootstrap queries and frame
//! writing shared with the session loop.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use electric_common::error::{ProxyError, Result};

use crate::wire::{BackendMessage, FrameBuffer, FrontendMessage, RawFrame};

pub async fn connect(addr: &str) -> Result<TcpStream> {
    debug!(addr, "connecting to upstream");
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Write one undecoded frame verbatim (startup/authentication relay)
pub async fn write_raw_frame<S: tokio::io::AsyncWrite + Unpin>(
    stream: &mut S,
    frame: &RawFrame,
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(5 + frame.body.len());
    buf.extend_from_slice(&[frame.tag]);
    buf.extend_from_slice(&((frame.body.len() as i32 + 4).to_be_bytes()));
    buf.extend_from_slice(&frame.body);
    stream.write_all(&buf).await?;
    Ok(())
}

/// Read bytes until the buffer yields at least one frame
pub async fn read_frame(stream: &mut TcpStream, buffer: &mut FrameBuffer) -> Result<RawFrame> {
    loop {
        if let Some(frame) = buffer.next_frame()? {
            return Ok(frame);
        }
        let mut chunk = [0u8; 8192];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed the connection",
            )));
        }
        buffer.extend(&chunk[..n]);
    }
}

/// Run one simple query on the proxy's own connection and collect the
/// result rows. Used for startup bootstrap, never mid-session.
pub async fn simple_query(
    stream: &mut TcpStream,
    buffer: &mut FrameBuffer,
    sql: &str,
) -> Result<Vec<Vec<Option<Bytes>>>> {
    let mut out = BytesMut::new();
    FrontendMessage::Query {
        sql: sql.to_string(),
    }
    .encode(&mut out);
    stream.write_all(&out).await?;

    let mut rows = Vec::new();
    let mut error: Option<String> = None;
    loop {
        let frame = read_frame(stream, buffer).await?;
        match BackendMessage::decode(frame)? {
            BackendMessage::DataRow { values } => rows.push(values),
            response @ BackendMessage::ErrorResponse { .. } => {
                error = Some(
                    response
                        .primary_message()
                        .unwrap_or("unknown error")
                        .to_string(),
                );
            }
            BackendMessage::ReadyForQuery { .. } => break,
            _ => {}
        }
    }

    match error {
        Some(message) => Err(ProxyError::Protocol(format!(
            "bootstrap query failed: {message}"
        ))),
        None => Ok(rows),
    }
}
