//! Incremental frame buffer
//!
//! Callers feed raw socket bytes in; the buffer yields complete frames
//! and keeps the residual. The regular stream is `tag byte + i32 length
//! (self-inclusive) + body`; the startup exchange has no tag byte and is
//! handled by [`Startup::next`].

use bytes::{Buf, Bytes, BytesMut};
use electric_common::error::{ProxyError, Result};

/// Frames larger than this are a protocol violation, not a large row
pub const MAX_FRAME_LEN: usize = 1024 * 1024 * 1024;

/// Minimum value of the self-inclusive length word
const MIN_FRAME_LEN: usize = 4;

/// A complete, unparsed frame: tag byte plus body (length word stripped)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub tag: u8,
    pub body: Bytes,
}

/// Reassembles frames from a partially received byte stream
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Yield the next complete frame, or `None` until more bytes arrive
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        if self.buf.len() < 5 {
            return Ok(None);
        }

        let tag = self.buf[0];
        let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        let len = usize::try_from(len)
            .map_err(|_| ProxyError::Protocol(format!("negative frame length {len}")))?;
        if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&len) {
            return Err(ProxyError::Protocol(format!(
                "impossible frame length {len} for tag 0x{tag:02x}"
            )));
        }

        if self.buf.len() < 1 + len {
            return Ok(None);
        }

        self.buf.advance(5);
        let body = self.buf.split_to(len - 4).freeze();
        Ok(Some(RawFrame { tag, body }))
    }

    /// Bytes currently buffered but not yet framed
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Protocol version of a regular startup packet
const PROTOCOL_V3: i32 = 196608;
/// Magic request code for SSL negotiation
const SSL_REQUEST_CODE: i32 = 80877103;
/// Magic request code for query cancellation
const CANCEL_REQUEST_CODE: i32 = 80877102;

/// First packet on a client connection (no tag byte). The session relays
/// these verbatim, so each variant carries the raw packet bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Startup {
    SslRequest {
        raw: Bytes,
    },
    CancelRequest {
        raw: Bytes,
    },
    Protocol {
        version: i32,
        parameters: Vec<(String, String)>,
        raw: Bytes,
    },
}

impl Startup {
    /// Decode the next startup packet out of `buf`, if complete
    pub fn next(buf: &mut BytesMut) -> Result<Option<Self>> {
        if buf.len() < 8 {
            return Ok(None);
        }
        let len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let len = usize::try_from(len)
            .map_err(|_| ProxyError::Protocol(format!("negative startup length {len}")))?;
        if !(8..=MAX_FRAME_LEN).contains(&len) {
            return Err(ProxyError::Protocol(format!(
                "impossible startup packet length {len}"
            )));
        }
        if buf.len() < len {
            return Ok(None);
        }

        let raw = buf.split_to(len).freeze();
        let code = i32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let packet = match code {
            SSL_REQUEST_CODE => Startup::SslRequest { raw },
            CANCEL_REQUEST_CODE => Startup::CancelRequest { raw },
            PROTOCOL_V3 => {
                let parameters = parse_startup_parameters(&raw[8..])?;
                Startup::Protocol {
                    version: code,
                    parameters,
                    raw,
                }
            }
            other => {
                return Err(ProxyError::Protocol(format!(
                    "unknown startup request code {other}"
                )))
            }
        };
        Ok(Some(packet))
    }

    pub fn raw(&self) -> &Bytes {
        match self {
            Startup::SslRequest { raw }
            | Startup::CancelRequest { raw }
            | Startup::Protocol { raw, .. } => raw,
        }
    }
}

fn parse_startup_parameters(mut body: &[u8]) -> Result<Vec<(String, String)>> {
    let mut parameters = Vec::new();
    loop {
        let key = take_cstring(&mut body)?;
        if key.is_empty() {
            break;
        }
        let value = take_cstring(&mut body)?;
        parameters.push((key, value));
    }
    Ok(parameters)
}

fn take_cstring(body: &mut &[u8]) -> Result<String> {
    let end = body
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ProxyError::Protocol("unterminated startup parameter".into()))?;
    let s = String::from_utf8(body[..end].to_vec())
        .map_err(|e| ProxyError::Protocol(format!("invalid UTF-8 in startup packet: {e}")))?;
    *body = &body[end + 1..];
    Ok(s)
}
