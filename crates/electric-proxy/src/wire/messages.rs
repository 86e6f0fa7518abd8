//! Typed PostgreSQL wire protocol messages
//!
//! Frontend and backend message types are separate enums because the two
//! directions reuse tag bytes (C, D, E, S). Only the messages the
//! injector inspects are decoded into fields; everything else is carried
//! as `Other { tag, body }` and re-encoded verbatim.
//!
//! See: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use electric_common::error::{ProxyError, Result};

use super::codec::RawFrame;

/// Transaction status carried by ReadyForQuery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
}

impl TransactionStatus {
    pub fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(ProxyError::Protocol(format!(
                "invalid transaction status byte 0x{other:02x}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescribeTarget {
    Statement,
    Portal,
}

impl DescribeTarget {
    fn as_byte(self) -> u8 {
        match self {
            DescribeTarget::Statement => b'S',
            DescribeTarget::Portal => b'P',
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            b'S' => Ok(DescribeTarget::Statement),
            b'P' => Ok(DescribeTarget::Portal),
            other => Err(ProxyError::Protocol(format!(
                "invalid describe/close target 0x{other:02x}"
            ))),
        }
    }
}

/// One column in a RowDescription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_id: i16,
    pub type_oid: i32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

impl FieldDescription {
    /// A text-format column with no table provenance
    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_oid: 0,
            column_id: 0,
            type_oid: 25, // TEXT
            type_size: -1,
            type_modifier: -1,
            format: 0,
        }
    }
}

/// Client → server messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    /// Simple query
    Query { sql: String },
    /// Parse a prepared statement
    Parse {
        statement: String,
        sql: String,
        param_types: Vec<i32>,
    },
    /// Bind a portal to a prepared statement
    Bind {
        portal: String,
        statement: String,
        param_formats: Vec<i16>,
        params: Vec<Option<Bytes>>,
        result_formats: Vec<i16>,
    },
    Describe {
        target: DescribeTarget,
        name: String,
    },
    Execute {
        portal: String,
        max_rows: i32,
    },
    Close {
        target: DescribeTarget,
        name: String,
    },
    Flush,
    Sync,
    Terminate,
    /// Any frontend message the proxy forwards without inspection
    Other { tag: u8, body: Bytes },
}

/// Server → client messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    EmptyQueryResponse,
    PortalSuspended,
    ParameterDescription {
        param_types: Vec<i32>,
    },
    RowDescription {
        fields: Vec<FieldDescription>,
    },
    DataRow {
        values: Vec<Option<Bytes>>,
    },
    CommandComplete {
        tag: String,
    },
    ReadyForQuery {
        status: TransactionStatus,
    },
    /// Fields kept in wire order so re-encoding reproduces input bytes
    ErrorResponse {
        fields: Vec<(u8, String)>,
    },
    NoticeResponse {
        fields: Vec<(u8, String)>,
    },
    /// Any backend message the proxy forwards without inspection
    /// (authentication exchange, ParameterStatus, BackendKeyData, COPY…)
    Other {
        tag: u8,
        body: Bytes,
    },
}

impl FrontendMessage {
    pub fn decode(frame: RawFrame) -> Result<Self> {
        let RawFrame { tag, body } = frame;
        let mut buf = body.clone();
        let msg = match tag {
            b'Q' => FrontendMessage::Query {
                sql: read_cstring(&mut buf)?,
            },
            b'P' => {
                let statement = read_cstring(&mut buf)?;
                let sql = read_cstring(&mut buf)?;
                let count = read_i16(&mut buf)? as usize;
                let mut param_types = Vec::with_capacity(count);
                for _ in 0..count {
                    param_types.push(read_i32(&mut buf)?);
                }
                FrontendMessage::Parse {
                    statement,
                    sql,
                    param_types,
                }
            }
            b'B' => {
                let portal = read_cstring(&mut buf)?;
                let statement = read_cstring(&mut buf)?;
                let format_count = read_i16(&mut buf)? as usize;
                let mut param_formats = Vec::with_capacity(format_count);
                for _ in 0..format_count {
                    param_formats.push(read_i16(&mut buf)?);
                }
                let param_count = read_i16(&mut buf)? as usize;
                let mut params = Vec::with_capacity(param_count);
                for _ in 0..param_count {
                    let len = read_i32(&mut buf)?;
                    if len < 0 {
                        params.push(None);
                    } else {
                        params.push(Some(read_bytes(&mut buf, len as usize)?));
                    }
                }
                let result_count = read_i16(&mut buf)? as usize;
                let mut result_formats = Vec::with_capacity(result_count);
                for _ in 0..result_count {
                    result_formats.push(read_i16(&mut buf)?);
                }
                FrontendMessage::Bind {
                    portal,
                    statement,
                    param_formats,
                    params,
                    result_formats,
                }
            }
            b'D' => FrontendMessage::Describe {
                target: DescribeTarget::from_byte(read_u8(&mut buf)?)?,
                name: read_cstring(&mut buf)?,
            },
            b'E' => FrontendMessage::Execute {
                portal: read_cstring(&mut buf)?,
                max_rows: read_i32(&mut buf)?,
            },
            b'C' => FrontendMessage::Close {
                target: DescribeTarget::from_byte(read_u8(&mut buf)?)?,
                name: read_cstring(&mut buf)?,
            },
            b'H' => FrontendMessage::Flush,
            b'S' => FrontendMessage::Sync,
            b'X' => FrontendMessage::Terminate,
            _ => FrontendMessage::Other { tag, body },
        };
        Ok(msg)
    }

    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            FrontendMessage::Query { sql } => frame(out, b'Q', |b| put_cstring(b, sql)),
            FrontendMessage::Parse {
                statement,
                sql,
                param_types,
            } => frame(out, b'P', |b| {
                put_cstring(b, statement);
                put_cstring(b, sql);
                b.put_i16(param_types.len() as i16);
                for oid in param_types {
                    b.put_i32(*oid);
                }
            }),
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            } => frame(out, b'B', |b| {
                put_cstring(b, portal);
                put_cstring(b, statement);
                b.put_i16(param_formats.len() as i16);
                for f in param_formats {
                    b.put_i16(*f);
                }
                b.put_i16(params.len() as i16);
                for p in params {
                    match p {
                        None => b.put_i32(-1),
                        Some(data) => {
                            b.put_i32(data.len() as i32);
                            b.put_slice(data);
                        }
                    }
                }
                b.put_i16(result_formats.len() as i16);
                for f in result_formats {
                    b.put_i16(*f);
                }
            }),
            FrontendMessage::Describe { target, name } => frame(out, b'D', |b| {
                b.put_u8(target.as_byte());
                put_cstring(b, name);
            }),
            FrontendMessage::Execute { portal, max_rows } => frame(out, b'E', |b| {
                put_cstring(b, portal);
                b.put_i32(*max_rows);
            }),
            FrontendMessage::Close { target, name } => frame(out, b'C', |b| {
                b.put_u8(target.as_byte());
                put_cstring(b, name);
            }),
            FrontendMessage::Flush => frame(out, b'H', |_| {}),
            FrontendMessage::Sync => frame(out, b'S', |_| {}),
            FrontendMessage::Terminate => frame(out, b'X', |_| {}),
            FrontendMessage::Other { tag, body } => frame(out, *tag, |b| b.put_slice(body)),
        }
    }
}

impl BackendMessage {
    pub fn decode(frame: RawFrame) -> Result<Self> {
        let RawFrame { tag, body } = frame;
        let mut buf = body.clone();
        let msg = match tag {
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'n' => BackendMessage::NoData,
            b'I' => BackendMessage::EmptyQueryResponse,
            b's' => BackendMessage::PortalSuspended,
            b't' => {
                let count = read_i16(&mut buf)? as usize;
                let mut param_types = Vec::with_capacity(count);
                for _ in 0..count {
                    param_types.push(read_i32(&mut buf)?);
                }
                BackendMessage::ParameterDescription { param_types }
            }
            b'T' => {
                let count = read_i16(&mut buf)? as usize;
                let mut fields = Vec::with_capacity(count);
                for _ in 0..count {
                    fields.push(FieldDescription {
                        name: read_cstring(&mut buf)?,
                        table_oid: read_i32(&mut buf)?,
                        column_id: read_i16(&mut buf)?,
                        type_oid: read_i32(&mut buf)?,
                        type_size: read_i16(&mut buf)?,
                        type_modifier: read_i32(&mut buf)?,
                        format: read_i16(&mut buf)?,
                    });
                }
                BackendMessage::RowDescription { fields }
            }
            b'D' => {
                let count = read_i16(&mut buf)? as usize;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    let len = read_i32(&mut buf)?;
                    if len < 0 {
                        values.push(None);
                    } else {
                        values.push(Some(read_bytes(&mut buf, len as usize)?));
                    }
                }
                BackendMessage::DataRow { values }
            }
            b'C' => BackendMessage::CommandComplete {
                tag: read_cstring(&mut buf)?,
            },
            b'Z' => BackendMessage::ReadyForQuery {
                status: TransactionStatus::from_byte(read_u8(&mut buf)?)?,
            },
            b'E' => BackendMessage::ErrorResponse {
                fields: read_notice_fields(&mut buf)?,
            },
            b'N' => BackendMessage::NoticeResponse {
                fields: read_notice_fields(&mut buf)?,
            },
            _ => BackendMessage::Other { tag, body },
        };
        Ok(msg)
    }

    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            BackendMessage::ParseComplete => frame(out, b'1', |_| {}),
            BackendMessage::BindComplete => frame(out, b'2', |_| {}),
            BackendMessage::CloseComplete => frame(out, b'3', |_| {}),
            BackendMessage::NoData => frame(out, b'n', |_| {}),
            BackendMessage::EmptyQueryResponse => frame(out, b'I', |_| {}),
            BackendMessage::PortalSuspended => frame(out, b's', |_| {}),
            BackendMessage::ParameterDescription { param_types } => frame(out, b't', |b| {
                b.put_i16(param_types.len() as i16);
                for oid in param_types {
                    b.put_i32(*oid);
                }
            }),
            BackendMessage::RowDescription { fields } => frame(out, b'T', |b| {
                b.put_i16(fields.len() as i16);
                for field in fields {
                    put_cstring(b, &field.name);
                    b.put_i32(field.table_oid);
                    b.put_i16(field.column_id);
                    b.put_i32(field.type_oid);
                    b.put_i16(field.type_size);
                    b.put_i32(field.type_modifier);
                    b.put_i16(field.format);
                }
            }),
            BackendMessage::DataRow { values } => frame(out, b'D', |b| {
                b.put_i16(values.len() as i16);
                for value in values {
                    match value {
                        None => b.put_i32(-1),
                        Some(data) => {
                            b.put_i32(data.len() as i32);
                            b.put_slice(data);
                        }
                    }
                }
            }),
            BackendMessage::CommandComplete { tag } => frame(out, b'C', |b| put_cstring(b, tag)),
            BackendMessage::ReadyForQuery { status } => {
                frame(out, b'Z', |b| b.put_u8(status.as_byte()))
            }
            BackendMessage::ErrorResponse { fields } => {
                frame(out, b'E', |b| put_notice_fields(b, fields))
            }
            BackendMessage::NoticeResponse { fields } => {
                frame(out, b'N', |b| put_notice_fields(b, fields))
            }
            BackendMessage::Other { tag, body } => frame(out, *tag, |b| b.put_slice(body)),
        }
    }

    /// Build an ErrorResponse with severity ERROR, a SQLSTATE and a message
    pub fn error(sqlstate: &str, message: impl Into<String>) -> Self {
        BackendMessage::ErrorResponse {
            fields: vec![
                (b'S', "ERROR".into()),
                (b'C', sqlstate.into()),
                (b'M', message.into()),
            ],
        }
    }

    /// The primary (`M`) field of an ErrorResponse or NoticeResponse
    pub fn primary_message(&self) -> Option<&str> {
        match self {
            BackendMessage::ErrorResponse { fields } | BackendMessage::NoticeResponse { fields } => {
                fields
                    .iter()
                    .find(|(tag, _)| *tag == b'M')
                    .map(|(_, value)| value.as_str())
            }
            _ => None,
        }
    }
}

/// Write `tag` + length-prefixed body, back-patching the length
fn frame<F: FnOnce(&mut BytesMut)>(out: &mut BytesMut, tag: u8, body: F) {
    out.put_u8(tag);
    let len_pos = out.len();
    out.put_i32(0);
    body(out);
    let len = (out.len() - len_pos) as i32;
    out[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_notice_fields(buf: &mut BytesMut, fields: &[(u8, String)]) {
    for (tag, value) in fields {
        buf.put_u8(*tag);
        put_cstring(buf, value);
    }
    buf.put_u8(0);
}

fn read_u8(buf: &mut Bytes) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

fn read_i16(buf: &mut Bytes) -> Result<i16> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    Ok(buf.get_i16())
}

fn read_i32(buf: &mut Bytes) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_i32())
}

fn read_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes> {
    if buf.remaining() < len {
        return Err(truncated());
    }
    Ok(buf.split_to(len))
}

fn read_cstring(buf: &mut Bytes) -> Result<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ProxyError::Protocol("unterminated string in message".into()))?;
    let raw = buf.split_to(end);
    buf.advance(1);
    String::from_utf8(raw.to_vec())
        .map_err(|e| ProxyError::Protocol(format!("invalid UTF-8 in message: {e}")))
}

fn read_notice_fields(buf: &mut Bytes) -> Result<Vec<(u8, String)>> {
    let mut fields = Vec::new();
    loop {
        let tag = read_u8(buf)?;
        if tag == 0 {
            break;
        }
        fields.push((tag, read_cstring(buf)?));
    }
    Ok(fields)
}

fn truncated() -> ProxyError {
    ProxyError::Protocol("truncated message body".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::FrameBuffer;

    fn roundtrip_frontend(msg: FrontendMessage) {
        let mut encoded = BytesMut::new();
        msg.encode(&mut encoded);

        let mut buffer = FrameBuffer::new();
        buffer.extend(&encoded);
        let raw = buffer.next_frame().unwrap().unwrap();
        let decoded = FrontendMessage::decode(raw).unwrap();
        assert_eq!(decoded, msg);

        let mut reencoded = BytesMut::new();
        decoded.encode(&mut reencoded);
        assert_eq!(&reencoded[..], &encoded[..], "bytes changed across round trip");
    }

    fn roundtrip_backend(msg: BackendMessage) {
        let mut encoded = BytesMut::new();
        msg.encode(&mut encoded);

        let mut buffer = FrameBuffer::new();
        buffer.extend(&encoded);
        let raw = buffer.next_frame().unwrap().unwrap();
        let decoded = BackendMessage::decode(raw).unwrap();
        assert_eq!(decoded, msg);

        let mut reencoded = BytesMut::new();
        decoded.encode(&mut reencoded);
        assert_eq!(&reencoded[..], &encoded[..], "bytes changed across round trip");
    }

    #[test]
    fn test_query_roundtrip() {
        roundtrip_frontend(FrontendMessage::Query {
            sql: "SELECT 1".into(),
        });
    }

    #[test]
    fn test_extended_protocol_roundtrip() {
        roundtrip_frontend(FrontendMessage::Parse {
            statement: "s1".into(),
            sql: "INSERT INTO foo VALUES ($1)".into(),
            param_types: vec![23],
        });
        roundtrip_frontend(FrontendMessage::Bind {
            portal: String::new(),
            statement: "s1".into(),
            param_formats: vec![0],
            params: vec![Some(Bytes::from_static(b"42")), None],
            result_formats: vec![],
        });
        roundtrip_frontend(FrontendMessage::Describe {
            target: DescribeTarget::Portal,
            name: String::new(),
        });
        roundtrip_frontend(FrontendMessage::Execute {
            portal: String::new(),
            max_rows: 0,
        });
        roundtrip_frontend(FrontendMessage::Sync);
    }

    #[test]
    fn test_backend_roundtrip() {
        roundtrip_backend(BackendMessage::CommandComplete {
            tag: "CREATE TABLE".into(),
        });
        roundtrip_backend(BackendMessage::ReadyForQuery {
            status: TransactionStatus::InTransaction,
        });
        roundtrip_backend(BackendMessage::RowDescription {
            fields: vec![FieldDescription::text("kind"), FieldDescription::text("name")],
        });
        roundtrip_backend(BackendMessage::DataRow {
            values: vec![Some(Bytes::from_static(b"column")), None],
        });
        roundtrip_backend(BackendMessage::error("42601", "syntax error"));
    }

    #[test]
    fn test_unknown_tag_passes_through_verbatim() {
        // CopyData is not interpreted by the proxy
        roundtrip_frontend(FrontendMessage::Other {
            tag: b'd',
            body: Bytes::from_static(b"1\t2\n"),
        });
        roundtrip_backend(BackendMessage::Other {
            tag: b'K',
            body: Bytes::from_static(&[0, 0, 0, 7, 0, 0, 0, 9]),
        });
    }

    #[test]
    fn test_error_response_preserves_field_order() {
        let msg = BackendMessage::ErrorResponse {
            fields: vec![
                (b'S', "ERROR".into()),
                (b'V', "ERROR".into()),
                (b'C', "42P01".into()),
                (b'M', "relation does not exist".into()),
                (b'H', "did you forget to migrate?".into()),
            ],
        };
        roundtrip_backend(msg.clone());
        assert_eq!(msg.primary_message(), Some("relation does not exist"));
    }
}
