//! PostgreSQL v3 wire protocol framing and message types
//!
//! The codec is framing only: it never interprets SQL payloads. Message
//! types the injector does not care about round-trip through the
//! `Other` variants byte-for-byte.

mod codec;
mod messages;

pub use codec::{FrameBuffer, RawFrame, Startup, MAX_FRAME_LEN};
pub use messages::{
    BackendMessage, DescribeTarget, FieldDescription, FrontendMessage, TransactionStatus,
};
