//! # Wire — DriftKV protocol types and codec
//!
//! Everything that crosses the fabric between an LTC (compute node) and a
//! StoC (storage node) is defined here: the message taxonomy, the shared
//! protocol structs, and the byte-level codec.
//!
//! ## Framing rules
//!
//! - Every message starts with a 1-byte type tag ([`MsgType`]) followed by a
//!   type-specific payload.
//! - Multibyte integers are fixed-width little-endian.
//! - Strings and byte strings are varint(length)-prefixed (LEB128).
//! - Replicated log records carry a per-record CRC32 so a log buffer can be
//!   scanned back after a crash (see [`log`]).
//!
//! Decoding is total: a truncated payload or unknown tag yields a
//! [`WireError`], never a panic. The compute and storage sides share this
//! crate, so an encode/decode mismatch is impossible by construction.

mod codec;
mod compaction;
mod log;
mod msg;
mod types;

pub use codec::{
    get_bool, get_bytes, get_str, get_u32, get_u64, get_u8, get_varint, put_bool, put_bytes,
    put_str, put_u32, put_u64, put_u8, put_varint,
};
pub use compaction::CompactionRequest;
pub use log::{batch_len, decode_log_batch, encode_log_batch, LogRecord};
pub use msg::{Message, MsgType};
pub use types::{
    DcStats, FileMetaData, RTableHandle, SSTableRTablePair, SubRange, LOG_ARENA_RTABLE_ID,
};

use thiserror::Error;

/// Errors produced while decoding wire bytes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// The buffer ended before the payload was complete.
    #[error("truncated payload")]
    Truncated,

    /// The leading type byte is not a known message tag.
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),

    /// A varint ran past 10 bytes or past the end of the buffer.
    #[error("malformed varint")]
    BadVarint,

    /// A length-prefixed string was not valid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    /// A CRC32 check failed or a structural invariant did not hold.
    #[error("corrupt payload")]
    Corrupt,
}
