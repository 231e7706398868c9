//! Errors raised while encoding or validating chunk and snapshot files.

use netsy_proto::netsy::FileKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("file kind mismatch - expected {expected:?}, got {actual:?}")]
    KindMismatch { expected: FileKind, actual: FileKind },

    #[error("unknown compression type in header")]
    UnknownCompression,

    #[error("header CRC {actual} mismatch - expected {expected}")]
    HeaderCrcMismatch { expected: u64, actual: u64 },

    #[error("record {index} CRC {actual} mismatch - expected {expected}")]
    RecordCrcMismatch {
        index: i64,
        expected: u64,
        actual: u64,
    },

    #[error("footer CRC {actual} mismatch - expected {expected}")]
    FooterCrcMismatch { expected: u64, actual: u64 },

    #[error("records CRC {actual} mismatch - expected {expected}")]
    RecordsCrcMismatch { expected: u64, actual: u64 },

    #[error("record count {actual} does not match expected count {expected}")]
    RecordCountMismatch { expected: i64, actual: i64 },

    #[error("unexpected end of file")]
    UnexpectedEof,

    #[error("first revision {actual} does not match footer first revision {expected}")]
    FirstRevisionMismatch { expected: i64, actual: i64 },

    #[error("last revision {actual} does not match footer last revision {expected}")]
    LastRevisionMismatch { expected: i64, actual: i64 },
}
