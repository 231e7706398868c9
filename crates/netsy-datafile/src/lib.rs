//! Reader and writer for Netsy data files.
//!
//! A `.netsy` file is a size-delimited sequence of framed protobuf messages:
//! one `FileHeader`, then the declared number of `Record`s, then one
//! `FileFooter`. The header is always written uncompressed; the records and
//! footer pass through ZSTD when the header declares it.
//!
//! Integrity is layered:
//!
//! - every message carries a CRC-64 (ECMA polynomial) over its own canonical
//!   bytes (serialized with `crc = 0`), catching individual corruption;
//! - the footer carries an aggregate CRC over all records' canonical bytes in
//!   file order, catching missing, duplicated, reordered, or truncated
//!   records that per-record checks cannot see.
//!
//! CRC-64 rather than a cryptographic hash: the threat model is accidental
//! corruption, not tampering, and the checksum sits on the commit path.

pub mod error;
pub mod reader;
pub mod writer;

use crc::{Crc, CRC_64_XZ};
use prost::Message;

use netsy_proto::netsy::{FileCompression, FileKind, Record};

pub use error::{Error, Result};
pub use reader::{ReadSummary, Reader};
pub use writer::Writer;

/// Current file format revision, stamped into every header.
pub const SCHEMA_VERSION: u32 = 1;

/// Chunks whose key+value payload exceeds this are worth compressing.
pub const CHUNK_COMPRESSION_MIN_BYTES: usize = 4096;

/// The checksum used throughout the format: CRC-64 with the ECMA polynomial.
pub static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Serialize a record with its `crc` field zeroed. These bytes are both the
/// input to the record's own CRC and the unit fed to the aggregate hasher.
pub fn canonical_record_bytes(record: &Record) -> Vec<u8> {
    let mut clone = record.clone();
    clone.crc = 0;
    clone.encode_to_vec()
}

/// Compute the CRC-64 of a record's canonical bytes.
pub fn record_crc(record: &Record) -> u64 {
    CRC64.checksum(&canonical_record_bytes(record))
}

/// Pick the compression for a file the way the leader does: snapshots are
/// always compressed, chunks only when the payload is large enough to be
/// worth the cycles.
pub fn smart_compression(kind: FileKind, records: &[Record]) -> FileCompression {
    if kind == FileKind::KindSnapshot {
        return FileCompression::CompressionZstd;
    }
    let payload: usize = records
        .iter()
        .map(|r| r.key.len() + r.value.len())
        .sum();
    if payload > CHUNK_COMPRESSION_MIN_BYTES {
        FileCompression::CompressionZstd
    } else {
        FileCompression::CompressionNone
    }
}

pub(crate) mod frame {
    //! Varint-size-delimited protobuf framing over `std::io` streams.

    use std::io::{Read, Write};

    use super::{Error, Result};

    /// Write one length-delimited message frame.
    pub fn write<W: Write + ?Sized, M: prost::Message>(out: &mut W, msg: &M) -> Result<()> {
        let buf = msg.encode_length_delimited_to_vec();
        out.write_all(&buf)?;
        Ok(())
    }

    /// Read one frame's payload. Returns `None` on clean EOF at a frame
    /// boundary; EOF inside a frame is an error.
    pub fn read<R: Read + ?Sized>(input: &mut R) -> Result<Option<Vec<u8>>> {
        let len = match read_varint(input)? {
            Some(len) => len,
            None => return Ok(None),
        };
        let mut payload = vec![0u8; len as usize];
        input
            .read_exact(&mut payload)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Error::UnexpectedEof,
                _ => Error::Io(e),
            })?;
        Ok(Some(payload))
    }

    fn read_varint<R: Read + ?Sized>(input: &mut R) -> Result<Option<u64>> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        let mut first = true;
        loop {
            let mut byte = [0u8; 1];
            match input.read_exact(&mut byte) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    if first {
                        return Ok(None);
                    }
                    return Err(Error::UnexpectedEof);
                }
                Err(e) => return Err(Error::Io(e)),
            }
            first = false;
            value |= u64::from(byte[0] & 0x7f) << shift;
            if byte[0] & 0x80 == 0 {
                return Ok(Some(value));
            }
            shift += 7;
            if shift >= 64 {
                return Err(Error::Decode(prost::DecodeError::new(
                    "frame length varint overflows u64",
                )));
            }
        }
    }
}
