//! Streaming writer for chunk and snapshot files.

use std::io::Write;
use std::time::SystemTime;

use crc::Digest;
use prost::Message;

use netsy_proto::netsy::{FileCompression, FileFooter, FileHeader, FileKind, Record};

use crate::error::{Error, Result};
use crate::{canonical_record_bytes, frame, CRC64, SCHEMA_VERSION};

/// Writes a header, the declared number of records, and a footer to a sink.
///
/// The header goes to the sink uncompressed; records and footer are routed
/// through a ZSTD encoder when the chosen compression says so. Dropping a
/// writer without calling [`Writer::finish`] produces a file no reader will
/// accept (missing footer), which is the intended failure mode.
pub struct Writer<W: Write> {
    body: BodySink<W>,
    hasher: Digest<'static, u64>,
    records_count: i64,
    first_revision: i64,
    last_revision: i64,
    written: i64,
}

enum BodySink<W: Write> {
    Plain(W),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> BodySink<W> {
    fn as_write(&mut self) -> &mut dyn Write {
        match self {
            BodySink::Plain(w) => w,
            BodySink::Zstd(enc) => enc,
        }
    }

    fn finish(self) -> Result<()> {
        match self {
            BodySink::Plain(mut w) => w.flush()?,
            BodySink::Zstd(enc) => enc.finish()?.flush()?,
        }
        Ok(())
    }
}

impl<W: Write> Writer<W> {
    /// Create a writer with the default compression for the kind: snapshots
    /// are always ZSTD, chunks uncompressed. Use [`Writer::with_compression`]
    /// together with [`crate::smart_compression`] for payload-sized chunks.
    pub fn new(sink: W, kind: FileKind, records_count: i64, leader_id: &str) -> Result<Self> {
        let compression = match kind {
            FileKind::KindSnapshot => FileCompression::CompressionZstd,
            _ => FileCompression::CompressionNone,
        };
        Self::with_compression(sink, kind, records_count, leader_id, compression)
    }

    pub fn with_compression(
        mut sink: W,
        kind: FileKind,
        records_count: i64,
        leader_id: &str,
        compression: FileCompression,
    ) -> Result<Self> {
        let mut header = FileHeader {
            crc: 0,
            schema_version: SCHEMA_VERSION,
            kind: kind as i32,
            compression: compression as i32,
            records_count,
            leader_id: leader_id.to_string(),
            created_at: Some(SystemTime::now().into()),
        };
        header.crc = CRC64.checksum(&header.encode_to_vec());

        // Header always goes out uncompressed.
        frame::write(&mut sink, &header)?;

        let body = match compression {
            FileCompression::CompressionZstd => {
                BodySink::Zstd(zstd::stream::write::Encoder::new(sink, 0)?)
            }
            _ => BodySink::Plain(sink),
        };

        Ok(Self {
            body,
            hasher: CRC64.digest(),
            records_count,
            first_revision: 0,
            last_revision: 0,
            written: 0,
        })
    }

    /// Write one record. Computes and stamps the record CRC, frames the
    /// record into the body, and feeds its canonical bytes to the aggregate
    /// hasher.
    pub fn write(&mut self, record: &Record) -> Result<()> {
        let canonical = canonical_record_bytes(record);
        let mut stamped = record.clone();
        stamped.crc = CRC64.checksum(&canonical);

        frame::write(self.body.as_write(), &stamped)?;
        self.hasher.update(&canonical);

        if self.first_revision == 0 {
            self.first_revision = record.revision;
        }
        self.last_revision = record.revision;
        self.written += 1;

        Ok(())
    }

    /// Emit the footer and flush. Fails if the number of records written does
    /// not match the count declared in the header.
    pub fn finish(mut self) -> Result<()> {
        if self.written != self.records_count {
            return Err(Error::RecordCountMismatch {
                expected: self.records_count,
                actual: self.written,
            });
        }

        let mut footer = FileFooter {
            records_crc: self.hasher.finalize(),
            first_revision: self.first_revision,
            last_revision: self.last_revision,
            crc: 0,
        };
        footer.crc = CRC64.checksum(&footer.encode_to_vec());

        frame::write(self.body.as_write(), &footer)?;
        self.body.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(revision: i64) -> Record {
        Record {
            revision,
            key: format!("key-{revision}").into_bytes(),
            created: true,
            version: 1,
            value: b"value".to_vec(),
            leader_id: "leader-1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_finish_rejects_short_write() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, FileKind::KindChunk, 2, "leader-1").unwrap();
        w.write(&record(1)).unwrap();
        assert!(matches!(
            w.finish(),
            Err(Error::RecordCountMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_finish_rejects_extra_write() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, FileKind::KindChunk, 1, "leader-1").unwrap();
        w.write(&record(1)).unwrap();
        w.write(&record(2)).unwrap();
        assert!(matches!(w.finish(), Err(Error::RecordCountMismatch { .. })));
    }

    #[test]
    fn test_header_is_uncompressed_even_for_snapshots() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, FileKind::KindSnapshot, 1, "leader-1").unwrap();
        w.write(&record(1)).unwrap();
        w.finish().unwrap();

        // The first frame must parse as a plain FileHeader without any
        // decompression.
        let mut cursor = std::io::Cursor::new(&buf);
        let payload = frame::read(&mut cursor).unwrap().unwrap();
        let header = FileHeader::decode(payload.as_slice()).unwrap();
        assert_eq!(header.kind, FileKind::KindSnapshot as i32);
        assert_eq!(
            header.compression,
            FileCompression::CompressionZstd as i32
        );
        assert_eq!(header.records_count, 1);
    }
}
