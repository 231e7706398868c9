//! Validating reader for chunk and snapshot files.

use std::io::{BufReader, Read};

use crc::Digest;
use prost::Message;

use netsy_proto::netsy::{FileCompression, FileFooter, FileHeader, FileKind, Record};

use crate::error::{Error, Result};
use crate::{frame, CRC64};

/// What a fully-validated file claimed and contained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSummary {
    pub kind: FileKind,
    pub records_count: i64,
    pub first_revision: i64,
    pub last_revision: i64,
}

/// Reads and validates a data file: header CRC on open, per-record CRC on
/// each [`Reader::read`], and footer CRC, aggregate records CRC, and
/// first/last revisions on [`Reader::finish`].
pub struct Reader<R: Read> {
    body: BodySource<R>,
    hasher: Digest<'static, u64>,
    kind: FileKind,
    expected_count: i64,
    first_revision: i64,
    last_revision: i64,
    read_count: i64,
}

impl<R: Read> std::fmt::Debug for Reader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("kind", &self.kind)
            .field("expected_count", &self.expected_count)
            .field("first_revision", &self.first_revision)
            .field("last_revision", &self.last_revision)
            .field("read_count", &self.read_count)
            .finish()
    }
}

enum BodySource<R: Read> {
    Plain(R),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<R>>),
}

impl<R: Read> BodySource<R> {
    fn as_read(&mut self) -> &mut dyn Read {
        match self {
            BodySource::Plain(r) => r,
            BodySource::Zstd(dec) => dec,
        }
    }
}

impl<R: Read> Reader<R> {
    /// Parse and validate the header, then position the reader at the first
    /// record. `expect_kind` rejects a chunk where a snapshot was expected
    /// and vice versa; `None` accepts either.
    pub fn new(mut source: R, expect_kind: Option<FileKind>) -> Result<Self> {
        let payload = frame::read(&mut source)?.ok_or(Error::UnexpectedEof)?;
        let header = FileHeader::decode(payload.as_slice())?;

        let kind = FileKind::try_from(header.kind).unwrap_or(FileKind::KindUnknown);
        if let Some(expected) = expect_kind {
            if kind != expected {
                return Err(Error::KindMismatch {
                    expected,
                    actual: kind,
                });
            }
        }

        let compression = FileCompression::try_from(header.compression)
            .unwrap_or(FileCompression::CompressionUnknown);
        if compression == FileCompression::CompressionUnknown {
            return Err(Error::UnknownCompression);
        }

        let mut canonical = header.clone();
        canonical.crc = 0;
        let actual = CRC64.checksum(&canonical.encode_to_vec());
        if actual != header.crc {
            return Err(Error::HeaderCrcMismatch {
                expected: header.crc,
                actual,
            });
        }

        let body = match compression {
            FileCompression::CompressionZstd => {
                BodySource::Zstd(zstd::stream::read::Decoder::new(source)?)
            }
            _ => BodySource::Plain(source),
        };

        Ok(Self {
            body,
            hasher: CRC64.digest(),
            kind,
            expected_count: header.records_count,
            first_revision: 0,
            last_revision: 0,
            read_count: 0,
        })
    }

    /// The number of records the header declared.
    pub fn count(&self) -> i64 {
        self.expected_count
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Read and validate the next record. Call exactly [`Reader::count`]
    /// times; hitting EOF earlier is an error.
    pub fn read(&mut self) -> Result<Record> {
        let payload = frame::read(self.body.as_read())?.ok_or(Error::UnexpectedEof)?;
        let record = Record::decode(payload.as_slice())?;

        let mut canonical = record.clone();
        canonical.crc = 0;
        let canonical_bytes = canonical.encode_to_vec();
        let actual = CRC64.checksum(&canonical_bytes);
        if actual != record.crc {
            return Err(Error::RecordCrcMismatch {
                index: self.read_count,
                expected: record.crc,
                actual,
            });
        }
        self.hasher.update(&canonical_bytes);

        if self.first_revision == 0 {
            self.first_revision = record.revision;
        }
        self.last_revision = record.revision;
        self.read_count += 1;

        Ok(record)
    }

    /// Parse the footer and cross-check everything observed while reading:
    /// record count, footer CRC, aggregate records CRC, first and last
    /// revisions.
    pub fn finish(mut self) -> Result<ReadSummary> {
        if self.read_count != self.expected_count {
            return Err(Error::RecordCountMismatch {
                expected: self.expected_count,
                actual: self.read_count,
            });
        }

        let payload = frame::read(self.body.as_read())?.ok_or(Error::UnexpectedEof)?;
        let footer = FileFooter::decode(payload.as_slice())?;

        let mut canonical = footer.clone();
        canonical.crc = 0;
        let actual = CRC64.checksum(&canonical.encode_to_vec());
        if actual != footer.crc {
            return Err(Error::FooterCrcMismatch {
                expected: footer.crc,
                actual,
            });
        }

        let records_crc = self.hasher.finalize();
        if footer.records_crc != records_crc {
            return Err(Error::RecordsCrcMismatch {
                expected: footer.records_crc,
                actual: records_crc,
            });
        }

        if self.first_revision != footer.first_revision {
            return Err(Error::FirstRevisionMismatch {
                expected: footer.first_revision,
                actual: self.first_revision,
            });
        }
        if self.last_revision != footer.last_revision {
            return Err(Error::LastRevisionMismatch {
                expected: footer.last_revision,
                actual: self.last_revision,
            });
        }

        Ok(ReadSummary {
            kind: self.kind,
            records_count: self.read_count,
            first_revision: self.first_revision,
            last_revision: self.last_revision,
        })
    }
}
