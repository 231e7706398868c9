//! Object-store adapter.
//!
//! Everything Netsy persists durably goes through here: one chunk object per
//! committed record, one snapshot object per threshold crossing. The adapter
//! is a thin, opinionated layer over `Arc<dyn ObjectStore>` so tests swap in
//! `object_store::memory::InMemory` and production uses `AmazonS3Builder`.

pub mod error;
pub mod keys;

use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, WriteMultipart};
use tracing::{debug, info, warn};

use netsy_datafile::{smart_compression, Writer};
use netsy_proto::netsy::{FileKind, Record};

pub use error::{Error, Result};
pub use keys::Layout;

/// Files up to this size are downloaded straight into memory.
const MAX_MEMORY_DOWNLOAD: i64 = 2 * 1024 * 1024;

/// Multipart part size for uploads and the threshold above which uploads go
/// multipart.
const MULTIPART_PART_SIZE: usize = 5 * 1024 * 1024;

/// Concurrent in-flight parts during multipart transfers.
const MULTIPART_CONCURRENCY: usize = 3;

const SMALL_DOWNLOAD_ATTEMPTS: u32 = 3;
const SMALL_DOWNLOAD_BASE_DELAY: Duration = Duration::from_millis(100);

/// Metadata about a chunk or snapshot object, from a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub key: Path,
    pub size: i64,
    pub revision: i64,
}

/// A downloaded file, readable synchronously by the data file codec: small
/// objects buffered in memory, large objects spooled to a temp file.
pub enum DownloadedFile {
    Memory(Cursor<Bytes>),
    File(std::fs::File),
}

impl Read for DownloadedFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            DownloadedFile::Memory(cursor) => cursor.read(buf),
            DownloadedFile::File(file) => file.read(buf),
        }
    }
}

/// The chunk/snapshot store.
pub struct S3Store {
    store: Arc<dyn ObjectStore>,
    layout: Layout,
    instance_id: String,
}

impl S3Store {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: Option<String>, instance_id: String) -> Self {
        Self {
            store,
            layout: Layout::new(prefix),
            instance_id,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Conditionally create a chunk object: fails with `AlreadyExists` if the
    /// key is taken, which is what makes retried commits idempotent.
    pub async fn put_chunk(&self, key: &Path, data: Bytes) -> std::result::Result<(), object_store::Error> {
        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        self.store
            .put_opts(key, PutPayload::from(data), opts)
            .await?;
        Ok(())
    }

    /// Encode a committed record as a one-record chunk and upload it, with a
    /// single retry. An `AlreadyExists` on the retry means the first attempt
    /// landed and only its acknowledgement was lost, so it counts as
    /// success; `AlreadyExists` on the first attempt is a real conflict.
    pub async fn write_record(&self, record: &Record) -> Result<()> {
        let records = std::slice::from_ref(record);
        let compression = smart_compression(FileKind::KindChunk, records);
        let mut buf = Vec::new();
        let mut writer = Writer::with_compression(
            &mut buf,
            FileKind::KindChunk,
            1,
            &self.instance_id,
            compression,
        )?;
        writer.write(record)?;
        writer.finish()?;

        let key = self.layout.chunk_key(record.revision);
        let data = Bytes::from(buf);

        match self.put_chunk(&key, data.clone()).await {
            Ok(()) => {}
            Err(err @ object_store::Error::AlreadyExists { .. }) => {
                return Err(Error::ObjectStore(err));
            }
            Err(first_err) => {
                debug!(key = %key, error = %first_err, "chunk upload failed, retrying once");
                match self.put_chunk(&key, data).await {
                    Ok(()) => {
                        info!(key = %key, "chunk upload succeeded on retry");
                    }
                    Err(object_store::Error::AlreadyExists { .. }) => {
                        info!(key = %key, "chunk already present on retry, first attempt landed");
                    }
                    Err(source) => {
                        return Err(Error::UploadFailed {
                            key: key.to_string(),
                            source,
                        });
                    }
                }
            }
        }

        debug!(revision = record.revision, key = %key, "record written to object store");
        Ok(())
    }

    /// Upload a local file, multipart above the part-size threshold. Used by
    /// the snapshot worker.
    pub async fn upload_file(&self, key: &Path, path: &std::path::Path) -> Result<()> {
        let metadata = tokio::fs::metadata(path).await?;
        let size = metadata.len();
        debug!(key = %key, size, "uploading file to object store");

        if size <= MULTIPART_PART_SIZE as u64 {
            let data = tokio::fs::read(path).await?;
            self.store.put(key, PutPayload::from(data)).await?;
        } else {
            use tokio::io::AsyncReadExt;

            let upload = self.store.put_multipart(key).await?;
            let mut writer = WriteMultipart::new_with_chunk_size(upload, MULTIPART_PART_SIZE);
            let mut file = tokio::fs::File::open(path).await?;
            let mut buf = vec![0u8; MULTIPART_PART_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                writer.wait_for_capacity(MULTIPART_CONCURRENCY).await?;
                writer.write(&buf[..n]);
            }
            writer.finish().await?;
        }

        info!(key = %key, size, "file uploaded to object store");
        Ok(())
    }

    /// Download an object, choosing the strategy by size: small files are
    /// buffered in memory with bounded retries, large files are streamed to
    /// a temp file under `data_dir` (registered in `temp_files` so the
    /// caller can clean up on every exit path).
    pub async fn download_file(
        &self,
        key: &Path,
        size: i64,
        data_dir: &std::path::Path,
        temp_files: &mut Vec<PathBuf>,
    ) -> Result<DownloadedFile> {
        if size > MAX_MEMORY_DOWNLOAD {
            self.download_large_file(key, data_dir, temp_files).await
        } else {
            self.download_small_file(key).await
        }
    }

    async fn download_small_file(&self, key: &Path) -> Result<DownloadedFile> {
        debug!(key = %key, "downloading small file to memory");

        let mut last_err = None;
        for attempt in 0..SMALL_DOWNLOAD_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(SMALL_DOWNLOAD_BASE_DELAY * attempt).await;
            }
            match self.store.get(key).await {
                Ok(result) => match result.bytes().await {
                    Ok(bytes) => return Ok(DownloadedFile::Memory(Cursor::new(bytes))),
                    Err(err) => {
                        debug!(key = %key, attempt = attempt + 1, error = %err, "small file download attempt failed");
                        last_err = Some(err);
                    }
                },
                Err(err) => {
                    debug!(key = %key, attempt = attempt + 1, error = %err, "small file download attempt failed");
                    last_err = Some(err);
                }
            }
        }

        Err(Error::DownloadFailed {
            key: key.to_string(),
            attempts: SMALL_DOWNLOAD_ATTEMPTS,
            source: last_err.expect("at least one attempt ran"),
        })
    }

    async fn download_large_file(
        &self,
        key: &Path,
        data_dir: &std::path::Path,
        temp_files: &mut Vec<PathBuf>,
    ) -> Result<DownloadedFile> {
        use tokio::io::AsyncWriteExt;

        debug!(key = %key, "downloading large file to disk");

        let prefix = if key.as_ref().contains("snapshots/") {
            "snapshot_"
        } else {
            "chunk_"
        };
        let temp = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(keys::FILE_SUFFIX)
            .tempfile_in(data_dir)?;
        // Keep the file on disk; the caller removes it when done.
        let (_, temp_path) = temp.keep().map_err(|e| Error::Io(e.error))?;
        temp_files.push(temp_path.clone());

        let result = self.store.get(key).await?;
        let mut stream = result.into_stream();
        let mut file = tokio::fs::File::create(&temp_path).await?;
        while let Some(part) = stream.next().await {
            file.write_all(&part?).await?;
        }
        file.flush().await?;
        drop(file);

        debug!(key = %key, path = %temp_path.display(), "large file download succeeded");
        Ok(DownloadedFile::File(std::fs::File::open(&temp_path)?))
    }

    /// All snapshots, newest first.
    pub async fn list_snapshots(&self) -> Result<Vec<FileInfo>> {
        let mut snapshots = self.list_prefix(&self.layout.snapshots_prefix()).await?;
        snapshots.sort_by(|a, b| b.revision.cmp(&a.revision));
        Ok(snapshots)
    }

    /// The newest snapshot, if any.
    pub async fn get_latest_snapshot(&self) -> Result<Option<FileInfo>> {
        Ok(self.list_snapshots().await?.into_iter().next())
    }

    /// Chunks with `revision > from_revision`, oldest first.
    pub async fn list_chunks(&self, from_revision: i64) -> Result<Vec<FileInfo>> {
        let mut chunks = self.list_prefix(&self.layout.chunks_prefix()).await?;
        chunks.retain(|c| c.revision > from_revision);
        chunks.sort_by_key(|c| c.revision);
        Ok(chunks)
    }

    /// Chunks superseded by a snapshot at `up_to_revision`, oldest first.
    pub async fn list_chunks_for_cleanup(&self, up_to_revision: i64) -> Result<Vec<FileInfo>> {
        let mut chunks = self.list_prefix(&self.layout.chunks_prefix()).await?;
        chunks.retain(|c| c.revision <= up_to_revision);
        chunks.sort_by_key(|c| c.revision);
        Ok(chunks)
    }

    pub async fn delete_file(&self, key: &Path) -> Result<()> {
        self.store.delete(key).await?;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &Path) -> Result<Vec<FileInfo>> {
        let mut stream = self.store.list(Some(prefix));
        let mut files = Vec::new();
        while let Some(meta) = stream.next().await {
            let meta = meta?;
            match Layout::parse_revision(&meta.location) {
                Some(revision) => files.push(FileInfo {
                    key: meta.location,
                    size: meta.size as i64,
                    revision,
                }),
                None => {
                    warn!(key = %meta.location, "skipping object with unparseable filename");
                }
            }
        }
        Ok(files)
    }
}
