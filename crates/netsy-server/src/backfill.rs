//! Startup backfill: reconstruct the local index from object storage.
//!
//! The index file is ephemeral; object storage is authoritative. Before
//! serving, an empty index is seeded from the newest snapshot, then every
//! chunk newer than the local head is replayed in revision order. Replay
//! uses the unchecked replicate insert - these records already passed the
//! commit checks on the leader that wrote them.

use std::io::BufReader;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use netsy_datafile::Reader;
use netsy_index::LocalIndex;
use netsy_proto::netsy::{FileKind, Record};
use netsy_s3::{FileInfo, S3Store};

use crate::error::ServerError;

pub async fn backfill(
    index: &LocalIndex,
    s3: Option<&S3Store>,
    data_dir: &Path,
    latest_snapshot: Option<&FileInfo>,
    local_latest: i64,
) -> Result<(), ServerError> {
    let Some(s3) = s3 else {
        info!("S3 not enabled, skipping backfill");
        return Ok(());
    };

    let mut temp_files = Vec::new();
    let result = run(index, s3, data_dir, latest_snapshot, local_latest, &mut temp_files).await;

    for file in temp_files {
        match std::fs::remove_file(&file) {
            Ok(()) => debug!(file = %file.display(), "cleaned up temporary file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(file = %file.display(), error = %err, "failed to clean up temporary file")
            }
        }
    }

    result
}

async fn run(
    index: &LocalIndex,
    s3: &S3Store,
    data_dir: &Path,
    latest_snapshot: Option<&FileInfo>,
    mut local_latest: i64,
    temp_files: &mut Vec<PathBuf>,
) -> Result<(), ServerError> {
    // An empty index is seeded from the newest snapshot first.
    if local_latest == 0 {
        if let Some(snapshot) = latest_snapshot {
            info!(key = %snapshot.key, revision = snapshot.revision,
                "database is empty, downloading latest snapshot");
            import_file(index, s3, data_dir, snapshot, FileKind::KindSnapshot, temp_files)
                .await?;
            local_latest = index.latest_revision().await?;
            info!(revision = local_latest, "updated latest revision after snapshot");
        }
    }

    // Replay every chunk past the local head, oldest first.
    let chunks = s3.list_chunks(local_latest).await?;
    if chunks.is_empty() {
        info!("no chunks found to backfill");
    } else {
        info!(count = chunks.len(), "found chunks to backfill");
        for chunk in &chunks {
            import_file(index, s3, data_dir, chunk, FileKind::KindChunk, temp_files).await?;
        }
    }

    info!("backfill complete");
    Ok(())
}

async fn import_file(
    index: &LocalIndex,
    s3: &S3Store,
    data_dir: &Path,
    file: &FileInfo,
    expected_kind: FileKind,
    temp_files: &mut Vec<PathBuf>,
) -> Result<(), ServerError> {
    debug!(key = %file.key, size = file.size, "downloading and importing file");

    let source = s3
        .download_file(&file.key, file.size, data_dir, temp_files)
        .await?;

    // The codec is synchronous and reads frame lengths a byte at a time;
    // decode off the runtime threads, behind a buffer.
    let (records, summary) = tokio::task::spawn_blocking(
        move || -> netsy_datafile::Result<(Vec<Record>, netsy_datafile::ReadSummary)> {
            let mut reader = Reader::new(BufReader::new(source), Some(expected_kind))?;
            let mut records = Vec::with_capacity(reader.count() as usize);
            for _ in 0..reader.count() {
                records.push(reader.read()?);
            }
            let summary = reader.finish()?;
            Ok((records, summary))
        },
    )
    .await??;

    for record in &records {
        index.replicate_record(record).await?;
    }

    info!(
        key = %file.key,
        kind = ?summary.kind,
        records = summary.records_count,
        first_revision = summary.first_revision,
        last_revision = summary.last_revision,
        "successfully imported file"
    );
    Ok(())
}
