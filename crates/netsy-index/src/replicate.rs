//! Unchecked inserts for backfill.

use netsy_proto::netsy::Record;

use crate::error::{Error, Result};
use crate::row::{row_to_record, RECORD_COLUMNS};
use crate::store::LocalIndex;
use crate::timefmt;

impl LocalIndex {
    /// Insert a record exactly as read from a chunk or snapshot: no policy
    /// checks and no revision assignment, since the file is trusted replay
    /// of commits the leader already validated. The caller owns ordering.
    pub async fn replicate_record(&self, record: &Record) -> Result<Record> {
        if record.revision == 0 {
            return Err(Error::InvalidRecord("cannot replicate revision 0"));
        }

        let sql = format!(
            "INSERT INTO records (revision, key, created, deleted, \
             create_revision, prev_revision, version, lease, dek, value, \
             created_at, compacted_at, leader_id, replicated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL, ?12, ?13) \
             RETURNING {RECORD_COLUMNS}"
        );

        let created_at = record
            .created_at
            .as_ref()
            .map(timefmt::to_text)
            .unwrap_or_default();
        let replicated_at = timefmt::to_text(&timefmt::now());
        let value = if record.deleted {
            None
        } else {
            Some(record.value.as_slice())
        };

        let row = sqlx::query(&sql)
            .bind(record.revision)
            .bind(record.key.as_slice())
            .bind(record.created)
            .bind(record.deleted)
            .bind(record.create_revision)
            .bind(record.prev_revision)
            .bind(record.version)
            .bind(record.lease)
            .bind(record.dek)
            .bind(value)
            .bind(&created_at)
            .bind(&record.leader_id)
            .bind(&replicated_at)
            .fetch_one(&self.pool)
            .await?;

        let inserted = row_to_record(&row)?;
        if inserted.revision != record.revision {
            return Err(Error::RevisionMismatch {
                expected: record.revision,
                actual: inserted.revision,
            });
        }
        Ok(inserted)
    }
}
