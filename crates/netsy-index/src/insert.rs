//! The commit primitive.
//!
//! `insert_record` is a single INSERT ... SELECT so the concurrency check
//! and the insert are atomic with respect to any concurrent reader. Two
//! inline subqueries fetch the latest record for the key and the latest
//! revision overall, and each computed column is arranged so that a policy
//! violation evaluates to NULL on a NOT NULL column:
//!
//! - create while a live record exists      -> `created` NULL  -> [`Error::CreateKeyExists`]
//! - delete while no live record exists     -> `deleted` NULL  -> [`Error::DeleteKeyNotFound`]
//! - `prev_revision` not the live latest    -> `prev_revision` NULL -> [`Error::CompareRevisionFailed`]
//! - create (`prev_revision` 0) over a live record -> `prev_revision` NULL -> [`Error::CompareRevisionFailed`]
//!
//! SQLite checks NOT NULL constraints in column order, so a create conflict
//! reports `CreateKeyExists` (the `created` column precedes
//! `prev_revision`).

use netsy_proto::netsy::Record;

use crate::error::{Error, Result};
use crate::row::row_to_record;
use crate::store::{IndexTx, LocalIndex};
use crate::timefmt;

const INSERT_RECORD_SQL: &str = "\
WITH
latest_revision_for_key AS (
    SELECT revision, deleted, create_revision, version, value
    FROM records
    WHERE key = ?2
    ORDER BY revision DESC
    LIMIT 1
),
latest_revision_for_table AS (
    SELECT COALESCE(MAX(revision), 0) AS revision FROM records
)
INSERT INTO records (
    revision,
    key,
    created,
    deleted,
    create_revision,
    prev_revision,
    version,
    lease,
    dek,
    value,
    created_at,
    compacted_at,
    leader_id,
    replicated_at
)
SELECT
    /* revision */
    ?1,
    /* key */
    ?2,
    /* created: a create requires no live latest for the key */
    CASE WHEN ?3 = 1
    THEN
        CASE WHEN (SELECT deleted FROM latest_revision_for_key) = 0
        THEN NULL
        ELSE 1
        END
    ELSE 0
    END,
    /* deleted: a delete requires a live latest for the key */
    CASE WHEN ?4 = 1
    THEN
        CASE WHEN (SELECT deleted FROM latest_revision_for_key) = 0
        THEN 1
        ELSE NULL
        END
    ELSE 0
    END,
    /* create_revision: copy the live generation's, or start a new one */
    COALESCE(
        (SELECT create_revision FROM latest_revision_for_key WHERE deleted = 0),
        (SELECT revision + 1 FROM latest_revision_for_table)
    ),
    /* prev_revision: must match the live latest (or 0 on a create) */
    CASE WHEN ?6 > 0
    THEN
        CASE WHEN ?6 = IFNULL(
            (SELECT revision FROM latest_revision_for_key WHERE deleted = 0),
            0
        )
        THEN ?6
        ELSE NULL
        END
    ELSE
        CASE WHEN IFNULL(
            (SELECT revision FROM latest_revision_for_key WHERE deleted = 0),
            0
        ) > 0
        THEN NULL
        ELSE 0
        END
    END,
    /* version: 0 on delete, previous + 1 otherwise */
    CASE WHEN ?4 = 1
    THEN 0
    ELSE IFNULL((SELECT version FROM latest_revision_for_key), 0) + 1
    END,
    /* lease */
    ?7,
    /* dek */
    ?8,
    /* value */
    ?9,
    /* created_at */
    ?10,
    /* compacted_at */
    NULL,
    /* leader_id */
    ?11,
    /* replicated_at */
    NULL
RETURNING revision, key, created, deleted, create_revision, prev_revision, \
          version, lease, dek, value, created_at, compacted_at, leader_id, \
          replicated_at";

impl LocalIndex {
    /// Insert a draft record, enforcing the generation and compare policies
    /// atomically. The draft carries the caller-assigned `revision`,
    /// operation flags, `prev_revision`, key/value/lease/dek, and leader id;
    /// everything else is computed by the statement and returned.
    ///
    /// When `tx` is given the insert joins that transaction; otherwise it
    /// auto-commits.
    pub async fn insert_record(
        &self,
        record: &Record,
        tx: Option<&mut IndexTx>,
    ) -> Result<Record> {
        validate_draft(record)?;

        let created_at = timefmt::to_text(&timefmt::now());
        let value = if record.deleted {
            None
        } else {
            Some(record.value.as_slice())
        };

        let query = sqlx::query(INSERT_RECORD_SQL)
            .bind(record.revision) // ?1
            .bind(record.key.as_slice()) // ?2
            .bind(record.created) // ?3
            .bind(record.deleted) // ?4
            .bind(record.create_revision) // ?5 is never read; binding it keeps ?6..?11 aligned
            .bind(record.prev_revision) // ?6
            .bind(record.lease) // ?7
            .bind(record.dek) // ?8
            .bind(value) // ?9
            .bind(&created_at) // ?10
            .bind(&record.leader_id); // ?11

        let row = match tx {
            Some(tx) => query.fetch_one(&mut *tx.inner).await,
            None => query.fetch_one(&self.pool).await,
        }
        .map_err(map_insert_error)?;

        let inserted = row_to_record(&row)?;
        if inserted.revision < 1 {
            return Err(Error::RevisionMismatch {
                expected: record.revision,
                actual: inserted.revision,
            });
        }
        Ok(inserted)
    }
}

/// Reject drafts that carry fields only the statement (or the commit path)
/// may set.
fn validate_draft(record: &Record) -> Result<()> {
    if record.revision <= 0 {
        return Err(Error::InvalidRecord("revision must be positive"));
    }
    if record.key.is_empty() {
        return Err(Error::InvalidRecord("key must not be empty"));
    }
    if record.create_revision < 0 || record.prev_revision < 0 {
        return Err(Error::InvalidRecord("revisions must not be negative"));
    }
    if record.version != 0 {
        return Err(Error::InvalidRecord("version is computed on insert"));
    }
    if record.lease < 0 || record.dek < 0 {
        return Err(Error::InvalidRecord("lease and dek must not be negative"));
    }
    if record.created_at.is_some() || record.compacted_at.is_some() || record.replicated_at.is_some()
    {
        return Err(Error::InvalidRecord("timestamps are set on insert"));
    }
    if record.leader_id.is_empty() {
        return Err(Error::InvalidRecord("leader_id must be set"));
    }
    if record.crc != 0 {
        return Err(Error::InvalidRecord("crc is computed by the file codec"));
    }
    if record.created && record.deleted {
        return Err(Error::InvalidRecord("created and deleted are exclusive"));
    }
    Ok(())
}

/// Translate the statement's NOT NULL violations into the sentinels.
fn map_insert_error(err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db) = &err {
        let message = db.message();
        if message.contains("NOT NULL constraint failed: records.created") {
            return Error::CreateKeyExists;
        }
        if message.contains("NOT NULL constraint failed: records.deleted") {
            return Error::DeleteKeyNotFound;
        }
        if message.contains("NOT NULL constraint failed: records.prev_revision") {
            return Error::CompareRevisionFailed;
        }
    }
    Error::Sqlx(err)
}
