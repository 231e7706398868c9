//! Mapping between `records` rows and the protobuf `Record`.

use netsy_proto::netsy::Record;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::Result;
use crate::timefmt;

/// The column list every record query selects, in the order
/// [`row_to_record`] expects.
pub const RECORD_COLUMNS: &str = "revision, key, created, deleted, create_revision, \
     prev_revision, version, lease, dek, value, created_at, compacted_at, \
     leader_id, replicated_at";

pub fn row_to_record(row: &SqliteRow) -> Result<Record> {
    let created_at: String = row.try_get(10)?;
    let compacted_at: Option<String> = row.try_get(11)?;
    let replicated_at: Option<String> = row.try_get(13)?;

    Ok(Record {
        revision: row.try_get(0)?,
        key: row.try_get(1)?,
        created: row.try_get(2)?,
        deleted: row.try_get(3)?,
        create_revision: row.try_get(4)?,
        prev_revision: row.try_get(5)?,
        version: row.try_get(6)?,
        lease: row.try_get(7)?,
        dek: row.try_get(8)?,
        value: row.try_get::<Option<Vec<u8>>, _>(9)?.unwrap_or_default(),
        created_at: timefmt::from_text(&created_at),
        compacted_at: compacted_at.as_deref().and_then(timefmt::from_text),
        leader_id: row.try_get(12)?,
        replicated_at: replicated_at.as_deref().and_then(timefmt::from_text),
        crc: 0,
    })
}
