//! Read queries: windowed latest-per-key lookups, exact revision lookups,
//! and the snapshot scan.

use netsy_core::{range::prefix_end, KeyRange};
use netsy_proto::netsy::Record;
use sqlx::Row;

use crate::error::Result;
use crate::row::{row_to_record, RECORD_COLUMNS};
use crate::store::LocalIndex;

/// Sort order for windowed queries, by key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

impl Order {
    fn as_sql(self) -> &'static str {
        match self {
            Order::Ascending => "ASC",
            Order::Descending => "DESC",
        }
    }
}

/// The result of a windowed query.
#[derive(Debug)]
pub struct FindResult {
    /// The latest live record per matching key, ordered by key, at most
    /// `limit` of them.
    pub records: Vec<Record>,
    /// The number of matching keys before windowing; `more` is
    /// `total_count > records.len()`.
    pub total_count: i64,
    /// The store's current MAX(revision), used as the response header
    /// revision even when no rows match.
    pub max_revision: i64,
}

/// WHERE fragment and blob binds for a parsed key range. The prefix case
/// compiles to the equivalent half-open interval rather than LIKE, which
/// would mis-handle `%`/`_` bytes in keys.
fn where_clause(range: &KeyRange) -> (String, Vec<Vec<u8>>) {
    match range {
        KeyRange::Exact(key) => ("key = ?".to_string(), vec![key.clone()]),
        KeyRange::All => (String::new(), vec![]),
        KeyRange::FromKey(key) => ("key >= ?".to_string(), vec![key.clone()]),
        KeyRange::Prefix(prefix) => (
            "key >= ? AND key < ?".to_string(),
            vec![prefix.clone(), prefix_end(prefix)],
        ),
        KeyRange::Interval(start, end) => (
            "key >= ? AND key < ?".to_string(),
            vec![start.clone(), end.clone()],
        ),
    }
}

impl LocalIndex {
    /// For each key matching `range`, return the latest live (non-deleted)
    /// record with `revision <= as_of_revision` (0 means "newest"), ordered
    /// by key. At most `limit` rows are returned when `limit > 0`;
    /// `total_count` counts all matches so the caller can compute `More`.
    pub async fn find_records_by(
        &self,
        range: &KeyRange,
        as_of_revision: i64,
        limit: i64,
        order: Order,
    ) -> Result<FindResult> {
        let (mut where_sql, binds) = where_clause(range);
        if as_of_revision > 0 {
            if where_sql.is_empty() {
                where_sql = "revision <= ?".to_string();
            } else {
                where_sql.push_str(" AND revision <= ?");
            }
        }
        let filter = if where_sql.is_empty() {
            String::new()
        } else {
            format!("WHERE {where_sql}")
        };

        let window = format!(
            "SELECT records.*, ROW_NUMBER() OVER \
             (PARTITION BY key ORDER BY revision DESC) AS rn \
             FROM records {filter}"
        );

        let mut rows_sql = format!(
            "SELECT {RECORD_COLUMNS} FROM ({window}) \
             WHERE rn = 1 AND deleted = 0 ORDER BY key {}",
            order.as_sql()
        );
        if limit > 0 {
            rows_sql.push_str(&format!(" LIMIT {limit}"));
        }

        let count_sql =
            format!("SELECT COUNT(*) FROM ({window}) WHERE rn = 1 AND deleted = 0");

        let mut rows_query = sqlx::query(&rows_sql);
        let mut count_query = sqlx::query(&count_sql);
        for bind in &binds {
            rows_query = rows_query.bind(bind.as_slice());
            count_query = count_query.bind(bind.as_slice());
        }
        if as_of_revision > 0 {
            rows_query = rows_query.bind(as_of_revision);
            count_query = count_query.bind(as_of_revision);
        }

        let rows = rows_query.fetch_all(&self.pool).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(row_to_record(row)?);
        }

        let total_count: i64 = count_query.fetch_one(&self.pool).await?.get(0);
        let max_revision = self.latest_revision().await?;

        Ok(FindResult {
            records,
            total_count,
            max_revision,
        })
    }

    /// Exact revision lookup.
    pub async fn find_record_by_rev(&self, revision: i64) -> Result<Option<Record>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE revision = ?1");
        let row = sqlx::query(&sql)
            .bind(revision)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_record(&r)).transpose()
    }

    /// Every non-compacted record with `revision <= up_to`, ascending,
    /// deletes included: exactly what a snapshot must contain.
    pub async fn find_all_records_for_snapshot(&self, up_to: i64) -> Result<Vec<Record>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records \
             WHERE revision <= ?1 AND compacted_at IS NULL \
             ORDER BY revision ASC"
        );
        let rows = sqlx::query(&sql).bind(up_to).fetch_all(&self.pool).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(row_to_record(row)?);
        }
        Ok(records)
    }
}
