//! Opening the index and the whole-store queries.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::error::{Error, Result};

/// Handle to the local index. Cheap to clone via the inner pool; share it
/// with `Arc` like any other store handle.
pub struct LocalIndex {
    pub(crate) pool: SqlitePool,
}

/// An explicit write transaction bracketing the commit path: the insert and
/// the S3 upload happen inside, and only a successful upload commits.
pub struct IndexTx {
    pub(crate) inner: sqlx::Transaction<'static, sqlx::Sqlite>,
}

impl IndexTx {
    pub async fn commit(self) -> Result<()> {
        self.inner.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.inner.rollback().await?;
        Ok(())
    }
}

/// Metadata about a single revision, used by watch creation to detect
/// compacted start revisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionStatus {
    pub revision: i64,
    pub compacted: bool,
}

impl LocalIndex {
    /// Open (creating if missing) the index file and run migrations. WAL
    /// mode allows reads during the commit path's open write transaction.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            path.as_ref().display()
        ))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory index for tests. A single connection, because every SQLite
    /// `:memory:` connection is its own database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn begin_tx(&self) -> Result<IndexTx> {
        Ok(IndexTx {
            inner: self.pool.begin().await?,
        })
    }

    /// The highest committed revision, or 0 when the store is empty.
    pub async fn latest_revision(&self) -> Result<i64> {
        let row =
            sqlx::query("SELECT revision FROM records ORDER BY revision DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.get::<i64, _>(0)).unwrap_or(0))
    }

    /// Look up whether a revision exists and whether it has been compacted.
    pub async fn get_revision(&self, revision: i64) -> Result<Option<RevisionStatus>> {
        let row = sqlx::query(
            "SELECT revision, compacted_at FROM records WHERE revision = ?1",
        )
        .bind(revision)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| RevisionStatus {
            revision: r.get::<i64, _>(0),
            compacted: r.get::<Option<String>, _>(1).is_some(),
        }))
    }

    /// Assert that no records are missing. Compaction empties values rather
    /// than deleting rows, so a dense log always satisfies
    /// COUNT(*) == MAX(revision).
    pub async fn verify_integrity(&self) -> Result<()> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, COALESCE(MAX(revision), 0) AS latest FROM records",
        )
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.get(0);
        let latest: i64 = row.get(1);
        if total != latest {
            return Err(Error::Integrity { total, latest });
        }
        Ok(())
    }

    /// Physical size of the database file in bytes, reported by
    /// `Maintenance.Status`.
    pub async fn size(&self) -> Result<i64> {
        let row = sqlx::query(
            "SELECT (page_count * page_size) AS db_size \
             FROM pragma_page_count(), pragma_page_size()",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get(0))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
