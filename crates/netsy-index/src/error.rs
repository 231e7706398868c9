//! Index errors.
//!
//! The three commit sentinels are distinct variants so the transaction
//! engine can branch on them without string inspection. Internally they are
//! produced by mapping SQLite NOT NULL violations from the insert statement
//! (see `insert.rs` for how the statement arranges that).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The caller-asserted previous revision does not match the live latest
    /// record for the key.
    #[error("compare failed: revision mismatch")]
    CompareRevisionFailed,

    /// A create was attempted while a live (non-deleted) record exists for
    /// the key.
    #[error("cannot create record: key exists")]
    CreateKeyExists,

    /// A delete was attempted for a key with no live record.
    #[error("cannot delete record: key does not exist")]
    DeleteKeyNotFound,

    /// A draft record failed the pre-insert validation.
    #[error("invalid record data for insert: {0}")]
    InvalidRecord(&'static str),

    /// COUNT(*) and MAX(revision) disagree: records are missing.
    #[error("integrity error: total records ({total}) does not match latest revision ({latest})")]
    Integrity { total: i64, latest: i64 },

    #[error("unexpected insert revision {actual}, expected {expected}")]
    RevisionMismatch { expected: i64, actual: i64 },

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl Error {
    /// Whether this is one of the three compare/conflict sentinels that
    /// surface to clients as a failed (not errored) transaction.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::CompareRevisionFailed | Error::CreateKeyExists | Error::DeleteKeyNotFound
        )
    }
}
