//! The local record index.
//!
//! A single-file SQLite database holding every record ever seen by this
//! node. It is the source of truth for reads and for compare-and-swap, and
//! it is ephemeral: the authoritative copy of the log lives in object
//! storage, and the whole file can be rebuilt from the latest snapshot plus
//! newer chunks at startup.
//!
//! WAL journal mode is enabled so reads proceed while the commit path holds
//! a write transaction open across the S3 upload.

pub mod error;
mod find;
mod insert;
mod replicate;
mod row;
mod store;
mod timefmt;

pub use error::{Error, Result};
pub use find::{FindResult, Order};
pub use store::{IndexTx, LocalIndex, RevisionStatus};
