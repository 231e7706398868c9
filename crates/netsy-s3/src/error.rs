//! Object-store adapter errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("data file error: {0}")]
    Datafile(#[from] netsy_datafile::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upload of {key} failed after retry: {source}")]
    UploadFailed {
        key: String,
        #[source]
        source: object_store::Error,
    },

    #[error("download of {key} failed after {attempts} attempts: {source}")]
    DownloadFailed {
        key: String,
        attempts: u32,
        #[source]
        source: object_store::Error,
    },

    #[error("invalid S3 configuration: {0}")]
    Config(String),
}
