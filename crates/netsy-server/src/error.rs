//! Server-level errors: startup failures and the transaction taxonomy.

use thiserror::Error;
use tonic::Status;

/// Errors from the transaction path.
///
/// The three index sentinels never reach this enum: the engine handles them
/// internally and answers the client with a failed (not errored)
/// transaction.
#[derive(Debug, Error)]
pub enum TxnError {
    /// Syntactically valid but outside the Kubernetes etcd subset.
    #[error("unsupported request - netsy only implements the Kubernetes etcd API subset")]
    Unsupported,

    /// Malformed transaction shape.
    #[error("invalid request - {0}")]
    Invalid(&'static str),

    #[error("index error: {0}")]
    Index(#[from] netsy_index::Error),

    #[error("object store error: {0}")]
    Storage(#[from] netsy_s3::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TxnError> for Status {
    fn from(err: TxnError) -> Status {
        match err {
            TxnError::Unsupported => Status::unimplemented(err.to_string()),
            TxnError::Invalid(_) => Status::invalid_argument(err.to_string()),
            TxnError::Index(_) | TxnError::Storage(_) | TxnError::Internal(_) => {
                Status::internal(err.to_string())
            }
        }
    }
}

/// Fatal startup and runtime errors surfaced by the binary.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("index error: {0}")]
    Index(#[from] netsy_index::Error),

    #[error("object store error: {0}")]
    Storage(#[from] netsy_s3::Error),

    #[error("data file error: {0}")]
    Datafile(#[from] netsy_datafile::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}
