use thiserror::Error;

use crate::codec::CodecError;

/// Errors returned by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The store could not be reached or rejected a statement.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),

    /// The payload could not be encoded. Nothing was written.
    #[error("Failed to encode job payload")]
    Encode(#[source] CodecError),

    /// A reserved job's payload could not be decoded. The job stays leased until
    /// its lease expires.
    #[error("Failed to decode payload of job {id}")]
    Decode {
        id: i64,
        #[source]
        source: CodecError,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The listener task panicked.
    #[error("Listener panicked: {0}")]
    ListenerPanicked(String),
}
