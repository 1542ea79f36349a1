use crate::types::Rank;

pub type Result<T> = std::result::Result<T, ArborError>;

#[derive(Debug, thiserror::Error)]
pub enum ArborError {
    #[error("invalid fanout {fanout}: must be in [1, 32]")]
    InvalidFanout { fanout: usize },

    #[error("invalid rank {rank}: group size is {size}")]
    InvalidRank { rank: Rank, size: u32 },

    #[error("unsupported data type: {dtype:?} for operation {op}")]
    UnsupportedDType {
        dtype: crate::types::DataType,
        op: &'static str,
    },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("{direction} to rank {peer} failed: {reason}")]
    TransferFailed {
        direction: &'static str,
        peer: Rank,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("reduction aborted at rank {rank}: {reason}")]
    ReduceAborted { rank: Rank, reason: String },

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl ArborError {
    /// Create a `TransferFailed` error with just a message.
    pub fn transfer(direction: &'static str, peer: Rank, reason: impl Into<String>) -> Self {
        Self::TransferFailed {
            direction,
            peer,
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a `TransferFailed` error with a message and a source error.
    pub fn transfer_with_source(
        direction: &'static str,
        peer: Rank,
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::TransferFailed {
            direction,
            peer,
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }
}
