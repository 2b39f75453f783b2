//! Error type shared by every controller.

use datamover_location::{CopyState, DestinationKind, ProviderError};

/// Errors produced while driving a transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("source and destination diverge at offset {offset}")]
    ContentMismatch { offset: u64 },

    #[error("checkpoint cannot be resumed: {0}")]
    ResumeStateInconsistent(String),

    #[error("source of {length} bytes exceeds the {limit} byte limit for {kind} destinations")]
    SourceTooLarge {
        kind: DestinationKind,
        length: u64,
        limit: u64,
    },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("destination exists and overwrite was refused: {0}")]
    Skipped(String),

    #[error("destination type mismatch: {0}")]
    DestinationTypeMismatch(String),

    #[error("server-side copy {status}: {description}")]
    CopyFailed { status: CopyState, description: String },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("chunk checksum mismatch at offset {offset}")]
    ChecksumMismatch { offset: u64 },

    #[error("provider error: {0}")]
    Provider(ProviderError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ProviderError> for TransferError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(what) => Self::NotFound(what),
            ProviderError::PreconditionFailed(what) => Self::PreconditionFailed(what),
            other => Self::Provider(other),
        }
    }
}

impl TransferError {
    /// Cooperative cancellation, not a failure for reporting purposes.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The overwrite predicate refused an existing destination.
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Provider(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, Self::PreconditionFailed(_))
    }

    /// A start-copy call collided with a copy already running on the destination.
    pub fn is_copy_pending(&self) -> bool {
        matches!(self, Self::Provider(e) if e.is_copy_pending())
    }
}
