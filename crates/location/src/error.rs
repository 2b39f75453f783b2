//! Provider error type.

/// Errors reported by a storage provider.
///
/// The transfer engine treats [`NotFound`](Self::NotFound) during existence
/// probes as "does not exist yet" and [`PreconditionFailed`](Self::PreconditionFailed)
/// as a possible race that may need content verification. Everything else
/// is fatal for the job.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("a copy is already pending on {0}")]
    CopyPending(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("service error ({status}): {message}")]
    Service { status: u16, message: String },
}

impl ProviderError {
    /// Returns `true` for absence of the addressed object.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Returns `true` for ETag / append-position condition failures.
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, Self::PreconditionFailed(_))
    }

    /// Returns `true` when a start-copy call collided with a pending copy.
    pub fn is_copy_pending(&self) -> bool {
        matches!(self, Self::CopyPending(_))
    }

    pub(crate) fn unsupported(op: &str, location: &crate::Location) -> Self {
        Self::Unsupported(format!("{op} on {}", location.id()))
    }
}
