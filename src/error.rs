use ledgerview_core::{cursor::CursorError, pagination::PaginationError, storage::StorageError};
use thiserror::Error;
use time::Date;

/// Coarse classification used to decide how a caller reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Transient,
    Invariant,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid range: {start} is after {end}")]
    InvalidRange { start: Date, end: Date },
    #[error(transparent)]
    InvalidCursor(#[from] CursorError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient infrastructure error: {0}")]
    Transient(String),
    #[error("storage error: {0}")]
    Storage(StorageError),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("cached value under {key} is unreadable: {reason}")]
    PoisonedCache { key: String, reason: String },
    #[error("batch stopped at {date}: {source}")]
    Batch {
        date: Date,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidCursor(CursorError::Unencodable(_)) => ErrorKind::Invariant,
            PipelineError::Validation(_) | PipelineError::InvalidRange { .. } | PipelineError::InvalidCursor(_) => {
                ErrorKind::Validation
            }
            PipelineError::NotFound(_) => ErrorKind::NotFound,
            PipelineError::Conflict(_) => ErrorKind::Conflict,
            PipelineError::Transient(_) => ErrorKind::Transient,
            PipelineError::Storage(StorageError::Corrupt(_) | StorageError::Constraint(_)) => ErrorKind::Invariant,
            PipelineError::Storage(_) => ErrorKind::Transient,
            PipelineError::InvariantViolation(_) | PipelineError::PoisonedCache { .. } => ErrorKind::Invariant,
            PipelineError::Batch { source, .. } => source.kind(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// The date a batch run stopped at, if this error came from one.
    pub fn failed_date(&self) -> Option<Date> {
        match self {
            PipelineError::Batch { date, .. } => Some(*date),
            _ => None,
        }
    }
}

impl From<StorageError> for PipelineError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::AccountNotFound(account) => PipelineError::NotFound(format!("account {}", account)),
            StorageError::ExportNotFound(path) => PipelineError::NotFound(format!("export {}", path)),
            StorageError::Connection(msg) => PipelineError::Transient(msg),
            StorageError::InvalidPath(path) => PipelineError::Validation(format!("invalid export path {}", path)),
            StorageError::ClaimLost(period) => {
                PipelineError::Conflict(format!("close claim on {} was taken over", period))
            }
            other => PipelineError::Storage(other),
        }
    }
}

impl From<PaginationError> for PipelineError {
    fn from(e: PaginationError) -> Self {
        match e {
            PaginationError::InvalidLimit(limit) => {
                PipelineError::Validation(format!("limit must be >= 0, got {}", limit))
            }
            PaginationError::Cursor(e) => PipelineError::InvalidCursor(e),
        }
    }
}
