//! Error types for the transfer engine.

/// User-visible failure category of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Cancelled,
    Disconnected,
    Failed,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Disconnected => "disconnected",
            ErrorCategory::Failed => "failed",
        })
    }
}

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("cancelled")]
    Cancelled,

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("resume store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TransferError {
    /// Maps the error onto the category shown to users.
    pub fn category(&self) -> ErrorCategory {
        match self {
            TransferError::Cancelled => ErrorCategory::Cancelled,
            TransferError::Disconnected(_) => ErrorCategory::Disconnected,
            _ => ErrorCategory::Failed,
        }
    }

    /// Returns `true` for caller-initiated cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }

    /// Returns `true` when the retry policy may attempt the step again.
    ///
    /// Everything except cancellation is retried; the policy bounds the count.
    pub fn is_retryable(&self) -> bool {
        !self.is_cancelled()
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(e: serde_json::Error) -> Self {
        TransferError::Store(format!("JSON error: {e}"))
    }
}
