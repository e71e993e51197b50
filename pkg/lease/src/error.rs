//! Error taxonomy for lease operations.

use pkg_state::StateError;
use pkg_types::lease::DocumentError;

/// The result type used throughout pkg-lease.
pub type Result<T> = std::result::Result<T, LeaseError>;

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// A precondition against cached state failed (claim on a held lease,
    /// extend by the wrong holder, expire before expiry). Refresh and reassess.
    #[error("invalid lease operation: {0}")]
    Invalid(String),

    /// The lease is validly held by someone else.
    #[error("lease claim denied")]
    ClaimDenied,

    /// The lease is not held by the expected holder.
    #[error("lease not held")]
    NotHeld,

    /// Rejected by a namespace's naming or duration rules.
    #[error("not valid: {0}")]
    NotValid(String),

    /// The caller gave up waiting.
    #[error("waiting for lease cancelled by client")]
    WaitCancelled,

    /// The manager is shutting down or has stopped.
    #[error("lease manager stopped")]
    Stopped,

    /// Another process advanced the global clock first.
    #[error("global clock updated concurrently")]
    ConcurrentUpdate,

    /// A persisted lease failed structural validation.
    #[error("corrupt lease document {id}: {source}")]
    Corrupt {
        id: String,
        #[source]
        source: DocumentError,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

impl LeaseError {
    /// Whether the same call may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            LeaseError::State(e) => e.is_contention(),
            LeaseError::ConcurrentUpdate => true,
            _ => false,
        }
    }
}
