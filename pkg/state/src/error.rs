//! Errors surfaced by the state store adapters.

use crate::store::Collection;

/// The result type used throughout pkg-state.
pub type Result<T> = std::result::Result<T, StateError>;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The requested document does not exist.
    #[error("{collection} document {id} not found")]
    NotFound { collection: Collection, id: String },

    /// An assertion failed; nothing in the transaction was applied.
    #[error("transaction aborted")]
    Aborted,

    /// Every attempt of a transaction aborted.
    #[error("state changing too quickly; try again soon ({attempts} attempts)")]
    ExcessiveContention { attempts: u32 },

    /// A persisted document could not be interpreted.
    #[error("corrupt {collection} document {id}: {reason}")]
    Corrupt {
        collection: Collection,
        id: String,
        reason: String,
    },

    /// Unknown collection name.
    #[error("unknown collection {0:?}")]
    UnknownCollection(String),

    #[error("storage error: {message}")]
    Storage { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StateError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Whether retrying the whole operation later may succeed.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Aborted | Self::ExcessiveContention { .. })
    }
}
