use async_trait::async_trait;
use pkg_constants::state::{GLOBAL_CLOCK_COLLECTION, LEASES_COLLECTION};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, StateError};
use crate::txn::Operation;
use crate::watch::Notifier;

/// The collections this system persists documents in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Collection {
    Leases,
    GlobalClock,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Leases => LEASES_COLLECTION,
            Collection::GlobalClock => GLOBAL_CLOCK_COLLECTION,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            LEASES_COLLECTION => Ok(Collection::Leases),
            GLOBAL_CLOCK_COLLECTION => Ok(Collection::GlobalClock),
            other => Err(StateError::UnknownCollection(other.to_string())),
        }
    }
}

/// Selects documents within one collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Documents whose id starts with the given prefix.
    IdPrefix(String),
}

impl Query {
    pub fn matches(&self, id: &str) -> bool {
        match self {
            Query::IdPrefix(prefix) => id.starts_with(prefix.as_str()),
        }
    }
}

/// A document store offering atomic multi-document transactions.
///
/// `apply` runs a single attempt: either every operation's assertion holds
/// and every mutation is committed, or nothing changes and
/// [`StateError::Aborted`] is returned. Retrying is the caller's job, see
/// [`crate::txn::TxnRunner`].
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch one document, or [`StateError::NotFound`].
    async fn find_one(&self, collection: Collection, id: &str) -> Result<Value>;

    /// Fetch every `(id, document)` in `collection` matching `query`, ordered by id.
    async fn find_all(&self, collection: Collection, query: &Query) -> Result<Vec<(String, Value)>>;

    /// Atomically apply one attempt of a transaction.
    async fn apply(&self, ops: &[Operation]) -> Result<()>;

    /// Subscribe to committed changes of documents whose id starts with `id_prefix`.
    fn watch(&self, collection: Collection, id_prefix: &str) -> Notifier;
}
