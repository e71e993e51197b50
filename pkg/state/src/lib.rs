//! Transactional document store adapters.
//!
//! Everything above this crate talks to storage through [`DocumentStore`]
//! and [`TxnRunner`]: conditional read/insert/update/delete operations applied
//! atomically, with the whole transaction rebuilt and retried on conflict.

pub mod client;
pub mod error;
pub mod memory;
pub mod store;
pub mod txn;
pub mod watch;

pub use client::StateStore;
pub use error::{Result, StateError};
pub use memory::MemoryStore;
pub use store::{Collection, DocumentStore, Query};
pub use txn::{Assert, Change, Mutation, Operation, TransactionBuilder, TxnRunner};
pub use watch::{EventLog, Notifier, WatchEvent};
