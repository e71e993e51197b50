//! Shared data types: persisted lease documents, identity rules and config files.

pub mod config;
pub mod lease;
pub mod validate;
