//! Application leadership on top of the generic lease manager.
//!
//! Leadership of an application is a lease named after the application in
//! the `leadership` namespace, held by one of its units. This crate only
//! validates names and translates lease errors into leadership terms.

pub mod election;
pub mod error;
pub mod leadership;
pub mod secretary;

pub use election::LeaderElection;
pub use error::{LeadershipError, Result};
pub use leadership::{Checker, Claimer, Token, namespace_config};
pub use secretary::LeadershipSecretary;
