//! Namespace naming and duration rules.

use anyhow::{Result, bail};
use pkg_types::validate::validate_identity;
use std::time::Duration;

/// Validation policy for one lease namespace.
///
/// The manager consults it before a request reaches the lease client, so
/// domain naming rules stay out of the generic lease mechanics. Failures
/// are reported to callers as [`crate::LeaseError::NotValid`].
pub trait Secretary: Send + Sync {
    fn check_lease(&self, name: &str) -> Result<()>;

    fn check_holder(&self, name: &str) -> Result<()>;

    fn check_duration(&self, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            bail!("duration must be positive");
        }
        Ok(())
    }
}

/// Accepts any well-formed identity as lease or holder name.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentitySecretary;

impl Secretary for IdentitySecretary {
    fn check_lease(&self, name: &str) -> Result<()> {
        validate_identity("lease name", name)
    }

    fn check_holder(&self, name: &str) -> Result<()> {
        validate_identity("holder name", name)
    }
}
