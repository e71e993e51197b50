use pkg_constants::lease::LEADERSHIP_NAMESPACE;
use pkg_lease::{FencingAssertion, LeaseError, Manager, NamespaceConfig};
use pkg_types::validate::unit_application;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{LeadershipError, Result};
use crate::secretary::LeadershipSecretary;

/// The namespace a manager must serve for leadership to work.
pub fn namespace_config() -> NamespaceConfig {
    NamespaceConfig {
        name: LEADERSHIP_NAMESPACE.to_string(),
        secretary: Arc::new(LeadershipSecretary),
    }
}

fn check_membership(application: &str, unit: &str) -> Result<()> {
    match unit_application(unit) {
        Some(owner) if owner == application => Ok(()),
        _ => Err(LeadershipError::NotValid(format!(
            "unit {:?} does not belong to application {:?}",
            unit, application
        ))),
    }
}

#[derive(Clone)]
pub struct Claimer {
    inner: pkg_lease::Claimer,
}

impl Claimer {
    pub fn new(manager: &Manager) -> Result<Self> {
        Ok(Self {
            inner: manager.claimer(LEADERSHIP_NAMESPACE)?,
        })
    }

    /// Make `unit` leader of `application` for `duration`, or extend its
    /// leadership if it already leads.
    pub async fn claim_leadership(&self, application: &str, unit: &str, duration: Duration) -> Result<()> {
        check_membership(application, unit)?;
        Ok(self.inner.claim(application, unit, duration).await?)
    }

    /// Resolve once `application` has no leader.
    pub async fn block_until_leadership_released(
        &self,
        application: &str,
        cancel: impl Future<Output = ()>,
    ) -> Result<()> {
        Ok(self.inner.wait_until_expired(application, cancel).await?)
    }
}

#[derive(Clone)]
pub struct Checker {
    inner: pkg_lease::Checker,
}

impl Checker {
    pub fn new(manager: &Manager) -> Result<Self> {
        Ok(Self {
            inner: manager.checker(LEADERSHIP_NAMESPACE)?,
        })
    }

    pub fn leadership_check(&self, application: &str, unit: &str) -> Token {
        Token {
            inner: self.inner.token(application, unit),
        }
    }
}

/// Checkable claim that a unit leads its application.
#[derive(Clone)]
pub struct Token {
    inner: pkg_lease::Token,
}

impl Token {
    pub async fn check(&self) -> Result<FencingAssertion> {
        let application = self.inner.name();
        let unit = self.inner.holder();
        check_membership(application, unit)?;
        match self.inner.check().await {
            Ok(assertion) => Ok(assertion),
            Err(LeaseError::NotHeld) => Err(LeadershipError::NotLeader {
                unit: unit.to_string(),
                application: application.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}
