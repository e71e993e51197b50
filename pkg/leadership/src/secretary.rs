use anyhow::Result;
use pkg_lease::Secretary;
use pkg_types::validate::{validate_application_name, validate_unit_name};

/// Lease names are application names; holders are unit names.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeadershipSecretary;

impl Secretary for LeadershipSecretary {
    fn check_lease(&self, name: &str) -> Result<()> {
        validate_application_name(name)
    }

    fn check_holder(&self, name: &str) -> Result<()> {
        validate_unit_name(name)
    }
}
