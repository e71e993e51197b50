use anyhow::{Result, bail};

/// Longest accepted application or identity name.
const MAX_NAME_LEN: usize = 63;

/// Validate an application name.
/// Rules: lowercase `[a-z0-9-]`, starts with a letter, max 63 chars,
/// no trailing hyphen and no empty segments (`--`).
pub fn validate_application_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("application name must not be empty");
    }
    if name.len() > MAX_NAME_LEN {
        bail!(
            "application name '{}' exceeds {} characters (got {})",
            name,
            MAX_NAME_LEN,
            name.len()
        );
    }
    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        bail!("application name '{}' must start with a lowercase letter", name);
    }
    if name.ends_with('-') || name.contains("--") {
        bail!(
            "application name '{}' must not end with a hyphen or contain empty segments",
            name
        );
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        bail!(
            "application name '{}' must contain only lowercase letters, digits, and hyphens [a-z0-9-]",
            name
        );
    }
    Ok(())
}

/// Validate a unit name of the form `<application>/<number>`.
pub fn validate_unit_name(name: &str) -> Result<()> {
    let Some((application, number)) = name.split_once('/') else {
        bail!("unit name '{}' must have the form <application>/<number>", name);
    };
    validate_application_name(application)?;
    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
        bail!("unit name '{}' must end in a decimal unit number", name);
    }
    if number.len() > 1 && number.starts_with('0') {
        bail!("unit number in '{}' must not have leading zeros", name);
    }
    Ok(())
}

/// Validate a generic identity string (lease holder, document writer).
/// Identities are non-empty printable tokens without whitespace or `#`.
pub fn validate_identity(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        bail!("{} must not be empty", kind);
    }
    if let Some(c) = value
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || *c == '#')
    {
        bail!("{} '{}' contains invalid character {:?}", kind, value, c);
    }
    Ok(())
}

/// Application that owns a unit, or `None` if the name is not a unit name.
pub fn unit_application(unit: &str) -> Option<&str> {
    unit.split_once('/').map(|(application, _)| application)
}
