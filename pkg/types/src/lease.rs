use pkg_constants::lease::LEASE_ID_SEPARATOR;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::validate::validate_identity;

/// Field names as persisted, for building assertions and `$set` updates.
pub const FIELD_NAMESPACE: &str = "namespace";
pub const FIELD_HOLDER: &str = "holder";
pub const FIELD_DURATION: &str = "duration";
pub const FIELD_WRITER: &str = "writer";
pub const FIELD_WRITTEN: &str = "written";
pub const FIELD_VERSION: &str = "version";

/// Structural problems found while decoding a persisted lease.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("cannot decode lease document: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid lease document {id}: {field}: {reason}")]
    Invalid {
        id: String,
        field: &'static str,
        reason: String,
    },
}

/// A lease as persisted in the leases collection.
///
/// Stored under id `namespace#name#`, so every lease in a namespace shares
/// the `namespace#` prefix and no name is a prefix of another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub namespace: String,
    pub name: String,
    /// Identity currently holding the lease (e.g. a unit name).
    pub holder: String,
    /// Requested lifetime from the moment of write, in nanoseconds.
    pub duration: i64,
    /// Process that last wrote the document.
    pub writer: String,
    /// Writer's local time of write, in nanoseconds since the Unix epoch.
    #[serde(default)]
    pub written: i64,
    /// Changes on every successful write; asserted by every update and removal.
    pub version: String,
}

impl LeaseDocument {
    /// Deterministic document id for a lease.
    pub fn doc_id(namespace: &str, name: &str) -> String {
        format!(
            "{}{}{}{}",
            namespace, LEASE_ID_SEPARATOR, name, LEASE_ID_SEPARATOR
        )
    }

    /// Id prefix shared by every lease in `namespace`.
    pub fn namespace_prefix(namespace: &str) -> String {
        format!("{}{}", namespace, LEASE_ID_SEPARATOR)
    }

    /// Requested lifetime. Negative durations saturate to zero.
    pub fn duration(&self) -> Duration {
        Duration::from_nanos(u64::try_from(self.duration).unwrap_or(0))
    }

    /// Check the structural invariants every persisted lease must satisfy.
    pub fn validate(&self) -> Result<(), DocumentError> {
        let invalid = |field: &'static str, reason: String| DocumentError::Invalid {
            id: self.id.clone(),
            field,
            reason,
        };

        for (field, value) in [(FIELD_NAMESPACE, &self.namespace), ("name", &self.name)] {
            if value.is_empty() {
                return Err(invalid(field, "must not be empty".to_string()));
            }
            if value.contains(LEASE_ID_SEPARATOR) {
                return Err(invalid(
                    field,
                    format!("'{}' contains '{}'", value, LEASE_ID_SEPARATOR),
                ));
            }
        }
        let expected = Self::doc_id(&self.namespace, &self.name);
        if self.id != expected {
            return Err(invalid("_id", format!("expected '{}'", expected)));
        }
        validate_identity(FIELD_HOLDER, &self.holder)
            .map_err(|e| invalid(FIELD_HOLDER, e.to_string()))?;
        validate_identity(FIELD_WRITER, &self.writer)
            .map_err(|e| invalid(FIELD_WRITER, e.to_string()))?;
        if self.duration == 0 {
            return Err(invalid(FIELD_DURATION, "must not be zero".to_string()));
        }
        if self.version.is_empty() {
            return Err(invalid(FIELD_VERSION, "must not be empty".to_string()));
        }
        Ok(())
    }

    /// Encode for the store. Refuses to encode a document that would not decode.
    pub fn to_value(&self) -> Result<serde_json::Value, DocumentError> {
        self.validate()?;
        Ok(serde_json::to_value(self)?)
    }

    /// Decode a stored document and check its invariants.
    pub fn from_value(value: serde_json::Value) -> Result<Self, DocumentError> {
        let doc: LeaseDocument = serde_json::from_value(value)?;
        doc.validate()?;
        Ok(doc)
    }
}
