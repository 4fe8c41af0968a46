//! Entity identity and version tokens
//!
//! Synced records are plain JSON objects. The schema descriptor of their
//! table says which members hold the system properties; this module owns the
//! rules for those values themselves.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// A record under sync: a JSON object whose system fields are located
/// through its table's [`SchemaDescriptor`](crate::schema::SchemaDescriptor).
pub type Entity = serde_json::Value;

/// Longest accepted item id
pub const MAX_ID_LENGTH: usize = 127;

/// Longest accepted table name
pub const MAX_TABLE_NAME_LENGTH: usize = 64;

/// Prefix of the engine's own bookkeeping tables
pub const SYSTEM_TABLE_PREFIX: &str = "__";

/// Opaque optimistic-concurrency token assigned by the server
///
/// Travels as base64 text in entity payloads and in `If-Match` headers.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Version(Vec<u8>);

impl Version {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Parse the base64 text form, tolerating surrounding entity-tag quotes
    pub fn from_base64(text: &str) -> Result<Self> {
        let trimmed = text.trim().trim_matches('"');
        STANDARD
            .decode(trimmed)
            .map(Self)
            .map_err(|e| SyncError::Serialization(format!("Invalid version token '{}': {}", text, e)))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self.to_base64())
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Version::from_base64(&text).map_err(serde::de::Error::custom)
    }
}

/// Whether `id` is an acceptable item id
///
/// One ASCII letter or digit, followed by up to 126 letters, digits or any of
/// `_ . | : -`.
pub fn is_valid_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }

    id.len() <= MAX_ID_LENGTH
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '|' | ':' | '-'))
}

/// Validate a user table name: lowercase letter, then lowercase letters,
/// digits or underscores, at most 64 characters, not starting with `__`.
pub fn validate_table_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let well_formed = matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && name.len() <= MAX_TABLE_NAME_LENGTH
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if !well_formed || name.starts_with(SYSTEM_TABLE_PREFIX) {
        return Err(SyncError::InvalidTableName(name.to_string()));
    }
    Ok(())
}

/// Client-side id for items inserted without one
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        assert!(is_valid_id("a"));
        assert!(is_valid_id("9f2c"));
        assert!(is_valid_id("item_1.2|x:y-z"));
        assert!(is_valid_id(&"a".repeat(MAX_ID_LENGTH)));
    }

    #[test]
    fn test_invalid_ids() {
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("_leading"));
        assert!(!is_valid_id("-leading"));
        assert!(!is_valid_id("has space"));
        assert!(!is_valid_id("slash/inside"));
        assert!(!is_valid_id("ünicode"));
        assert!(!is_valid_id(&"a".repeat(MAX_ID_LENGTH + 1)));
    }

    #[test]
    fn test_table_names() {
        assert!(validate_table_name("todoitem").is_ok());
        assert!(validate_table_name("todo_item_2").is_ok());

        for bad in ["", "TodoItem", "2items", "todo-item", "__operations", "_x"] {
            assert!(
                matches!(validate_table_name(bad), Err(SyncError::InvalidTableName(_))),
                "{} should be rejected",
                bad
            );
        }
        assert!(validate_table_name(&"t".repeat(MAX_TABLE_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_generated_ids_are_valid_and_unique() {
        let a = generate_id();
        let b = generate_id();
        assert!(is_valid_id(&a));
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_version_base64_forms() {
        let version = Version::from_bytes(vec![0, 0, 0, 0, 0, 0, 7, 209]);
        assert_eq!(version.to_base64(), "AAAAAAAAB9E=");
        assert_eq!(Version::from_base64("\"AAAAAAAAB9E=\"").unwrap(), version);
        assert!(Version::from_base64("not base64!").is_err());

        let json = serde_json::to_value(&version).unwrap();
        assert_eq!(json, serde_json::json!("AAAAAAAAB9E="));
        let back: Version = serde_json::from_value(json).unwrap();
        assert_eq!(back.as_bytes(), &[0, 0, 0, 0, 0, 0, 7, 209]);
    }
}
