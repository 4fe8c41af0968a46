//! Per-table schema descriptors
//!
//! Every synced table is registered up front with the names of the JSON
//! members that carry its system properties. Nothing is discovered at
//! runtime: an operation on a table missing from the registry fails with
//! [`SyncError::UnknownTable`].

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::entity::{is_valid_id, validate_table_name, Version};
use crate::error::{Result, SyncError};

/// Names of the system fields of one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDescriptor {
    table: String,
    id_field: String,
    version_field: String,
    updated_at_field: String,
    deleted_field: String,
}

impl SchemaDescriptor {
    /// Descriptor with the default field names `id`, `version`, `updatedAt`
    /// and `deleted`
    pub fn new(table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_table_name(&table)?;

        Ok(Self {
            table,
            id_field: "id".to_string(),
            version_field: "version".to_string(),
            updated_at_field: "updatedAt".to_string(),
            deleted_field: "deleted".to_string(),
        })
    }

    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    pub fn with_version_field(mut self, field: impl Into<String>) -> Self {
        self.version_field = field.into();
        self
    }

    pub fn with_updated_at_field(mut self, field: impl Into<String>) -> Self {
        self.updated_at_field = field.into();
        self
    }

    pub fn with_deleted_field(mut self, field: impl Into<String>) -> Self {
        self.deleted_field = field.into();
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    pub fn version_field(&self) -> &str {
        &self.version_field
    }

    pub fn updated_at_field(&self) -> &str {
        &self.updated_at_field
    }

    pub fn deleted_field(&self) -> &str {
        &self.deleted_field
    }

    pub fn id_of<'a>(&self, item: &'a Value) -> Option<&'a str> {
        item.get(&self.id_field).and_then(Value::as_str)
    }

    /// Version token in its base64 text form
    pub fn version_of<'a>(&self, item: &'a Value) -> Option<&'a str> {
        item.get(&self.version_field)
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn updated_at_of(&self, item: &Value) -> Option<DateTime<Utc>> {
        item.get(&self.updated_at_field)
            .and_then(Value::as_str)
            .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
            .map(|at| at.with_timezone(&Utc))
    }

    pub fn is_deleted(&self, item: &Value) -> bool {
        item.get(&self.deleted_field)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn set_id(&self, item: &mut Value, id: &str) {
        if let Some(object) = item.as_object_mut() {
            object.insert(self.id_field.clone(), Value::String(id.to_string()));
        }
    }

    pub fn set_version(&self, item: &mut Value, version: &str) {
        if let Some(object) = item.as_object_mut() {
            object.insert(self.version_field.clone(), Value::String(version.to_string()));
        }
    }

    /// Require a JSON object with a valid id and return the id
    pub fn require_id(&self, item: &Value) -> Result<String> {
        if !item.is_object() {
            return Err(self.invalid("entity must be a JSON object"));
        }

        let id = self
            .id_of(item)
            .ok_or_else(|| self.invalid(format!("missing string field '{}'", self.id_field)))?;

        if !is_valid_id(id) {
            return Err(self.invalid(format!("invalid id '{}'", id)));
        }

        Ok(id.to_string())
    }

    /// Validate a record received from the service
    ///
    /// Besides the id, the version (when present) must be base64 and the
    /// update timestamp must parse.
    pub fn validate_remote(&self, item: &Value) -> Result<(String, DateTime<Utc>)> {
        let id = self.require_id(item)?;

        if let Some(version) = self.version_of(item) {
            Version::from_base64(version)
                .map_err(|_| self.invalid(format!("item {} has a malformed version", id)))?;
        }

        let updated_at = self.updated_at_of(item).ok_or_else(|| {
            self.invalid(format!(
                "item {} has no valid '{}' timestamp",
                id, self.updated_at_field
            ))
        })?;

        Ok((id, updated_at))
    }

    fn invalid(&self, reason: impl Into<String>) -> SyncError {
        SyncError::InvalidEntity {
            table: self.table.clone(),
            reason: reason.into(),
        }
    }
}

/// The set of tables a sync context knows about
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    tables: BTreeMap<String, SchemaDescriptor>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. Registering the same table twice is an error.
    pub fn register(&mut self, descriptor: SchemaDescriptor) -> Result<()> {
        if self.tables.contains_key(descriptor.table()) {
            return Err(SyncError::InvalidConfig(format!(
                "Table {} is registered twice",
                descriptor.table()
            )));
        }
        self.tables
            .insert(descriptor.table().to_string(), descriptor);
        Ok(())
    }

    pub fn with(mut self, descriptor: SchemaDescriptor) -> Result<Self> {
        self.register(descriptor)?;
        Ok(self)
    }

    pub fn get(&self, table: &str) -> Result<&SchemaDescriptor> {
        self.tables
            .get(table)
            .ok_or_else(|| SyncError::UnknownTable(table.to_string()))
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_field_names() {
        let schema = SchemaDescriptor::new("todoitem").unwrap();
        let item = json!({
            "id": "a",
            "version": "AAAAAAAAB9E=",
            "updatedAt": "2024-05-01T12:00:00.000Z",
            "deleted": true
        });

        assert_eq!(schema.id_of(&item), Some("a"));
        assert_eq!(schema.version_of(&item), Some("AAAAAAAAB9E="));
        assert_eq!(
            schema.updated_at_of(&item).unwrap().to_rfc3339(),
            "2024-05-01T12:00:00+00:00"
        );
        assert!(schema.is_deleted(&item));
    }

    #[test]
    fn test_custom_field_names() {
        let schema = SchemaDescriptor::new("note")
            .unwrap()
            .with_id_field("key")
            .with_version_field("etag")
            .with_updated_at_field("modified")
            .with_deleted_field("removed");

        let mut item = json!({ "key": "n1", "modified": "2024-01-01T00:00:00Z" });
        schema.set_version(&mut item, "AQ==");

        assert_eq!(schema.require_id(&item).unwrap(), "n1");
        assert_eq!(item["etag"], "AQ==");
        assert!(!schema.is_deleted(&item));
        assert!(schema.validate_remote(&item).is_ok());
    }

    #[test]
    fn test_require_id_errors() {
        let schema = SchemaDescriptor::new("todoitem").unwrap();

        assert!(matches!(
            schema.require_id(&json!([1, 2])),
            Err(SyncError::InvalidEntity { .. })
        ));
        assert!(schema.require_id(&json!({ "title": "no id" })).is_err());
        assert!(schema.require_id(&json!({ "id": 42 })).is_err());
        assert!(schema.require_id(&json!({ "id": "bad id" })).is_err());
    }

    #[test]
    fn test_validate_remote_requires_timestamp_and_version_shape() {
        let schema = SchemaDescriptor::new("todoitem").unwrap();

        assert!(schema.validate_remote(&json!({ "id": "a" })).is_err());
        assert!(schema
            .validate_remote(&json!({ "id": "a", "updatedAt": "yesterday" }))
            .is_err());
        assert!(schema
            .validate_remote(&json!({
                "id": "a",
                "updatedAt": "2024-01-01T00:00:00Z",
                "version": "%%%"
            }))
            .is_err());
    }

    #[test]
    fn test_registry() {
        let registry = SchemaRegistry::new()
            .with(SchemaDescriptor::new("todoitem").unwrap())
            .unwrap()
            .with(SchemaDescriptor::new("category").unwrap())
            .unwrap();

        assert!(registry.contains("todoitem"));
        assert_eq!(registry.tables().collect::<Vec<_>>(), vec!["category", "todoitem"]);
        assert!(matches!(registry.get("missing"), Err(SyncError::UnknownTable(_))));

        let mut registry = registry;
        assert!(matches!(
            registry.register(SchemaDescriptor::new("todoitem").unwrap()),
            Err(SyncError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_reserved_table_names() {
        assert!(matches!(
            SchemaDescriptor::new("__operations"),
            Err(SyncError::InvalidTableName(_))
        ));
    }
}
