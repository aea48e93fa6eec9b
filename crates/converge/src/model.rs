//! Desired configuration and the accessor boundary to the schema layer

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Typed key-value accessor supplied by the declarative schema layer
///
/// The reconciler never depends on validation or default filling; it only reads
/// resulting values and writes observed ones back.
pub trait ResourceModel {
    /// Read a field value
    fn get(&self, field: &str) -> Option<&Value>;

    /// Write an observed field value
    fn set(&mut self, field: &str, value: Value) -> Result<(), ModelError>;
}

/// Rejection from a [`ResourceModel`] setter
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot set field '{field}': {reason}")]
pub struct ModelError {
    pub field: String,
    pub reason: String,
}

impl ModelError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Plain ordered attribute map; the simplest [`ResourceModel`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeMap(pub BTreeMap<String, Value>);

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: Value) -> Self {
        self.0.insert(field.into(), value);
        self
    }
}

impl ResourceModel for AttributeMap {
    fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    fn set(&mut self, field: &str, value: Value) -> Result<(), ModelError> {
        self.0.insert(field.to_string(), value);
        Ok(())
    }
}

/// Desired configuration submitted by the caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Resource type (e.g. "AWS::Logs::LogGroup", "image")
    pub resource_type: String,

    /// Desired field values
    pub fields: BTreeMap<String, Value>,

    /// Fields whose change requires destroy and recreate
    #[serde(default)]
    pub immutable: BTreeSet<String>,
}

impl ResourceSpec {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, field: impl Into<String>, value: Value) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    pub fn with_immutable(mut self, field: impl Into<String>) -> Self {
        self.immutable.insert(field.into());
        self
    }

    /// Build a spec by reading the named fields from a model
    pub fn from_model<'a>(
        resource_type: impl Into<String>,
        model: &impl ResourceModel,
        fields: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut spec = Self::new(resource_type);
        for field in fields {
            if let Some(value) = model.get(field) {
                spec.fields.insert(field.to_string(), value.clone());
            }
        }
        spec
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Get a field as a specific type
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, field: &str) -> Option<T> {
        self.fields
            .get(field)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn is_immutable(&self, field: &str) -> bool {
        self.immutable.contains(field)
    }

    /// The desired configuration as a JSON document
    pub fn document(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Field-level changes from `self` to `desired`
    pub fn changes(&self, desired: &ResourceSpec) -> ChangeSet {
        let keys: BTreeSet<&String> = self.fields.keys().chain(desired.fields.keys()).collect();
        let changed = keys
            .into_iter()
            .filter(|k| self.fields.get(*k) != desired.fields.get(*k))
            .cloned()
            .collect();
        let immutable = self.immutable.union(&desired.immutable).cloned().collect();
        ChangeSet { changed, immutable }
    }
}

impl ResourceModel for ResourceSpec {
    fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    fn set(&mut self, field: &str, value: Value) -> Result<(), ModelError> {
        self.fields.insert(field.to_string(), value);
        Ok(())
    }
}

/// Fields that differ between two specs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub changed: BTreeSet<String>,
    immutable: BTreeSet<String>,
}

impl ChangeSet {
    pub fn has_change(&self, field: &str) -> bool {
        self.changed.contains(field)
    }

    pub fn has_any_change<'a>(&self, fields: impl IntoIterator<Item = &'a str>) -> bool {
        fields.into_iter().any(|f| self.has_change(f))
    }

    /// Changed fields that can only be applied by replacement
    pub fn immutable_changes(&self) -> Vec<String> {
        self.changed.intersection(&self.immutable).cloned().collect()
    }

    pub fn requires_replacement(&self) -> bool {
        !self.immutable_changes().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_changes_detect_added_removed_and_modified() {
        let old = ResourceSpec::new("bucket")
            .with_field("name", json!("logs"))
            .with_field("versioning", json!(false))
            .with_field("acl", json!("private"));
        let new = ResourceSpec::new("bucket")
            .with_field("name", json!("logs"))
            .with_field("versioning", json!(true))
            .with_field("policy", json!({"Version": "2012-10-17"}));

        let changes = old.changes(&new);
        assert!(!changes.has_change("name"));
        assert!(changes.has_change("versioning"));
        assert!(changes.has_change("acl"));
        assert!(changes.has_change("policy"));
        assert!(!changes.requires_replacement());
    }

    #[test]
    fn test_immutable_change_requires_replacement() {
        let old = ResourceSpec::new("instance")
            .with_field("ami", json!("ami-1"))
            .with_field("tags", json!({"env": "dev"}))
            .with_immutable("ami");
        let new = old.clone().with_field("ami", json!("ami-2"));

        let changes = old.changes(&new);
        assert!(changes.requires_replacement());
        assert_eq!(changes.immutable_changes(), vec!["ami".to_string()]);

        let tags_only = old.clone().with_field("tags", json!({"env": "prod"}));
        assert!(!old.changes(&tags_only).requires_replacement());
    }

    #[test]
    fn test_from_model_and_document() {
        let model = AttributeMap::new()
            .with("name", json!("web"))
            .with("size", json!(20))
            .with("computed_arn", json!("arn:aws:..."));

        let spec = ResourceSpec::from_model("volume", &model, ["name", "size", "missing"]);
        assert_eq!(spec.fields.len(), 2);
        assert_eq!(spec.get_as::<i64>("size"), Some(20));
        assert_eq!(spec.document(), json!({"name": "web", "size": 20}));
    }
}
