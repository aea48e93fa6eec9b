//! Observed state of remote resources

use crate::model::{ModelError, ResourceModel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Last-known remote representation of a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedState {
    /// Remote (or caller-assigned) identifier
    pub id: String,

    /// Resource type
    pub resource_type: String,

    /// All remote attributes as returned by the API
    pub raw: Value,

    /// Lifecycle status
    pub status: LifecycleStatus,

    /// When this state was observed
    pub observed_at: DateTime<Utc>,
}

impl ObservedState {
    pub fn new(id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            raw: Value::Null,
            status: LifecycleStatus::Pending,
            observed_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: LifecycleStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = raw;
        self
    }

    pub fn is_available(&self) -> bool {
        self.status == LifecycleStatus::Available
    }

    /// Get a top-level attribute as a specific type
    pub fn get_attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.raw
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Write every top-level attribute of the raw document into a model
    pub fn write_to(&self, model: &mut impl ResourceModel) -> Result<(), ModelError> {
        if let Value::Object(attributes) = &self.raw {
            for (key, value) in attributes {
                model.set(key, value.clone())?;
            }
        }
        Ok(())
    }
}

/// Status of a remote resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    /// Being created or otherwise not yet usable
    Pending,
    /// Ready
    Available,
    /// Being deleted
    Deleting,
    /// Gone
    Deleted,
    /// Terminal failure
    Failed,
}

impl std::fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleStatus::Pending => write!(f, "pending"),
            LifecycleStatus::Available => write!(f, "available"),
            LifecycleStatus::Deleting => write!(f, "deleting"),
            LifecycleStatus::Deleted => write!(f, "deleted"),
            LifecycleStatus::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttributeMap;
    use serde_json::json;

    #[test]
    fn test_write_to_model() {
        let state = ObservedState::new("vol-123", "volume")
            .with_status(LifecycleStatus::Available)
            .with_raw(json!({"Size": 20, "Arn": "arn:aws:ec2:::volume/vol-123"}));

        let mut model = AttributeMap::new().with("Size", json!(10));
        state.write_to(&mut model).unwrap();

        assert_eq!(model.get("Size"), Some(&json!(20)));
        assert_eq!(
            model.get("Arn"),
            Some(&json!("arn:aws:ec2:::volume/vol-123"))
        );
        assert_eq!(state.get_attribute::<u32>("Size"), Some(20));
    }

    #[test]
    fn test_status_serialization() {
        let state = ObservedState::new("x", "t").with_status(LifecycleStatus::Deleting);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], json!("deleting"));
    }
}
