//! Remote API boundary
//!
//! An [`ApiClient`] is supplied per resource type by the collaborator that owns the
//! concrete SDK. It is passed into the [`Reconciler`](crate::Reconciler) explicitly;
//! there is no global client lookup.

use crate::error::{ApiError, ApiResult};
use crate::model::ResourceSpec;
use crate::patch::PatchOperation;
use crate::poller::Observation;
use crate::state::LifecycleStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Remote API for one resource type
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Resource type served by this client (e.g. "AWS::Logs::LogGroup")
    fn resource_type(&self) -> &str;

    /// How updates are shipped to the remote API
    fn update_strategy(&self) -> UpdateStrategy {
        UpdateStrategy::Patch
    }

    async fn create(&self, spec: &ResourceSpec) -> ApiResult<CreateOutput>;

    async fn read(&self, id: &str) -> ApiResult<ReadOutput>;

    async fn update(&self, id: &str, payload: &UpdatePayload) -> ApiResult<UpdateOutput>;

    async fn delete(&self, id: &str) -> ApiResult<DeleteOutput>;

    /// Status of an asynchronous operation started by create/update/delete
    async fn operation_status(&self, token: &OperationToken) -> ApiResult<OperationReport> {
        Err(ApiError::permanent(format!(
            "{} does not support asynchronous operations (token {})",
            self.resource_type(),
            token
        )))
    }

    /// Resources that deleting `id` also deletes (e.g. generated snapshots)
    async fn dependents(&self, _id: &str) -> ApiResult<Vec<Dependent>> {
        Ok(Vec::new())
    }

    async fn delete_dependent(&self, _dependent: &Dependent) -> ApiResult<()> {
        Ok(())
    }
}

/// Correlation token of an asynchronous remote operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationToken(pub String);

impl OperationToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Display for OperationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateOutput {
    /// Identifier assigned by the remote, if the response carries one yet
    pub id: Option<String>,
    pub raw: Value,
    /// Present when creation completes asynchronously
    pub token: Option<OperationToken>,
}

impl CreateOutput {
    pub fn sync(id: impl Into<String>, raw: Value) -> Self {
        Self {
            id: Some(id.into()),
            raw,
            token: None,
        }
    }

    pub fn pending(id: Option<String>, token: OperationToken) -> Self {
        Self {
            id,
            raw: Value::Null,
            token: Some(token),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadOutput {
    pub raw: Value,
    pub status: LifecycleStatus,
}

impl Observation for ReadOutput {
    type Status = LifecycleStatus;

    fn status(&self) -> &LifecycleStatus {
        &self.status
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutput {
    pub raw: Option<Value>,
    pub token: Option<OperationToken>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteOutput {
    pub token: Option<OperationToken>,
    /// The remote accepted the delete but still reports the object as deleting
    pub in_progress: bool,
}

/// Body of an update call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdatePayload {
    /// JSON Patch for partial-update APIs
    Patch { operations: Vec<PatchOperation> },
    /// New values for one independently updatable group of fields
    Fields {
        group: String,
        values: BTreeMap<String, Value>,
    },
}

/// Fields that one update call changes together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldGroup {
    pub name: String,
    pub fields: Vec<String>,
}

impl FieldGroup {
    pub fn new(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// One call carrying a JSON Patch of the whole desired document
    Patch,
    /// One call per changed group; changed fields outside every group are sent alone
    Fields(Vec<FieldGroup>),
}

/// Status of an asynchronous remote operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    CancelInProgress,
    CancelComplete,
}

impl OperationStatus {
    pub const WORKING: [OperationStatus; 2] = [OperationStatus::Pending, OperationStatus::InProgress];
    pub const DONE: [OperationStatus; 1] = [OperationStatus::Success];
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Pending => write!(f, "PENDING"),
            OperationStatus::InProgress => write!(f, "IN_PROGRESS"),
            OperationStatus::Success => write!(f, "SUCCESS"),
            OperationStatus::Failed => write!(f, "FAILED"),
            OperationStatus::CancelInProgress => write!(f, "CANCEL_IN_PROGRESS"),
            OperationStatus::CancelComplete => write!(f, "CANCEL_COMPLETE"),
        }
    }
}

/// Progress of an asynchronous operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationReport {
    pub status: OperationStatus,

    /// Identifier of the resource, once the remote has assigned one
    #[serde(default)]
    pub identifier: Option<String>,

    #[serde(default)]
    pub error_code: Option<String>,

    #[serde(default)]
    pub status_message: Option<String>,
}

impl OperationReport {
    pub fn new(status: OperationStatus) -> Self {
        Self {
            status,
            identifier: None,
            error_code: None,
            status_message: None,
        }
    }

    pub fn with_identifier(mut self, id: impl Into<String>) -> Self {
        self.identifier = Some(id.into());
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self.status_message = Some(message.into());
        self
    }
}

impl Observation for OperationReport {
    type Status = OperationStatus;

    fn status(&self) -> &OperationStatus {
        &self.status
    }

    fn error_code(&self) -> Option<&str> {
        self.error_code.as_deref()
    }

    fn detail(&self) -> Option<&str> {
        self.status_message.as_deref()
    }
}

/// A resource whose lifetime is tied to another one
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependent {
    /// Kind of dependent (e.g. "snapshot")
    pub kind: String,
    pub id: String,
}

impl Dependent {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for Dependent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} '{}'", self.kind, self.id)
    }
}
