//! In-memory control plane for converge
//!
//! [`MemoryCloud`] implements [`ApiClient`] over a map of JSON documents. It can
//! be scripted to behave like an eventually consistent remote API: reads that
//! lag behind creation, resources that stay pending for a while, asynchronous
//! operations with a fixed status sequence, dependents that refuse deletion and
//! one-shot injected errors.
//!
//! ```no_run
//! use converge::{OperationStatus, Reconciler, ReconcilerConfig, ResourceSpec};
//! use converge_memory::MemoryCloud;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let cloud = Arc::new(
//!     MemoryCloud::new("AWS::Logs::LogGroup")
//!         .with_read_lag(2)
//!         .asynchronous([OperationStatus::InProgress, OperationStatus::Success]),
//! );
//! let reconciler = Reconciler::new(cloud.clone(), ReconcilerConfig::default());
//! let spec = ResourceSpec::new("AWS::Logs::LogGroup").with_field("retention", json!(7));
//! let state = reconciler.create(&spec).await?;
//! assert!(cloud.contains(&state.id).await);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use converge::{
    ApiClient, ApiError, ApiResult, CreateOutput, DeleteOutput, Dependent, ErrorClassifier,
    LifecycleStatus, OperationReport, OperationStatus, OperationToken, ReadOutput, ResourceSpec,
    UpdateOutput, UpdatePayload, UpdateStrategy,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::Mutex;

/// API call of the simulated remote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    Create,
    Read,
    Update,
    Delete,
    OperationStatus,
    Dependents,
    DeleteDependent,
}

#[derive(Debug, Clone)]
struct Stored {
    doc: Value,
    /// Reads left that answer not-found
    lag: u32,
    /// Reads left that answer pending
    pending: u32,
    /// Reads left that still answer available once deletion started
    lingering: u32,
    /// Reads left that answer deleting before the resource disappears
    deleting: Option<u32>,
    /// Status forced from outside
    status: Option<LifecycleStatus>,
}

#[derive(Debug)]
struct Operation {
    identifier: Option<String>,
    /// Deletion finishes when the operation reports success
    removes: bool,
    script: VecDeque<OperationStatus>,
}

#[derive(Debug, Default)]
struct Inner {
    resources: BTreeMap<String, Stored>,
    operations: HashMap<String, Operation>,
    dependents: BTreeMap<String, Vec<Dependent>>,
    dependent_faults: HashMap<String, ApiError>,
    faults: HashMap<Call, VecDeque<ApiError>>,
    calls: HashMap<Call, u32>,
    updates: Vec<UpdatePayload>,
    deleted_dependents: Vec<Dependent>,
    next_id: u32,
    next_token: u32,
}

impl Inner {
    /// Count the call and surface an injected fault, if one is queued
    fn record(&mut self, call: Call) -> ApiResult<()> {
        *self.calls.entry(call).or_default() += 1;
        match self.faults.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(error) => {
                tracing::debug!("Injected {:?} failure: {}", call, error);
                Err(error)
            }
            None => Ok(()),
        }
    }
}

/// Simulated remote API for one resource type
pub struct MemoryCloud {
    resource_type: String,
    id_prefix: String,
    classifier: ErrorClassifier,
    update_strategy: UpdateStrategy,
    read_lag: u32,
    pending_reads: u32,
    lingering_reads: u32,
    deleting_reads: Option<u32>,
    script: Option<Vec<OperationStatus>>,
    operation_error: Option<(String, String)>,
    inner: Mutex<Inner>,
}

impl MemoryCloud {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id_prefix: "res".to_string(),
            classifier: ErrorClassifier::default(),
            update_strategy: UpdateStrategy::Patch,
            read_lag: 0,
            pending_reads: 0,
            lingering_reads: 0,
            deleting_reads: None,
            script: None,
            operation_error: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Prefix of generated identifiers
    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = prefix.into();
        self
    }

    /// Table used by [`MemoryCloud::fail_next_raw`] to classify raw errors
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_update_strategy(mut self, strategy: UpdateStrategy) -> Self {
        self.update_strategy = strategy;
        self
    }

    /// Reads of a new resource answer not-found this many times first
    pub fn with_read_lag(mut self, reads: u32) -> Self {
        self.read_lag = reads;
        self
    }

    /// Reads after create or update answer pending this many times first
    pub fn with_pending_reads(mut self, reads: u32) -> Self {
        self.pending_reads = reads;
        self
    }

    /// Delete is accepted in progress; reads still answer available this many times
    pub fn with_lingering_reads(mut self, reads: u32) -> Self {
        self.lingering_reads = reads;
        self
    }

    /// Delete is accepted in progress; reads answer deleting this many times
    pub fn with_deleting_reads(mut self, reads: u32) -> Self {
        self.deleting_reads = Some(reads);
        self
    }

    /// Run create, update and delete asynchronously
    ///
    /// Every operation reports `script` in order and then keeps reporting the
    /// last status. Asynchronous creates only reveal the identifier through
    /// the operation report, and asynchronous deletes remove the resource once
    /// their operation reports success.
    pub fn asynchronous(mut self, script: impl IntoIterator<Item = OperationStatus>) -> Self {
        self.script = Some(script.into_iter().collect());
        self
    }

    /// Error code and message attached to failed operation reports
    pub fn with_operation_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.operation_error = Some((code.into(), message.into()));
        self
    }

    /// Make the next `call` fail with `error`
    pub async fn fail_next(&self, call: Call, error: ApiError) {
        self.inner
            .lock()
            .await
            .faults
            .entry(call)
            .or_default()
            .push_back(error);
    }

    /// Make the next `call` fail with a raw remote error, classified like a real client would
    pub async fn fail_next_raw(&self, call: Call, code: &str, message: &str) {
        let error = self.classifier.api_error(Some(code), message);
        self.fail_next(call, error).await;
    }

    /// Seed an existing resource
    pub async fn insert(&self, id: impl Into<String>, doc: Value) {
        let id = id.into();
        let doc = with_id(doc, &id);
        self.inner.lock().await.resources.insert(
            id,
            Stored {
                doc,
                lag: 0,
                pending: 0,
                lingering: 0,
                deleting: None,
                status: None,
            },
        );
    }

    /// Delete behind the reconciler's back
    pub async fn remove(&self, id: &str) -> bool {
        self.inner.lock().await.resources.remove(id).is_some()
    }

    /// Force the status reads report for `id`
    pub async fn set_status(&self, id: &str, status: LifecycleStatus) {
        if let Some(stored) = self.inner.lock().await.resources.get_mut(id) {
            stored.status = Some(status);
        }
    }

    pub async fn add_dependent(&self, id: &str, dependent: Dependent) {
        self.inner
            .lock()
            .await
            .dependents
            .entry(id.to_string())
            .or_default()
            .push(dependent);
    }

    /// Make every delete of the dependent with `dependent_id` fail
    pub async fn fail_dependent(&self, dependent_id: &str, error: ApiError) {
        self.inner
            .lock()
            .await
            .dependent_faults
            .insert(dependent_id.to_string(), error);
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.lock().await.resources.contains_key(id)
    }

    pub async fn document(&self, id: &str) -> Option<Value> {
        self.inner
            .lock()
            .await
            .resources
            .get(id)
            .map(|stored| stored.doc.clone())
    }

    /// Number of times `call` reached the remote
    pub async fn calls(&self, call: Call) -> u32 {
        self.inner
            .lock()
            .await
            .calls
            .get(&call)
            .copied()
            .unwrap_or(0)
    }

    /// Update payloads received, in order
    pub async fn updates(&self) -> Vec<UpdatePayload> {
        self.inner.lock().await.updates.clone()
    }

    pub async fn deleted_dependents(&self) -> Vec<Dependent> {
        self.inner.lock().await.deleted_dependents.clone()
    }

    fn not_found(&self, id: &str) -> ApiError {
        ApiError::not_found(format!("{} '{}' not found", self.resource_type, id))
            .with_code("ResourceNotFoundException")
    }

    /// Start an asynchronous operation when scripted to
    fn start_operation(
        &self,
        inner: &mut Inner,
        identifier: Option<&str>,
        removes: bool,
    ) -> Option<OperationToken> {
        let script = self.script.as_ref()?;
        inner.next_token += 1;
        let token = format!("op-{:04}", inner.next_token);
        inner.operations.insert(
            token.clone(),
            Operation {
                identifier: identifier.map(str::to_string),
                removes,
                script: script.iter().copied().collect(),
            },
        );
        tracing::debug!("Started operation {}", token);
        Some(OperationToken::new(token))
    }
}

fn with_id(doc: Value, id: &str) -> Value {
    let mut map = match doc {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    map.insert("id".to_string(), Value::String(id.to_string()));
    Value::Object(map)
}

#[async_trait]
impl ApiClient for MemoryCloud {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn update_strategy(&self) -> UpdateStrategy {
        self.update_strategy.clone()
    }

    async fn create(&self, spec: &ResourceSpec) -> ApiResult<CreateOutput> {
        let mut inner = self.inner.lock().await;
        inner.record(Call::Create)?;

        inner.next_id += 1;
        let id = format!("{}-{:04}", self.id_prefix, inner.next_id);
        let doc = with_id(spec.document(), &id);
        inner.resources.insert(
            id.clone(),
            Stored {
                doc: doc.clone(),
                lag: self.read_lag,
                pending: self.pending_reads,
                lingering: 0,
                deleting: None,
                status: None,
            },
        );
        tracing::debug!("Created {} {}", self.resource_type, id);

        match self.start_operation(&mut inner, Some(&id), false) {
            Some(token) => Ok(CreateOutput::pending(None, token)),
            None => Ok(CreateOutput::sync(id, doc)),
        }
    }

    async fn read(&self, id: &str) -> ApiResult<ReadOutput> {
        let mut inner = self.inner.lock().await;
        inner.record(Call::Read)?;

        let Some(stored) = inner.resources.get_mut(id) else {
            return Err(self.not_found(id));
        };

        if stored.lag > 0 {
            stored.lag -= 1;
            return Err(self.not_found(id));
        }

        let status = match stored.deleting {
            Some(_) if stored.lingering > 0 => {
                stored.lingering -= 1;
                Some(LifecycleStatus::Available)
            }
            Some(0) => None,
            Some(left) => {
                stored.deleting = Some(left - 1);
                Some(LifecycleStatus::Deleting)
            }
            None if stored.pending > 0 => {
                stored.pending -= 1;
                Some(LifecycleStatus::Pending)
            }
            None => Some(stored.status.unwrap_or(LifecycleStatus::Available)),
        };

        match status {
            Some(status) => Ok(ReadOutput {
                raw: stored.doc.clone(),
                status,
            }),
            None => {
                inner.resources.remove(id);
                Err(self.not_found(id))
            }
        }
    }

    async fn update(&self, id: &str, payload: &UpdatePayload) -> ApiResult<UpdateOutput> {
        let mut inner = self.inner.lock().await;
        inner.record(Call::Update)?;
        inner.updates.push(payload.clone());

        let Some(stored) = inner.resources.get_mut(id) else {
            return Err(self.not_found(id));
        };

        match payload {
            UpdatePayload::Patch { operations } => {
                converge::patch::apply(&mut stored.doc, operations)
                    .map_err(|e| ApiError::permanent(e.to_string()).with_code("InvalidRequest"))?;
            }
            UpdatePayload::Fields { values, .. } => {
                if let Value::Object(map) = &mut stored.doc {
                    for (field, value) in values {
                        if value.is_null() {
                            map.remove(field);
                        } else {
                            map.insert(field.clone(), value.clone());
                        }
                    }
                }
            }
        }
        stored.pending = self.pending_reads;
        let raw = stored.doc.clone();
        tracing::debug!("Updated {} {}", self.resource_type, id);

        let token = self.start_operation(&mut inner, Some(id), false);
        Ok(UpdateOutput {
            raw: Some(raw),
            token,
        })
    }

    async fn delete(&self, id: &str) -> ApiResult<DeleteOutput> {
        let mut inner = self.inner.lock().await;
        inner.record(Call::Delete)?;

        if !inner.resources.contains_key(id) {
            return Err(self.not_found(id));
        }

        if let Some(token) = self.start_operation(&mut inner, Some(id), true) {
            return Ok(DeleteOutput {
                token: Some(token),
                in_progress: false,
            });
        }

        if self.deleting_reads.is_some() || self.lingering_reads > 0 {
            if let Some(stored) = inner.resources.get_mut(id) {
                stored.lingering = self.lingering_reads;
                stored.deleting = Some(self.deleting_reads.unwrap_or(0));
            }
            return Ok(DeleteOutput {
                token: None,
                in_progress: true,
            });
        }

        inner.resources.remove(id);
        tracing::debug!("Deleted {} {}", self.resource_type, id);
        Ok(DeleteOutput::default())
    }

    async fn operation_status(&self, token: &OperationToken) -> ApiResult<OperationReport> {
        let mut inner = self.inner.lock().await;
        inner.record(Call::OperationStatus)?;

        let Some(operation) = inner.operations.get_mut(&token.0) else {
            return Err(ApiError::not_found(format!("operation {} not found", token))
                .with_code("RequestTokenNotFoundException"));
        };

        let status = if operation.script.len() > 1 {
            operation.script.pop_front()
        } else {
            operation.script.front().copied()
        }
        .unwrap_or(OperationStatus::Success);

        let mut report = OperationReport::new(status);
        let identifier = operation.identifier.clone();
        let removes = operation.removes;
        if let Some(identifier) = &identifier {
            report = report.with_identifier(identifier.clone());
        }
        if status == OperationStatus::Failed {
            if let Some((code, message)) = &self.operation_error {
                report = report.with_error(code.clone(), message.clone());
            }
        }
        if status == OperationStatus::Success && removes {
            if let Some(identifier) = &identifier {
                inner.resources.remove(identifier);
                tracing::debug!("Deleted {} {}", self.resource_type, identifier);
            }
        }
        Ok(report)
    }

    async fn dependents(&self, id: &str) -> ApiResult<Vec<Dependent>> {
        let mut inner = self.inner.lock().await;
        inner.record(Call::Dependents)?;

        if !inner.resources.contains_key(id) {
            return Err(self.not_found(id));
        }
        Ok(inner.dependents.get(id).cloned().unwrap_or_default())
    }

    async fn delete_dependent(&self, dependent: &Dependent) -> ApiResult<()> {
        let mut inner = self.inner.lock().await;
        inner.record(Call::DeleteDependent)?;

        if let Some(error) = inner.dependent_faults.get(&dependent.id) {
            return Err(error.clone());
        }
        inner.deleted_dependents.push(dependent.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_read_lag_then_available() {
        let cloud = MemoryCloud::new("queue").with_read_lag(1);
        let out = cloud
            .create(&ResourceSpec::new("queue").with_field("fifo", json!(true)))
            .await
            .unwrap();
        let id = out.id.unwrap();
        assert_eq!(id, "res-0001");

        assert!(cloud.read(&id).await.unwrap_err().is_not_found());
        let read = cloud.read(&id).await.unwrap();
        assert_eq!(read.status, LifecycleStatus::Available);
        assert_eq!(read.raw, json!({"fifo": true, "id": "res-0001"}));
        assert_eq!(cloud.calls(Call::Read).await, 2);
    }

    #[tokio::test]
    async fn test_operation_script_repeats_last_status() {
        let cloud = MemoryCloud::new("queue")
            .asynchronous([OperationStatus::InProgress, OperationStatus::Failed])
            .with_operation_error("InvalidRequest", "bad retention");
        let out = cloud.create(&ResourceSpec::new("queue")).await.unwrap();
        assert_eq!(out.id, None);
        let token = out.token.unwrap();

        let first = cloud.operation_status(&token).await.unwrap();
        assert_eq!(first.status, OperationStatus::InProgress);
        assert_eq!(first.identifier.as_deref(), Some("res-0001"));

        for _ in 0..2 {
            let report = cloud.operation_status(&token).await.unwrap();
            assert_eq!(report.status, OperationStatus::Failed);
            assert_eq!(report.error_code.as_deref(), Some("InvalidRequest"));
        }
    }

    #[tokio::test]
    async fn test_injected_fault_is_one_shot() {
        let cloud = MemoryCloud::new("queue");
        cloud.insert("q-1", json!({"fifo": false})).await;
        cloud
            .fail_next_raw(Call::Read, "HandlerFailureException", "Queue was not found")
            .await;

        let err = cloud.read("q-1").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.code.as_deref(), Some("HandlerFailureException"));
        assert_ok!(cloud.read("q-1").await);
    }

    #[tokio::test]
    async fn test_fields_update_removes_null_values() {
        let cloud = MemoryCloud::new("queue");
        cloud.insert("q-1", json!({"fifo": false, "policy": "{}"})).await;

        let payload = UpdatePayload::Fields {
            group: "policy".to_string(),
            values: BTreeMap::from([("policy".to_string(), Value::Null)]),
        };
        cloud.update("q-1", &payload).await.unwrap();

        assert_eq!(
            cloud.document("q-1").await,
            Some(json!({"fifo": false, "id": "q-1"}))
        );
    }

    #[tokio::test]
    async fn test_deleting_reads_then_gone() {
        let cloud = MemoryCloud::new("volume").with_deleting_reads(1);
        cloud.insert("vol-1", json!({})).await;

        let out = cloud.delete("vol-1").await.unwrap();
        assert!(out.in_progress);
        assert_eq!(
            cloud.read("vol-1").await.unwrap().status,
            LifecycleStatus::Deleting
        );
        assert!(cloud.read("vol-1").await.unwrap_err().is_not_found());
        assert!(!cloud.contains("vol-1").await);
    }

    #[tokio::test]
    async fn test_lingering_reads_before_gone() {
        let cloud = MemoryCloud::new("gateway").with_lingering_reads(2);
        cloud.insert("cgw-1", json!({})).await;

        let out = cloud.delete("cgw-1").await.unwrap();
        assert!(out.in_progress);
        for _ in 0..2 {
            assert_eq!(
                cloud.read("cgw-1").await.unwrap().status,
                LifecycleStatus::Available
            );
        }
        assert!(cloud.read("cgw-1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_async_delete_removes_on_success() {
        let cloud = MemoryCloud::new("queue")
            .asynchronous([OperationStatus::InProgress, OperationStatus::Success]);
        cloud.insert("q-1", json!({})).await;

        let token = cloud.delete("q-1").await.unwrap().token.unwrap();
        assert_ok!(cloud.operation_status(&token).await);
        assert!(cloud.contains("q-1").await);
        assert_ok!(cloud.operation_status(&token).await);
        assert!(!cloud.contains("q-1").await);
    }
}
