//! Create/Read/Update/Delete orchestration against an [`ApiClient`]
//!
//! Within one operation the steps run strictly in order: capture identifier,
//! issue mutation, poll to a terminal status, then read back. Each error is
//! attributed to the phase it happened in.

use crate::client::{
    ApiClient, FieldGroup, OperationReport, OperationStatus, OperationToken, ReadOutput,
    UpdatePayload, UpdateStrategy,
};
use crate::config::ReconcilerConfig;
use crate::error::{
    ApiError, ApiResult, DependentFailure, ErrorClassifier, Phase, ReconcileError, ResourceRef, Result,
};
use crate::model::{ChangeSet, ResourceSpec};
use crate::patch;
use crate::poller::{PollError, Poller, RetryError, retry_transient};
use crate::state::{LifecycleStatus, ObservedState};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Whether the caller is reading a resource it just created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Must eventually appear; not-found is consistency lag and a failed status is an error
    NewResource,
    /// Already tracked; not-found or a failed status means it was deleted out of band
    Existing,
}

/// Create failed, possibly after the remote assigned an identifier
///
/// `partial` carries the identifier whenever one was captured, so the caller
/// can still target the resource for cleanup.
#[derive(Error, Debug)]
#[error("{source}")]
pub struct CreateError {
    pub partial: Option<ObservedState>,
    pub source: ReconcileError,
}

impl CreateError {
    fn before_id(source: ReconcileError) -> Self {
        Self {
            partial: None,
            source,
        }
    }

    pub fn identifier(&self) -> Option<&str> {
        self.partial.as_ref().map(|s| s.id.as_str())
    }
}

/// Drives one resource type towards its desired state
///
/// Holds no mutable state; distinct resources may be reconciled concurrently
/// through the same instance.
pub struct Reconciler {
    client: Arc<dyn ApiClient>,
    config: ReconcilerConfig,
    classifier: ErrorClassifier,
    cancel: Option<CancellationToken>,
}

impl Reconciler {
    pub fn new(client: Arc<dyn ApiClient>, config: ReconcilerConfig) -> Self {
        Self {
            client,
            config,
            classifier: ErrorClassifier::default(),
            cancel: None,
        }
    }

    /// Table used to recognize "already gone" failures during delete
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Stop polling and retries as soon as `token` fires
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    fn resource_type(&self) -> &str {
        self.client.resource_type()
    }

    /// Create the resource and wait until it is available
    pub async fn create(&self, spec: &ResourceSpec) -> std::result::Result<ObservedState, CreateError> {
        let client = self.client.as_ref();
        tracing::info!("Creating {}", self.resource_type());

        let output = self
            .call(
                Phase::Create,
                &ResourceRef::unassigned(),
                self.config.propagation_timeout(),
                || client.create(spec),
            )
            .await
            .map_err(CreateError::before_id)?;

        let mut id = output.id.clone();
        if let Some(id) = &id {
            tracing::debug!("Captured identifier {} before waiting", id);
        }

        if let Some(token) = &output.token {
            let (seen, result) = self.wait_tracking_identifier(Phase::Create, token, id.clone()).await;
            id = seen.or(id);

            if let Err(e) = result {
                let source = e.into_reconcile(Phase::Create, ResourceRef(id.clone()));
                tracing::warn!("Creation did not complete: {}", source);
                return Err(CreateError {
                    partial: id.map(|id| self.partial_state(id, &output.raw)),
                    source,
                });
            }
        }

        let Some(id) = id else {
            return Err(CreateError::before_id(ReconcileError::Permanent {
                phase: Phase::Create,
                resource: ResourceRef::unassigned(),
                source: ApiError::permanent(format!(
                    "{} create completed without returning an identifier",
                    self.resource_type()
                )),
            }));
        };

        match self.read(&id, ReadMode::NewResource).await {
            Ok(Some(state)) => {
                tracing::info!("Created {} {}", self.resource_type(), id);
                Ok(state)
            }
            Ok(None) => Err(CreateError {
                source: ReconcileError::NotFound {
                    phase: Phase::Read,
                    resource: ResourceRef::id(&id),
                    message: "resource disappeared right after creation".to_string(),
                },
                partial: Some(self.partial_state(id, &output.raw)),
            }),
            Err(source) => Err(CreateError {
                partial: Some(self.partial_state(id, &output.raw)),
                source,
            }),
        }
    }

    /// Wait for an operation started earlier, possibly by another process
    ///
    /// Failures are attributed to [`Phase::Poll`] and name the identifier the
    /// operation reported, if any.
    pub async fn resume(&self, token: &OperationToken) -> Result<OperationReport> {
        tracing::info!("Resuming operation {}", token);
        let (id, result) = self.wait_tracking_identifier(Phase::Poll, token, None).await;
        result.map_err(|e| e.into_reconcile(Phase::Poll, ResourceRef(id)))
    }

    /// Poll `token` to a terminal status, keeping the first identifier any report carries
    async fn wait_tracking_identifier(
        &self,
        phase: Phase,
        token: &OperationToken,
        known: Option<String>,
    ) -> (
        Option<String>,
        std::result::Result<OperationReport, PollError>,
    ) {
        let client = self.client.as_ref();
        let seen = Mutex::new(known);
        let result = self
            .operation_poller(phase, token)
            .poll(|| {
                let seen = &seen;
                async move {
                    let report = client.operation_status(token).await?;
                    if let (Some(identifier), Ok(mut captured)) = (&report.identifier, seen.lock()) {
                        captured.get_or_insert_with(|| identifier.clone());
                    }
                    Ok::<_, ApiError>(report)
                }
            })
            .await;
        (seen.into_inner().unwrap_or(None), result)
    }

    fn partial_state(&self, id: String, raw: &Value) -> ObservedState {
        ObservedState::new(id, self.resource_type())
            .with_raw(raw.clone())
            .with_status(LifecycleStatus::Failed)
    }

    /// Refresh observed state; `Ok(None)` means the resource no longer exists
    pub async fn read(&self, id: &str, mode: ReadMode) -> Result<Option<ObservedState>> {
        let client = self.client.as_ref();
        let resource = ResourceRef::id(id);
        let new = mode == ReadMode::NewResource;
        let budget = if new {
            self.config.consistency_timeout()
        } else {
            self.config.propagation_timeout()
        };

        let lagging = AtomicBool::new(false);
        let result = retry_transient(&self.config.retry_policy(budget), self.cancel.as_ref(), || {
            let lagging = &lagging;
            async move {
                match client.read(id).await {
                    Err(e) if new && e.is_not_found() => {
                        lagging.store(true, Ordering::SeqCst);
                        Err(e.into_transient())
                    }
                    other => {
                        lagging.store(false, Ordering::SeqCst);
                        other
                    }
                }
            }
        })
        .await;

        let output = match result {
            Ok(output) => output,
            Err(RetryError::Api(e)) if e.is_not_found() => {
                tracing::debug!("{} {} not found", self.resource_type(), id);
                return Ok(None);
            }
            Err(RetryError::Exhausted { attempts, source }) if lagging.load(Ordering::SeqCst) => {
                return Err(ReconcileError::NotFound {
                    phase: Phase::Read,
                    resource,
                    message: format!(
                        "still not visible {:?} after creation ({} attempts): {}",
                        budget, attempts, source
                    ),
                });
            }
            Err(e) => return Err(e.into_reconcile(Phase::Read, resource)),
        };

        self.settle(id, output, mode).await
    }

    /// Turn a read into a result, waiting out a pending status
    async fn settle(
        &self,
        id: &str,
        output: ReadOutput,
        mode: ReadMode,
    ) -> Result<Option<ObservedState>> {
        match output.status {
            LifecycleStatus::Available => Ok(Some(self.observed(id, output))),
            LifecycleStatus::Pending => self.wait_until_available(id, mode).await,
            status => self.terminal(id, status, mode),
        }
    }

    async fn wait_until_available(&self, id: &str, mode: ReadMode) -> Result<Option<ObservedState>> {
        let client = self.client.as_ref();
        let new = mode == ReadMode::NewResource;
        tracing::debug!("{} {} is pending, waiting until available", self.resource_type(), id);

        let mut poller = Poller::new(
            [LifecycleStatus::Pending],
            [LifecycleStatus::Available],
            self.config.poll_config(Phase::Read),
        )
        .with_correlation(id);
        if let Some(token) = &self.cancel {
            poller = poller.with_cancellation(token.clone());
        }

        let result = poller
            .poll(|| async move {
                client
                    .read(id)
                    .await
                    .map_err(|e| if new && e.is_not_found() { e.into_transient() } else { e })
            })
            .await;

        match result {
            Ok(output) => Ok(Some(self.observed(id, output))),
            Err(PollError::Api(e)) if e.is_not_found() => Ok(None),
            Err(PollError::Failed { status, .. }) if !new => {
                tracing::warn!(
                    "{} {} went to {} while pending, treating as deleted",
                    self.resource_type(),
                    id,
                    status
                );
                Ok(None)
            }
            Err(e) => Err(e.into_reconcile(Phase::Read, ResourceRef::id(id))),
        }
    }

    fn terminal(
        &self,
        id: &str,
        status: LifecycleStatus,
        mode: ReadMode,
    ) -> Result<Option<ObservedState>> {
        match mode {
            ReadMode::NewResource => Err(ReconcileError::OperationFailed {
                phase: Phase::Read,
                resource: ResourceRef::id(id),
                status: status.to_string(),
                code: None,
                detail: Some("resource reached this status right after creation".to_string()),
            }),
            ReadMode::Existing => {
                tracing::warn!(
                    "{} {} is {}, removing from tracking",
                    self.resource_type(),
                    id,
                    status
                );
                Ok(None)
            }
        }
    }

    fn observed(&self, id: &str, output: ReadOutput) -> ObservedState {
        ObservedState::new(id, self.resource_type())
            .with_raw(output.raw)
            .with_status(output.status)
    }

    /// Apply the change from `old` to `new` in place
    pub async fn update(
        &self,
        id: &str,
        old: &ResourceSpec,
        new: &ResourceSpec,
    ) -> Result<ObservedState> {
        let resource = ResourceRef::id(id);
        let changes = old.changes(new);

        let immutable = changes.immutable_changes();
        if !immutable.is_empty() {
            return Err(ReconcileError::ImmutableFieldChanged {
                phase: Phase::Update,
                resource,
                fields: immutable,
            });
        }

        match self.client.update_strategy() {
            UpdateStrategy::Patch => {
                let operations = patch::diff(&old.document(), &new.document());
                if operations.is_empty() {
                    tracing::debug!("{} {} unchanged, skipping update call", self.resource_type(), id);
                } else {
                    tracing::info!(
                        "Updating {} {} with {} patch operation(s)",
                        self.resource_type(),
                        id,
                        operations.len()
                    );
                    self.send_update(id, &resource, UpdatePayload::Patch { operations })
                        .await?;
                }
            }
            UpdateStrategy::Fields(groups) => {
                for payload in field_payloads(&changes, &groups, new) {
                    if let UpdatePayload::Fields { group, .. } = &payload {
                        tracing::info!("Updating {} {} ({})", self.resource_type(), id, group);
                    }
                    self.send_update(id, &resource, payload).await?;
                }
            }
        }

        match self.read(id, ReadMode::Existing).await? {
            Some(state) => Ok(state),
            None => Err(ReconcileError::NotFound {
                phase: Phase::Update,
                resource,
                message: "resource disappeared during update".to_string(),
            }),
        }
    }

    async fn send_update(&self, id: &str, resource: &ResourceRef, payload: UpdatePayload) -> Result<()> {
        let client = self.client.as_ref();
        let output = self
            .call(Phase::Update, resource, self.config.propagation_timeout(), || {
                client.update(id, &payload)
            })
            .await?;

        if let Some(token) = &output.token {
            self.wait_for_operation(Phase::Update, token)
                .await
                .map_err(|e| e.into_reconcile(Phase::Update, resource.clone()))?;
        }
        Ok(())
    }

    /// Delete the resource and its dependents
    ///
    /// Deleting something that is already gone succeeds. Dependent failures do
    /// not undo the primary deletion; they are reported together as
    /// [`ReconcileError::PartialFailure`].
    pub async fn delete(&self, id: &str) -> Result<()> {
        let client = self.client.as_ref();
        let resource = ResourceRef::id(id);
        let budget = self.config.propagation_timeout();
        tracing::info!("Deleting {} {}", self.resource_type(), id);

        let dependents = match self
            .call(Phase::Delete, &resource, budget, || client.dependents(id))
            .await
        {
            Ok(dependents) => dependents,
            Err(e) if self.is_gone(&e) => Vec::new(),
            Err(e) => return Err(e),
        };

        let output = match self
            .call(Phase::Delete, &resource, budget, || client.delete(id))
            .await
        {
            Ok(output) => output,
            Err(e) if self.is_gone(&e) => {
                tracing::warn!("{} {} already deleted", self.resource_type(), id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let Some(token) = &output.token {
            match self.wait_for_operation(Phase::Delete, token).await {
                Ok(_) => {}
                Err(PollError::Failed { code, detail, .. })
                    if self
                        .classifier
                        .is_not_found(code.as_deref(), detail.as_deref().unwrap_or_default()) =>
                {
                    tracing::warn!("{} {} already deleted", self.resource_type(), id);
                }
                Err(PollError::Api(e)) if e.is_not_found() => {
                    tracing::warn!("Lost track of operation {}: {}", token, e);
                    match self
                        .call(Phase::Delete, &resource, budget, || client.read(id))
                        .await
                    {
                        Err(gone) if self.is_gone(&gone) => {}
                        Err(other) => return Err(other),
                        Ok(_) => {
                            return Err(ReconcileError::Permanent {
                                phase: Phase::Delete,
                                resource,
                                source: ApiError::permanent(format!(
                                    "{} {} still exists and operation {} is unknown: {}",
                                    self.resource_type(),
                                    id,
                                    token,
                                    e.message
                                )),
                            });
                        }
                    }
                }
                Err(e) => return Err(e.into_reconcile(Phase::Delete, resource)),
            }
        } else if output.in_progress {
            self.wait_until_absent(id, &resource).await?;
        }

        let mut failures = Vec::new();
        for dependent in &dependents {
            let dependent_ref = ResourceRef::id(&dependent.id);
            match self
                .call(Phase::Delete, &dependent_ref, budget, || {
                    client.delete_dependent(dependent)
                })
                .await
            {
                Ok(()) => tracing::debug!("Deleted dependent {}", dependent),
                Err(e) if self.is_gone(&e) => tracing::debug!("Dependent {} already gone", dependent),
                Err(error) => {
                    tracing::warn!("Failed to delete dependent {}: {}", dependent, error);
                    failures.push(DependentFailure {
                        dependent: dependent.clone(),
                        error,
                    });
                }
            }
        }

        tracing::info!("Deleted {} {}", self.resource_type(), id);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ReconcileError::PartialFailure { resource, failures })
        }
    }

    async fn wait_until_absent(&self, id: &str, resource: &ResourceRef) -> Result<()> {
        let client = self.client.as_ref();
        let mut poller = Poller::new(
            [
                LifecycleStatus::Available,
                LifecycleStatus::Pending,
                LifecycleStatus::Deleting,
            ],
            [LifecycleStatus::Deleted],
            self.config.poll_config(Phase::Delete),
        )
        .with_correlation(id);
        if let Some(token) = &self.cancel {
            poller = poller.with_cancellation(token.clone());
        }

        poller
            .poll(|| async move {
                match client.read(id).await {
                    Err(e) if e.is_not_found() => Ok(ReadOutput {
                        raw: Value::Null,
                        status: LifecycleStatus::Deleted,
                    }),
                    other => other,
                }
            })
            .await
            .map(|_| ())
            .map_err(|e| e.into_reconcile(Phase::Delete, resource.clone()))
    }

    /// Whether an error means the target no longer exists
    fn is_gone(&self, error: &ReconcileError) -> bool {
        match error {
            ReconcileError::NotFound { .. } => true,
            ReconcileError::Permanent { source, .. } => self
                .classifier
                .is_not_found(source.code.as_deref(), &source.message),
            _ => false,
        }
    }

    fn operation_poller(&self, phase: Phase, token: &OperationToken) -> Poller<OperationStatus> {
        let poller = Poller::new(
            OperationStatus::WORKING,
            OperationStatus::DONE,
            self.config.poll_config(phase),
        )
        .with_correlation(token.to_string());
        match &self.cancel {
            Some(cancel) => poller.with_cancellation(cancel.clone()),
            None => poller,
        }
    }

    async fn wait_for_operation(
        &self,
        phase: Phase,
        token: &OperationToken,
    ) -> std::result::Result<OperationReport, PollError> {
        let client = self.client.as_ref();
        self.operation_poller(phase, token)
            .poll(|| client.operation_status(token))
            .await
    }

    /// One API call with transient errors retried for up to `budget`
    async fn call<T, F, Fut>(
        &self,
        phase: Phase,
        resource: &ResourceRef,
        budget: Duration,
        op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        retry_transient(&self.config.retry_policy(budget), self.cancel.as_ref(), op)
            .await
            .map_err(|e| e.into_reconcile(phase, resource.clone()))
    }
}

/// One payload per changed group, then one per changed field outside every group
fn field_payloads(
    changes: &ChangeSet,
    groups: &[FieldGroup],
    desired: &ResourceSpec,
) -> Vec<UpdatePayload> {
    let value_of = |field: &str| desired.get(field).cloned().unwrap_or(Value::Null);
    let mut payloads = Vec::new();
    let mut grouped = BTreeSet::new();

    for group in groups {
        grouped.extend(group.fields.iter().map(String::as_str));
        if !changes.has_any_change(group.fields.iter().map(String::as_str)) {
            continue;
        }
        let values: BTreeMap<String, Value> = group
            .fields
            .iter()
            .map(|field| (field.clone(), value_of(field)))
            .collect();
        payloads.push(UpdatePayload::Fields {
            group: group.name.clone(),
            values,
        });
    }

    for field in changes.changed.iter().filter(|f| !grouped.contains(f.as_str())) {
        payloads.push(UpdatePayload::Fields {
            group: field.clone(),
            values: BTreeMap::from([(field.clone(), value_of(field))]),
        });
    }

    payloads
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_payloads_only_for_changed_groups() {
        let old = ResourceSpec::new("bucket")
            .with_field("versioning", json!(false))
            .with_field("mfa_delete", json!(false))
            .with_field("policy", json!("{}"))
            .with_field("acl", json!("private"));
        let new = old
            .clone()
            .with_field("mfa_delete", json!(true))
            .with_field("acl", json!("public-read"));
        let groups = vec![
            FieldGroup::new("versioning", &["versioning", "mfa_delete"]),
            FieldGroup::new("policy", &["policy"]),
        ];

        let payloads = field_payloads(&old.changes(&new), &groups, &new);

        assert_eq!(
            payloads,
            vec![
                UpdatePayload::Fields {
                    group: "versioning".to_string(),
                    values: BTreeMap::from([
                        ("mfa_delete".to_string(), json!(true)),
                        ("versioning".to_string(), json!(false)),
                    ]),
                },
                UpdatePayload::Fields {
                    group: "acl".to_string(),
                    values: BTreeMap::from([("acl".to_string(), json!("public-read"))]),
                },
            ]
        );
    }

    #[test]
    fn test_removed_field_is_sent_as_null() {
        let old = ResourceSpec::new("queue").with_field("redrive_policy", json!({"max": 3}));
        let new = ResourceSpec::new("queue");

        let payloads = field_payloads(&old.changes(&new), &[], &new);
        assert_eq!(
            payloads,
            vec![UpdatePayload::Fields {
                group: "redrive_policy".to_string(),
                values: BTreeMap::from([("redrive_policy".to_string(), Value::Null)]),
            }]
        );
    }
}
