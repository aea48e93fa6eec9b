//! Converge
//!
//! Declarative resource reconciliation core: drives remote resources towards a
//! desired configuration through create, read, update and delete.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                   Reconciler                     │
//! │        create / read / update / delete           │
//! └───────┬──────────────────┬──────────────────┬───┘
//!         │                  │                  │
//! ┌───────▼───────┐  ┌───────▼───────┐  ┌───────▼───────┐
//! │     patch     │  │    poller     │  │     error     │
//! │  JSON Patch   │  │ wait-for-state│  │ classification│
//! └───────────────┘  └───────┬───────┘  └───────────────┘
//!                            │
//! ┌──────────────────────────▼──────────────────────┐
//! │        trait ApiClient (one per resource type)   │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! The crate never installs a tracing subscriber; binaries decide where logs go.

pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod patch;
pub mod poller;
pub mod reconciler;
pub mod state;

// Re-exports
pub use client::{
    ApiClient, CreateOutput, DeleteOutput, Dependent, FieldGroup, OperationReport,
    OperationStatus, OperationToken, ReadOutput, UpdateOutput, UpdatePayload, UpdateStrategy,
};
pub use config::ReconcilerConfig;
pub use error::{
    ApiError, ApiResult, ClassificationRule, DependentFailure, ErrorClassifier, ErrorKind, Phase,
    ReconcileError, ResourceRef, Result,
};
pub use model::{AttributeMap, ChangeSet, ModelError, ResourceModel, ResourceSpec};
pub use patch::{PatchError, PatchOp, PatchOperation};
pub use poller::{
    Backoff, Observation, PollConfig, PollError, Poller, RetryError, RetryPolicy,
    retry_transient,
};
pub use reconciler::{CreateError, ReadMode, Reconciler};
pub use state::{LifecycleStatus, ObservedState};
pub use tokio_util::sync::CancellationToken;
