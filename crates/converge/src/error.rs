//! Error taxonomy for reconciliation
//!
//! Remote failures are classified exactly once, at the [`ApiClient`](crate::ApiClient)
//! boundary, into an [`ApiError`] carrying an [`ErrorKind`]. Everything above the
//! boundary works with the kind only; the remote message is kept verbatim for display.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::client::Dependent;

/// Phase of a reconciler operation an error is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Create,
    Read,
    Update,
    Delete,
    Poll,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Create => write!(f, "create"),
            Phase::Read => write!(f, "read"),
            Phase::Update => write!(f, "update"),
            Phase::Delete => write!(f, "delete"),
            Phase::Poll => write!(f, "poll"),
        }
    }
}

/// The resource an error refers to, or the fact that no identifier was assigned yet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceRef(pub Option<String>);

impl ResourceRef {
    pub fn id(id: impl Into<String>) -> Self {
        Self(Some(id.into()))
    }

    pub fn unassigned() -> Self {
        Self(None)
    }

    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(id) => write!(f, "resource '{}'", id),
            None => write!(f, "resource (no identifier assigned)"),
        }
    }
}

/// Classified kind of a remote failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The target does not exist remotely
    NotFound,
    /// Eventual-consistency lag; safe to retry
    Transient,
    /// Concurrent modification or version mismatch
    Conflict,
    /// Malformed input, validation failure, disallowed change
    Permanent,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not found"),
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// A classified error returned by an [`ApiClient`](crate::ApiClient)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", display_coded(.code.as_deref(), .message))]
pub struct ApiError {
    pub kind: ErrorKind,
    /// Remote error code, when the service supplies one
    pub code: Option<String>,
    /// Remote diagnostic text, verbatim
    pub message: String,
}

fn display_coded(code: Option<&str>, message: &str) -> String {
    match code {
        Some(code) => format!("{}: {}", code, message),
        None => message.to_string(),
    }
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    /// Reclassify as retryable, keeping code and message
    pub fn into_transient(mut self) -> Self {
        self.kind = ErrorKind::Transient;
        self
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// One entry of an [`ErrorClassifier`] table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub kind: ErrorKind,
    /// Exact remote error code to match, if any
    #[serde(default)]
    pub code: Option<String>,
    /// Case-insensitive substring of the remote message to match, if any
    #[serde(default)]
    pub message_contains: Option<String>,
}

impl ClassificationRule {
    pub fn code(kind: ErrorKind, code: impl Into<String>) -> Self {
        Self {
            kind,
            code: Some(code.into()),
            message_contains: None,
        }
    }

    pub fn message(kind: ErrorKind, needle: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message_contains: Some(needle.into()),
        }
    }

    pub fn code_and_message(
        kind: ErrorKind,
        code: impl Into<String>,
        needle: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code: Some(code.into()),
            message_contains: Some(needle.into()),
        }
    }

    fn matches(&self, code: Option<&str>, message: &str) -> bool {
        if self.code.is_none() && self.message_contains.is_none() {
            return false;
        }
        if let Some(expected) = &self.code {
            if code != Some(expected.as_str()) {
                return false;
            }
        }
        if let Some(needle) = &self.message_contains {
            if !message.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

/// Ordered table mapping raw remote errors to an [`ErrorKind`]
///
/// Supplied by the collaborator that owns the remote API. The first matching
/// rule wins; unmatched errors get the fallback kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassifier {
    pub rules: Vec<ClassificationRule>,
    pub fallback: ErrorKind,
}

impl Default for ErrorClassifier {
    /// Recognized not-found patterns of cloud control-plane APIs
    fn default() -> Self {
        Self {
            rules: vec![
                ClassificationRule::code(ErrorKind::NotFound, "NotFound"),
                ClassificationRule::code_and_message(
                    ErrorKind::NotFound,
                    "HandlerFailureException",
                    "not found",
                ),
                ClassificationRule::message(ErrorKind::NotFound, "not found"),
            ],
            fallback: ErrorKind::Permanent,
        }
    }
}

impl ErrorClassifier {
    pub fn empty(fallback: ErrorKind) -> Self {
        Self {
            rules: Vec::new(),
            fallback,
        }
    }

    pub fn with_rule(mut self, rule: ClassificationRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn classify(&self, code: Option<&str>, message: &str) -> ErrorKind {
        self.rules
            .iter()
            .find(|rule| rule.matches(code, message))
            .map(|rule| rule.kind)
            .unwrap_or(self.fallback)
    }

    pub fn is_not_found(&self, code: Option<&str>, message: &str) -> bool {
        self.classify(code, message) == ErrorKind::NotFound
    }

    /// Build a classified [`ApiError`] from a raw code and message
    pub fn api_error(&self, code: Option<&str>, message: impl Into<String>) -> ApiError {
        let message = message.into();
        ApiError {
            kind: self.classify(code, &message),
            code: code.map(str::to_string),
            message,
        }
    }
}

/// A dependent resource that could not be deleted
#[derive(Debug)]
pub struct DependentFailure {
    pub dependent: Dependent,
    pub error: ReconcileError,
}

impl fmt::Display for DependentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.dependent, self.error)
    }
}

fn display_suffix(code: &Option<String>, detail: &Option<String>) -> String {
    match (code, detail) {
        (Some(code), Some(detail)) => format!(" [{}] {}", code, detail),
        (Some(code), None) => format!(" [{}]", code),
        (None, Some(detail)) => format!(" {}", detail),
        (None, None) => String::new(),
    }
}

fn display_failures(failures: &[DependentFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Reconciler errors
///
/// Every variant names the phase and the resource so repeated invocations are
/// self-describing.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("{phase} {resource}: not found: {message}")]
    NotFound {
        phase: Phase,
        resource: ResourceRef,
        message: String,
    },

    #[error("{phase} {resource}: still failing after {attempts} attempt(s): {source}")]
    Transient {
        phase: Phase,
        resource: ResourceRef,
        attempts: u32,
        source: ApiError,
    },

    #[error("{phase} {resource}: conflicting modification: {source}")]
    Conflict {
        phase: Phase,
        resource: ResourceRef,
        source: ApiError,
    },

    #[error("{phase} {resource}: {source}")]
    Permanent {
        phase: Phase,
        resource: ResourceRef,
        source: ApiError,
    },

    #[error(
        "{phase} {resource}: immutable field(s) changed, resource must be replaced: {}",
        .fields.join(", ")
    )]
    ImmutableFieldChanged {
        phase: Phase,
        resource: ResourceRef,
        fields: Vec<String>,
    },

    #[error(
        "{phase} {resource}: operation ended in unexpected status {status}{}",
        display_suffix(.code, .detail)
    )]
    OperationFailed {
        phase: Phase,
        resource: ResourceRef,
        status: String,
        code: Option<String>,
        detail: Option<String>,
    },

    #[error(
        "{phase} {resource}: timed out after {timeout:?} (last status: {}){}",
        .last_status.as_deref().unwrap_or("none"),
        display_suffix(.code, .detail)
    )]
    PollTimeout {
        phase: Phase,
        resource: ResourceRef,
        timeout: Duration,
        last_status: Option<String>,
        code: Option<String>,
        detail: Option<String>,
    },

    #[error("{phase} {resource}: cancelled")]
    Cancelled { phase: Phase, resource: ResourceRef },

    #[error(
        "delete {resource}: resource deleted, but {} dependent(s) failed to delete: {}. \
        Deleted dependents are gone for good; the failed ones are no longer managed and must be removed manually",
        .failures.len(),
        display_failures(.failures)
    )]
    PartialFailure {
        resource: ResourceRef,
        failures: Vec<DependentFailure>,
    },
}

impl ReconcileError {
    /// Lift a boundary error into the reconciler taxonomy
    pub fn from_api(phase: Phase, resource: ResourceRef, error: ApiError) -> Self {
        match error.kind {
            ErrorKind::NotFound => ReconcileError::NotFound {
                phase,
                resource,
                message: error.to_string(),
            },
            ErrorKind::Transient => ReconcileError::Transient {
                phase,
                resource,
                attempts: 1,
                source: error,
            },
            ErrorKind::Conflict => ReconcileError::Conflict {
                phase,
                resource,
                source: error,
            },
            ErrorKind::Permanent => ReconcileError::Permanent {
                phase,
                resource,
                source: error,
            },
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            ReconcileError::NotFound { phase, .. }
            | ReconcileError::Transient { phase, .. }
            | ReconcileError::Conflict { phase, .. }
            | ReconcileError::Permanent { phase, .. }
            | ReconcileError::ImmutableFieldChanged { phase, .. }
            | ReconcileError::OperationFailed { phase, .. }
            | ReconcileError::PollTimeout { phase, .. }
            | ReconcileError::Cancelled { phase, .. } => *phase,
            ReconcileError::PartialFailure { .. } => Phase::Delete,
        }
    }

    pub fn resource(&self) -> &ResourceRef {
        match self {
            ReconcileError::NotFound { resource, .. }
            | ReconcileError::Transient { resource, .. }
            | ReconcileError::Conflict { resource, .. }
            | ReconcileError::Permanent { resource, .. }
            | ReconcileError::ImmutableFieldChanged { resource, .. }
            | ReconcileError::OperationFailed { resource, .. }
            | ReconcileError::PollTimeout { resource, .. }
            | ReconcileError::Cancelled { resource, .. }
            | ReconcileError::PartialFailure { resource, .. } => resource,
        }
    }

    /// Boundary kind this error was classified as, if it came from the API
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ReconcileError::NotFound { .. } => Some(ErrorKind::NotFound),
            ReconcileError::Transient { .. } => Some(ErrorKind::Transient),
            ReconcileError::Conflict { .. } => Some(ErrorKind::Conflict),
            ReconcileError::Permanent { .. } => Some(ErrorKind::Permanent),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ReconcileError::NotFound { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ReconcileError::PollTimeout { .. })
    }

    /// True when the primary resource is gone despite the error
    pub fn primary_deleted(&self) -> bool {
        matches!(self, ReconcileError::PartialFailure { .. })
    }

    pub fn failed_dependents(&self) -> &[DependentFailure] {
        match self {
            ReconcileError::PartialFailure { failures, .. } => failures,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
