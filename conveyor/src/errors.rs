//! Error taxonomy for pipeline steps and plan validation.
//!
//! Every step failure carries a classified [`ErrorKind`] so the retry layer
//! and the orchestrator can act on the class without inspecting causes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a step failure.
///
/// The retry layer retries `Transient` errors only; the orchestrator decides
/// run-level consequences from step criticality, never from the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A failure expected to resolve by retrying unchanged (timeout, rate
    /// limit, temporary lock).
    Transient,
    /// Malformed input; never retried. The offending record may be skipped
    /// while the step still succeeds.
    Validation,
    /// A remote object already exists and the strategy forbids overwriting.
    Conflict,
    /// Authentication rejected or a dependency is unavailable; never retried.
    Fatal,
    /// The run was cancelled while the step was in flight.
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Validation => write!(f, "validation"),
            Self::Conflict => write!(f, "conflict"),
            Self::Fatal => write!(f, "fatal"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A classified step failure with a human-readable cause.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct StepError {
    /// The failure class.
    pub kind: ErrorKind,
    /// Human-readable cause.
    pub message: String,
}

impl StepError {
    /// Creates an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Returns true if the retry layer may attempt the operation again.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

/// Classifies a transport-level HTTP failure into a [`StepError`].
///
/// Timeouts and connection failures are transient; authentication rejections
/// are fatal; rate limits and server errors are transient; everything else
/// surfaces as fatal with the status attached.
#[must_use]
pub fn classify_transport_error(err: &reqwest::Error) -> StepError {
    if err.is_timeout() {
        return StepError::transient(format!("request timed out: {err}"));
    }
    if err.is_connect() {
        return StepError::transient(format!("connection failed: {err}"));
    }
    if let Some(status) = err.status() {
        return classify_http_status(status, &err.to_string());
    }
    if err.is_decode() {
        return StepError::validation(format!("malformed response body: {err}"));
    }
    StepError::transient(format!("transport error: {err}"))
}

/// Classifies an HTTP status code into a [`StepError`].
#[must_use]
pub fn classify_http_status(status: reqwest::StatusCode, context: &str) -> StepError {
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return StepError::fatal(format!("authentication rejected ({status}): {context}"));
    }
    if status == reqwest::StatusCode::CONFLICT {
        return StepError::conflict(format!("remote conflict ({status}): {context}"));
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return StepError::transient(format!("remote unavailable ({status}): {context}"));
    }
    StepError::fatal(format!("unexpected status ({status}): {context}"))
}

/// Errors raised while validating a run plan.
#[derive(Debug, Clone, Error)]
pub enum PlanError {
    /// The same step identifier was declared twice.
    #[error("step '{0}' declared more than once")]
    DuplicateStep(String),

    /// A step depends on an identifier absent from the plan.
    #[error("step '{step}' depends on '{dependency}', which is not part of the plan")]
    UnknownDependency {
        /// The declaring step.
        step: String,
        /// The missing dependency.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("dependency cycle detected: {}", cycle_path.join(" -> "))]
    CycleDetected {
        /// The steps forming the cycle.
        cycle_path: Vec<String>,
    },

    /// A requested step identifier does not name a known step.
    #[error("unknown step identifier '{0}'")]
    UnknownStep(String),

    /// A requested subset omits a dependency of one of its steps.
    #[error("requested subset includes '{step}' but not its dependency '{dependency}'")]
    MissingDependency {
        /// The selected step.
        step: String,
        /// The dependency left out of the subset.
        dependency: String,
    },

    /// The plan contains no steps.
    #[error("a run plan requires at least one step")]
    EmptyPlan,
}

/// Errors raised by the deduplicating store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying database reported a failure; the batch rolled back.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The store schema could not be initialized.
    #[error("schema initialization failed: {0}")]
    Schema(String),
}

impl From<StoreError> for StepError {
    fn from(err: StoreError) -> Self {
        match err {
            // Locks and transient I/O are worth retrying under the step policy.
            StoreError::Database(cause) => Self::transient(format!("database error: {cause}")),
            StoreError::Schema(cause) => Self::fatal(format!("schema initialization failed: {cause}")),
        }
    }
}

/// Errors raised while assembling the startup configuration.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// A configuration value could not be parsed.
    #[error("invalid value for {name}: {value}")]
    InvalidValue {
        /// The option name.
        name: String,
        /// The rejected raw value.
        value: String,
    },
}
