//! Error types for StreamDigest.
//!
//! Library crates use [`DigestError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

use crate::types::{ArtifactType, Operation, SessionId, Stage};

/// Classification of a single failed call to an external service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The call did not complete within its timeout.
    Timeout,
    /// Connection reset, 5xx, or similar transient server-side failure.
    Transient,
    /// The service asked us to slow down (HTTP 429).
    RateLimited,
    /// The service answered, but the output was unusable (empty, out of bounds).
    InvalidOutput,
    /// Credentials were missing or rejected.
    InvalidCredentials,
    /// The request itself was rejected as malformed.
    MalformedPrompt,
}

impl FailureKind {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidCredentials | Self::MalformedPrompt)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::InvalidOutput => "invalid_output",
            Self::InvalidCredentials => "invalid_credentials",
            Self::MalformedPrompt => "malformed_prompt",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What made the first failed candidate of a batch fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchFailure {
    /// A classified external call failure.
    Service(FailureKind),
    /// No rate-limit token became available within the allowed wait.
    RateLimitExceeded,
    /// The candidate task itself failed.
    Other,
}

/// A classified failure from one call to an external service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{service} call failed ({kind}): {message}")]
pub struct ServiceError {
    /// Service name (e.g. `openai`, `flux`, `shortener`).
    pub service: String,
    pub kind: FailureKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(service: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            kind,
            message: message.into(),
        }
    }

    /// A call that exceeded its per-call timeout.
    pub fn timeout(service: impl Into<String>, after: Duration) -> Self {
        Self::new(
            service,
            FailureKind::Timeout,
            format!("no response within {} ms", after.as_millis()),
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Top-level error type for all StreamDigest operations.
#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error outside of a classified service call.
    #[error("network error: {0}")]
    Network(String),

    /// HTML or payload parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad date range, bad index, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The ingestion source could not be reached. The whole call may be retried.
    #[error("ingestion source unavailable: {0}")]
    SourceUnavailable(String),

    /// Ingestion produced nothing usable.
    #[error("ingestion error: {message}")]
    Ingestion { message: String },

    /// No rate-limit token became available within the configured wait.
    #[error("rate limit exceeded for {service}: no token within {waited_ms} ms")]
    RateLimitExceeded { service: String, waited_ms: u64 },

    /// A single classified external call failure.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// A generation batch did not produce the requested number of candidates.
    /// Nothing from the batch was recorded.
    #[error(
        "partial generation for {artifact}: {succeeded}/{requested} candidates succeeded \
         (stage {stage}, {retries_remaining} retries remaining): {cause}"
    )]
    PartialGeneration {
        artifact: ArtifactType,
        succeeded: usize,
        requested: usize,
        stage: Stage,
        retries_remaining: u32,
        failure: BatchFailure,
        cause: String,
    },

    /// The operation is not allowed in the session's current stage.
    #[error("invalid state transition: cannot {operation} in stage {stage}")]
    InvalidStateTransition { stage: Stage, operation: Operation },

    /// The final document could not be assembled. The session stays retryable.
    #[error("finalization error in stage {stage}: {message}")]
    Finalization { stage: Stage, message: String },

    /// The session was aborted while the operation was in flight.
    #[error("{operation} cancelled: session aborted")]
    Cancelled { operation: Operation },

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DigestError>;

impl DigestError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an ingestion error from any displayable message.
    pub fn ingestion(msg: impl Into<String>) -> Self {
        Self::Ingestion {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the caller can reasonably retry the same call.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SourceUnavailable(_)
            | Self::Network(_)
            | Self::RateLimitExceeded { .. }
            | Self::PartialGeneration { .. }
            | Self::Finalization { .. } => true,
            Self::Service(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Classify this error as the cause of a failed batch.
    pub fn batch_failure(&self) -> BatchFailure {
        match self {
            Self::Service(e) => BatchFailure::Service(e.kind),
            Self::RateLimitExceeded { .. } => BatchFailure::RateLimitExceeded,
            Self::PartialGeneration { failure, .. } => *failure,
            _ => BatchFailure::Other,
        }
    }

    /// The session stage recorded in the error, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::PartialGeneration { stage, .. }
            | Self::InvalidStateTransition { stage, .. }
            | Self::Finalization { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
