//! Error types for roomcast.
//!
//! Errors are split into two categories:
//! - **Command/config errors** ([`EngineError`]): Returned from manager and
//!   dispatcher operations. These never retry.
//! - **Attempt-level errors** ([`TransportError`], [`DeliveryError`]):
//!   Produced by a single connect/write/POST attempt. The owning unit or
//!   dispatcher absorbs them, classifies them via [`FailureKind`], and
//!   retries per the configured [`RetryPolicy`](crate::RetryPolicy).

use std::path::PathBuf;

use crate::config::OutputId;
use crate::output::UnitState;
use crate::webhook::EndpointId;

/// Classification of an attempt-level failure.
///
/// Drives the retry decision: `Transient` failures are retried with backoff,
/// `Permanent` failures surface immediately without any retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retryable: timeouts, connection resets, 5xx responses, rate limits.
    Transient,
    /// Not retryable: auth rejections, malformed requests, 4xx responses.
    Permanent,
}

/// Errors returned from engine commands and configuration.
///
/// These indicate a rejected operation, not a runtime delivery problem.
/// Runtime failures inside an output unit or webhook delivery surface as
/// status/events instead, never as panics or propagated errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A destination or endpoint configuration was rejected before any
    /// connection attempt.
    #[error("invalid config: {reason}")]
    InvalidConfig {
        /// What was wrong with the configuration.
        reason: String,
    },

    /// No output with the given id exists in this room.
    #[error("output {id} not found")]
    OutputNotFound {
        /// The id that wasn't found.
        id: OutputId,
    },

    /// No webhook endpoint with the given id exists for this organization.
    #[error("webhook endpoint {id} not found")]
    EndpointNotFound {
        /// The id that wasn't found.
        id: EndpointId,
    },

    /// The command is not valid in the unit's current state.
    #[error("cannot {operation} output {id} while {state}")]
    InvalidState {
        /// The id of the output the command addressed.
        id: OutputId,
        /// The rejected operation.
        operation: &'static str,
        /// The state the unit was in.
        state: UnitState,
    },

    /// The destination is disabled; enable it before starting.
    #[error("output {id} is disabled")]
    OutputDisabled {
        /// The id of the disabled output.
        id: OutputId,
    },

    /// The output's worker task is no longer running.
    ///
    /// This only happens if the runtime is shutting down underneath the
    /// manager.
    #[error("output {id} worker is gone")]
    WorkerGone {
        /// The id of the orphaned output.
        id: OutputId,
    },
}

impl EngineError {
    /// Creates an `InvalidConfig` error with the given reason.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// Errors from a single connect/write/close attempt on an output transport.
///
/// Transport errors are recoverable: the owning
/// [`OutputManager`](crate::OutputManager) unit classifies them via
/// [`TransportError::kind`] and reconnects with backoff when transient.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The destination did not respond within the configured timeout.
    #[error("{operation} timed out")]
    Timeout {
        /// The operation that timed out (`connect` or `write`).
        operation: &'static str,
    },

    /// The connection was established but dropped mid-stream.
    #[error("connection reset: {reason}")]
    ConnectionReset {
        /// Description of the reset.
        reason: String,
    },

    /// The destination rejected the configured credentials.
    #[error("authentication rejected: {reason}")]
    AuthRejected {
        /// What the destination reported.
        reason: String,
    },

    /// The destination cannot accept the stream's codec or format.
    #[error("format not accepted: {reason}")]
    FormatRejected {
        /// What the destination reported.
        reason: String,
    },

    /// A write operation failed.
    #[error("write failed: {reason}")]
    WriteFailed {
        /// Description of what went wrong.
        reason: String,
    },

    /// File I/O error from a recording destination.
    #[error("file error: {path}: {source}")]
    File {
        /// Path to the file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Custom error for user-implemented transports.
    ///
    /// Carries an explicit classification so external transports can signal
    /// either failure kind.
    #[error("{message}")]
    Custom {
        /// Whether the failure should be retried.
        kind: FailureKind,
        /// Description of the failure.
        message: String,
    },
}

impl TransportError {
    /// Creates a transient custom error with the given message.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Custom {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    /// Creates a permanent custom error with the given message.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Custom {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    /// Creates a write failed error with the given reason.
    pub fn write_failed(reason: impl Into<String>) -> Self {
        Self::WriteFailed {
            reason: reason.into(),
        }
    }

    /// Creates a file error for the given path.
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }

    /// Returns the retry classification for this error.
    ///
    /// Auth and format rejections are permanent; everything else is assumed
    /// transient (timeouts, resets, disk hiccups).
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::AuthRejected { .. } | Self::FormatRejected { .. } => FailureKind::Permanent,
            Self::Custom { kind, .. } => *kind,
            Self::Timeout { .. }
            | Self::ConnectionReset { .. }
            | Self::WriteFailed { .. }
            | Self::File { .. } => FailureKind::Transient,
        }
    }
}

/// Errors from a single webhook delivery attempt.
///
/// An HTTP response (of any status) is not an error: the dispatcher records
/// the status code and classifies non-2xx codes itself. `DeliveryError`
/// covers the cases where no response was obtained at all.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The request could not be sent or no response arrived (DNS failure,
    /// connect refusal, timeout, TLS failure).
    #[error("network error: {reason}")]
    Network {
        /// Description of the network failure.
        reason: String,
    },

    /// The request could not be constructed (bad URL, unsignable payload).
    #[error("request rejected: {reason}")]
    Request {
        /// Why the request was rejected before sending.
        reason: String,
    },
}

impl DeliveryError {
    /// Creates a network error with the given reason.
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
        }
    }

    /// Returns the retry classification for this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Network { .. } => FailureKind::Transient,
            Self::Request { .. } => FailureKind::Permanent,
        }
    }
}

/// Classifies an HTTP status code per webhook delivery semantics.
///
/// 2xx is success (never passed here by the dispatcher); 5xx and 429 are
/// transient; every other 4xx is permanent. Statuses outside the usual
/// ranges (1xx, 3xx) are treated as permanent since retrying cannot change
/// the endpoint's behavior.
pub fn classify_status(status: u16) -> FailureKind {
    match status {
        429 | 500..=599 => FailureKind::Transient,
        _ => FailureKind::Permanent,
    }
}
