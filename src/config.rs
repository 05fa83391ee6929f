//! Configuration types for output destinations and the engine.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::retry::RetryPolicy;

/// Identifier of a configured output destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputId(Uuid);

impl OutputId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OutputId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OutputId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A configured external target for the room's mixed audio.
///
/// The destination type and its type-specific configuration are a single
/// closed sum ([`OutputKind`]), so exactly one configuration variant exists
/// per destination by construction. Runtime status lives on the owning
/// output unit, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDestination {
    /// Unique identifier.
    pub id: OutputId,
    /// Display name, also used in logs and recording file names.
    pub name: String,
    /// Whether the destination may be started. Disabling does not interrupt
    /// an active stream; it refuses future starts and stops reconnecting.
    pub enabled: bool,
    /// Destination type and its configuration.
    #[serde(flatten)]
    pub kind: OutputKind,
}

impl OutputDestination {
    /// Creates an enabled destination with a fresh id.
    pub fn new(name: impl Into<String>, kind: OutputKind) -> Self {
        Self {
            id: OutputId::new(),
            name: name.into(),
            enabled: true,
            kind,
        }
    }

    /// Validates the destination configuration.
    ///
    /// Runs before any connection attempt; a destination that fails here is
    /// rejected with [`EngineError::InvalidConfig`] and never retried.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::invalid_config("output name must not be empty"));
        }
        match &self.kind {
            OutputKind::Icecast(cfg) => cfg.validate(),
            OutputKind::Srt(cfg) => cfg.validate(),
            OutputKind::Recording(cfg) => cfg.validate(),
        }
    }
}

/// Destination type with its type-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutputKind {
    /// An Icecast mountpoint.
    Icecast(IcecastConfig),
    /// An SRT endpoint.
    Srt(SrtConfig),
    /// A local recording on disk.
    Recording(RecordingConfig),
}

impl OutputKind {
    /// Returns the destination type label (`icecast`, `srt`, `recording`).
    pub fn label(&self) -> &'static str {
        match self {
            Self::Icecast(_) => "icecast",
            Self::Srt(_) => "srt",
            Self::Recording(_) => "recording",
        }
    }
}

/// Connection parameters for an Icecast mountpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IcecastConfig {
    /// Icecast server hostname.
    pub host: String,
    /// Icecast server port.
    pub port: u16,
    /// Mountpoint path, e.g. `/live`.
    pub mount: String,
    /// Source username (usually `source`).
    pub username: String,
    /// Source password.
    pub password: String,
}

impl IcecastConfig {
    fn validate(&self) -> Result<(), EngineError> {
        if self.host.trim().is_empty() {
            return Err(EngineError::invalid_config("icecast host must not be empty"));
        }
        if self.port == 0 {
            return Err(EngineError::invalid_config("icecast port must not be 0"));
        }
        if self.mount.trim().is_empty() {
            return Err(EngineError::invalid_config(
                "icecast mount must not be empty",
            ));
        }
        Ok(())
    }
}

/// Connection parameters for an SRT endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrtConfig {
    /// SRT listener hostname.
    pub host: String,
    /// SRT listener port.
    pub port: u16,
    /// Optional encryption passphrase.
    pub passphrase: Option<String>,
    /// Receiver latency window in milliseconds.
    pub latency_ms: u32,
}

impl SrtConfig {
    fn validate(&self) -> Result<(), EngineError> {
        if self.host.trim().is_empty() {
            return Err(EngineError::invalid_config("srt host must not be empty"));
        }
        if self.port == 0 {
            return Err(EngineError::invalid_config("srt port must not be 0"));
        }
        Ok(())
    }
}

/// On-disk format of a recording destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingFormat {
    /// WAV container (44-byte header, finalized on stop).
    Wav,
    /// Headerless interleaved 16-bit little-endian PCM.
    Raw,
}

/// Parameters for a local recording destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Directory the recording files are written to.
    pub directory: PathBuf,
    /// On-disk format.
    pub format: RecordingFormat,
    /// Optional rotation interval. When set, a new sequence file is opened
    /// once the current file covers this much audio.
    pub max_file_duration: Option<Duration>,
}

impl RecordingConfig {
    fn validate(&self) -> Result<(), EngineError> {
        if self.directory.as_os_str().is_empty() {
            return Err(EngineError::invalid_config(
                "recording directory must not be empty",
            ));
        }
        if self.max_file_duration == Some(Duration::ZERO) {
            return Err(EngineError::invalid_config(
                "recording rotation interval must not be zero",
            ));
        }
        Ok(())
    }
}

/// Engine-wide tuning knobs.
///
/// Use [`EngineConfig::default()`] for production defaults, or customize as
/// needed.
///
/// # Example
///
/// ```
/// use roomcast::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig {
///     webhook_timeout: Duration::from_secs(5),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of each output unit's chunk queue.
    ///
    /// The queue is the drop-if-slow bound: a unit that falls this many
    /// chunks behind starts dropping instead of stalling the producer.
    /// Default: 32 (about 3 seconds at 100ms chunks).
    pub chunk_queue_capacity: usize,

    /// Reconnection policy for output units.
    ///
    /// Default: 1s base, 30s cap, unlimited attempts, jittered.
    pub output_retry: RetryPolicy,

    /// Retry policy for webhook deliveries.
    ///
    /// Default: 1s base, 30s cap, 8 attempts, jittered.
    pub webhook_retry: RetryPolicy,

    /// Request timeout for one webhook delivery attempt.
    ///
    /// Default: 10s.
    pub webhook_timeout: Duration,

    /// Capacity of each webhook endpoint's delivery queue.
    ///
    /// A delivery that cannot be queued because the endpoint is this far
    /// behind fails immediately instead of blocking other endpoints.
    /// Default: 256.
    pub delivery_queue_capacity: usize,

    /// Maximum number of response-body bytes kept on a delivery record.
    ///
    /// Default: 4 KiB.
    pub response_body_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_queue_capacity: 32,
            output_retry: RetryPolicy::default(),
            webhook_retry: RetryPolicy::webhook(),
            webhook_timeout: Duration::from_secs(10),
            delivery_queue_capacity: 256,
            response_body_limit: 4096,
        }
    }
}
