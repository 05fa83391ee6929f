//! Output destinations: transports, units, and the per-room manager.
//!
//! Each configured destination is run by an output unit - an independent
//! state machine that connects, streams, and reconnects on its own worker
//! task. The [`OutputManager`] owns the units for one room and fans each
//! audio chunk out to every unit that is currently streaming. One unit's
//! failure never blocks or fails delivery to the others.
//!
//! The actual wire protocols (Icecast source connections, SRT sockets) live
//! behind the [`OutputTransport`] trait; the crate ships the disk
//! [`RecordingTransport`] and a scriptable [`mock::MockTransport`], and a
//! [`TransportFactory`] supplies transports for the network destination
//! types.

pub mod mock;

mod manager;
mod recording;
mod stats;
mod unit;

pub use manager::{OutputManager, OutputStatus, RoomStatus};
pub use recording::RecordingTransport;
pub use stats::OutputStats;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chunk::AudioChunk;
use crate::config::OutputDestination;
use crate::error::{EngineError, TransportError};

/// Lifecycle state of an output unit.
///
/// ```text
/// idle -> connecting -> streaming <-> reconnecting -> idle | error
/// ```
///
/// `Error` is terminal until an explicit restart command returns the unit
/// to `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    /// Not connected; ready to start.
    Idle,
    /// Establishing the destination connection.
    Connecting,
    /// Connected and accepting chunks.
    Streaming,
    /// Connection lost; retrying with backoff.
    Reconnecting,
    /// Terminal failure; requires an explicit restart.
    Error,
}

impl UnitState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Connecting => 1,
            Self::Streaming => 2,
            Self::Reconnecting => 3,
            Self::Error => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Streaming,
            3 => Self::Reconnecting,
            4 => Self::Error,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// A connection to one output destination.
///
/// The transport is the delivery attempt executor for the output side: each
/// method performs exactly one connect, write, or close and reports the
/// outcome. The owning unit drives the lifecycle, classifies failures via
/// [`TransportError::kind`], and handles all retrying - implementations
/// should fail fast rather than retry internally.
///
/// The unit's worker task owns the transport exclusively, so methods take
/// `&mut self`. `connect` and `close` may be called repeatedly across
/// reconnect cycles.
///
/// # Example
///
/// ```
/// use roomcast::{AudioChunk, OutputTransport, TransportError};
/// use async_trait::async_trait;
///
/// struct NullTransport;
///
/// #[async_trait]
/// impl OutputTransport for NullTransport {
///     async fn connect(&mut self) -> Result<(), TransportError> {
///         Ok(())
///     }
///
///     async fn write(&mut self, chunk: &AudioChunk) -> Result<(), TransportError> {
///         let _ = chunk;
///         Ok(())
///     }
///
///     async fn close(&mut self) -> Result<(), TransportError> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait OutputTransport: Send + Sync {
    /// Establishes the destination connection.
    ///
    /// Called on start and before every reconnect attempt. A previous
    /// connection, if any, has already been closed.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Writes one chunk of audio to the connected destination.
    ///
    /// Only called between a successful `connect` and the next `close`.
    async fn write(&mut self, chunk: &AudioChunk) -> Result<(), TransportError>;

    /// Closes the connection and releases resources.
    ///
    /// Called on stop and after a mid-stream write failure before
    /// reconnecting. Must be safe to call when the connection is already
    /// gone.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Produces transports for configured destinations.
///
/// The wire protocol implementations are collaborators supplied by the
/// embedding application; the factory is the seam they plug into. A factory
/// returns [`EngineError::InvalidConfig`] for destination types it does not
/// support.
pub trait TransportFactory: Send + Sync {
    /// Creates a transport for the given destination.
    fn create(
        &self,
        destination: &OutputDestination,
    ) -> Result<Box<dyn OutputTransport>, EngineError>;
}
