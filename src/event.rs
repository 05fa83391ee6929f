//! Runtime events for monitoring engine health.
//!
//! Events are non-fatal notifications about output and delivery behavior.
//! The engine keeps running after events are emitted - they're for
//! logging/metrics, not error handling.

use std::sync::Arc;
use std::time::Duration;

use crate::config::OutputId;
use crate::output::UnitState;
use crate::webhook::{DeliveryId, EndpointId};

/// Runtime events emitted by the output manager and webhook dispatcher.
///
/// These are informational events, not errors. Use the [`EventCallback`] to
/// log them or update metrics.
///
/// # Example
///
/// ```
/// use roomcast::EngineEvent;
///
/// fn handle_event(event: EngineEvent) {
///     match event {
///         EngineEvent::OutputStateChanged { output_id, previous, current } => {
///             eprintln!("output {output_id}: {previous} -> {current}");
///         }
///         EngineEvent::OutputReconnecting { output_id, attempt, delay } => {
///             eprintln!("output {output_id}: reconnect #{attempt} in {delay:?}");
///         }
///         EngineEvent::OutputFailed { output_id, error } => {
///             eprintln!("output {output_id} failed: {error}");
///         }
///         EngineEvent::ChunkDropped { output_id } => {
///             eprintln!("output {output_id} dropped a chunk");
///         }
///         EngineEvent::DeliverySucceeded { delivery_id, attempts, .. } => {
///             eprintln!("delivery {delivery_id} ok after {attempts} attempt(s)");
///         }
///         EngineEvent::DeliveryRetrying { delivery_id, attempt, delay, .. } => {
///             eprintln!("delivery {delivery_id}: attempt {attempt} failed, retry in {delay:?}");
///         }
///         EngineEvent::DeliveryFailed { delivery_id, error, .. } => {
///             eprintln!("delivery {delivery_id} failed: {error}");
///         }
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// An output unit moved to a new lifecycle state.
    OutputStateChanged {
        /// The output whose state changed.
        output_id: OutputId,
        /// State before the transition.
        previous: UnitState,
        /// State after the transition.
        current: UnitState,
    },

    /// An output unit lost its connection (or failed to establish one) and
    /// scheduled a reconnect attempt.
    OutputReconnecting {
        /// The reconnecting output.
        output_id: OutputId,
        /// 1-based number of the attempt that just failed.
        attempt: u32,
        /// Backoff delay before the next attempt.
        delay: Duration,
    },

    /// An output unit reached the terminal `error` state.
    ///
    /// An explicit restart command is required to leave it.
    OutputFailed {
        /// The failed output.
        output_id: OutputId,
        /// The last attempt's error message.
        error: String,
    },

    /// A chunk was dropped for one destination because its queue was full
    /// or it was mid-reconnect.
    ///
    /// Destinations prioritize freshness over completeness: chunks are
    /// never buffered across a disconnect.
    ChunkDropped {
        /// The output that dropped the chunk.
        output_id: OutputId,
    },

    /// A webhook delivery completed with a 2xx response.
    DeliverySucceeded {
        /// The completed delivery.
        delivery_id: DeliveryId,
        /// The endpoint it was delivered to.
        endpoint_id: EndpointId,
        /// Total attempts used.
        attempts: u32,
    },

    /// A webhook delivery attempt failed and a retry was scheduled.
    DeliveryRetrying {
        /// The delivery being retried.
        delivery_id: DeliveryId,
        /// The endpoint it targets.
        endpoint_id: EndpointId,
        /// 1-based number of the attempt that just failed.
        attempt: u32,
        /// Backoff delay before the next attempt.
        delay: Duration,
    },

    /// A webhook delivery reached terminal failure.
    DeliveryFailed {
        /// The failed delivery.
        delivery_id: DeliveryId,
        /// The endpoint it targeted.
        endpoint_id: EndpointId,
        /// Total attempts used.
        attempts: u32,
        /// The last attempt's error description.
        error: String,
    },
}

/// Callback type for receiving runtime events.
///
/// Register via [`OutputManager::with_event_callback`] or
/// [`WebhookDispatcher::with_event_callback`] to receive notifications about
/// state changes, drops, and delivery outcomes.
///
/// [`OutputManager::with_event_callback`]: crate::OutputManager::with_event_callback
/// [`WebhookDispatcher::with_event_callback`]: crate::WebhookDispatcher::with_event_callback
pub type EventCallback = Arc<dyn Fn(EngineEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// Convenience for creating event callbacks without manually wrapping in
/// `Arc`.
///
/// # Example
///
/// ```
/// use roomcast::{event_callback, EngineEvent};
///
/// let callback = event_callback(|event| {
///     tracing::warn!(?event, "engine event");
/// });
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(EngineEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}
