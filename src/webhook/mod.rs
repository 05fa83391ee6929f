//! Webhook event delivery: endpoints, deliveries, and the dispatcher.
//!
//! Domain events published by the platform (room lifecycle, participants,
//! recordings) are delivered to subscribed HTTP endpoints as signed JSON
//! POSTs. Each endpoint has its own FIFO delivery queue and worker, so a
//! stuck endpoint never delays the others. Failed attempts retry with
//! exponential backoff up to the configured attempt cap.

mod dispatcher;
mod history;
mod sender;

pub use dispatcher::WebhookDispatcher;
pub use history::{DeliveryLog, DeliveryPage};
pub use sender::{
    sign_payload, verify_signature, DeliveryResponse, DeliverySender, HttpSender, SIGNATURE_HEADER,
};

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier of a registered webhook endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(Uuid);

impl EndpointId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one logical webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(Uuid);

impl DeliveryId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Domain event types endpoints can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A call room was created.
    #[serde(rename = "room.created")]
    RoomCreated,
    /// A call room was closed.
    #[serde(rename = "room.closed")]
    RoomClosed,
    /// A participant joined a room.
    #[serde(rename = "participant.joined")]
    ParticipantJoined,
    /// A participant left a room.
    #[serde(rename = "participant.left")]
    ParticipantLeft,
    /// A recording started.
    #[serde(rename = "recording.started")]
    RecordingStarted,
    /// A recording finished and its files are complete.
    #[serde(rename = "recording.completed")]
    RecordingCompleted,
    /// An output destination reached the terminal error state.
    #[serde(rename = "output.failed")]
    OutputFailed,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RoomCreated => "room.created",
            Self::RoomClosed => "room.closed",
            Self::ParticipantJoined => "participant.joined",
            Self::ParticipantLeft => "participant.left",
            Self::RecordingStarted => "recording.started",
            Self::RecordingCompleted => "recording.completed",
            Self::OutputFailed => "output.failed",
        };
        f.write_str(s)
    }
}

/// A domain event as consumed from the platform event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    /// What happened.
    pub event_type: EventType,
    /// The organization the event belongs to.
    pub organization_id: Uuid,
    /// The room involved, if any.
    pub room_id: Option<Uuid>,
    /// Event-specific payload data.
    pub data: Value,
}

/// The JSON body POSTed to webhook endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    /// The event type.
    pub event: EventType,
    /// When the event was dispatched.
    pub timestamp: DateTime<Utc>,
    /// The organization the event belongs to.
    pub organization_id: Uuid,
    /// The room involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<Uuid>,
    /// Event-specific payload data.
    pub data: Value,
}

/// A registered webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    /// Unique identifier.
    pub id: EndpointId,
    /// The organization this endpoint belongs to.
    pub organization_id: Uuid,
    /// The HTTPS URL events are delivered to.
    pub url: String,
    /// Shared secret used to sign payloads (HMAC-SHA256 over the raw body).
    pub secret: String,
    /// Event types this endpoint receives.
    pub events: BTreeSet<EventType>,
    /// Whether deliveries are currently made to this endpoint.
    pub enabled: bool,
    /// When the most recent delivery reached a terminal state.
    pub last_delivery_at: Option<DateTime<Utc>>,
    /// Outcome of the most recent delivery.
    pub last_delivery_status: Option<DeliveryStatus>,
    /// When the endpoint was registered.
    pub created_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    /// Creates an enabled endpoint with a fresh id.
    pub fn new(
        organization_id: Uuid,
        url: impl Into<String>,
        secret: impl Into<String>,
        events: impl IntoIterator<Item = EventType>,
    ) -> Self {
        Self {
            id: EndpointId::new(),
            organization_id,
            url: url.into(),
            secret: secret.into(),
            events: events.into_iter().collect(),
            enabled: true,
            last_delivery_at: None,
            last_delivery_status: None,
            created_at: Utc::now(),
        }
    }

    /// Whether this endpoint receives the given event type.
    pub fn subscribes_to(&self, event_type: EventType) -> bool {
        self.events.contains(&event_type)
    }
}

/// Fields that can be changed on an existing endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateEndpoint {
    /// New delivery URL.
    pub url: Option<String>,
    /// New signing secret.
    pub secret: Option<String>,
    /// New event subscription set.
    pub events: Option<BTreeSet<EventType>>,
    /// New enabled flag.
    pub enabled: Option<bool>,
}

/// Lifecycle status of a webhook delivery.
///
/// Status moves monotonically through
/// `pending -> retrying* -> success | failed`; terminal states are never
/// left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Created, no attempt made yet.
    Pending,
    /// At least one attempt failed; another is scheduled.
    Retrying,
    /// A 2xx response was received.
    Success,
    /// Terminal failure: permanent error or retry cap reached.
    Failed,
}

impl DeliveryStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// One attempt within a delivery, kept for operator inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// When the attempt was made.
    pub attempted_at: DateTime<Utc>,
    /// HTTP status received, if a response arrived.
    pub http_status: Option<u16>,
    /// Error description when no 2xx response was obtained.
    pub error: Option<String>,
    /// Backoff delay scheduled after this attempt, if it failed
    /// recoverably.
    pub retry_delay: Option<std::time::Duration>,
}

/// One logical delivery of a domain event to one endpoint.
///
/// The payload snapshot is immutable once created; the record is mutated in
/// place across retries until it reaches a terminal status. Records are
/// never deleted by this engine (retention is an external policy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    /// Unique identifier.
    pub id: DeliveryId,
    /// The endpoint this delivery targets.
    pub webhook_id: EndpointId,
    /// The event being delivered.
    pub event: EventType,
    /// The exact JSON body sent on every attempt.
    pub payload: String,
    /// Current lifecycle status.
    pub status: DeliveryStatus,
    /// HTTP status of the most recent attempt, if a response arrived.
    pub http_status: Option<u16>,
    /// Truncated response body of the most recent attempt.
    pub response_body: Option<String>,
    /// Error description of the most recent failed attempt.
    pub error: Option<String>,
    /// Number of attempts made so far.
    pub attempts: u32,
    /// Per-attempt history.
    pub attempt_log: Vec<DeliveryAttempt>,
    /// When the delivery record was created.
    pub created_at: DateTime<Utc>,
    /// When a 2xx response was received.
    pub delivered_at: Option<DateTime<Utc>>,
}

impl WebhookDelivery {
    /// Creates a pending delivery with the given payload snapshot.
    pub fn new(webhook_id: EndpointId, event: EventType, payload: String) -> Self {
        Self {
            id: DeliveryId::new(),
            webhook_id,
            event,
            payload,
            status: DeliveryStatus::Pending,
            http_status: None,
            response_body: None,
            error: None,
            attempts: 0,
            attempt_log: Vec::new(),
            created_at: Utc::now(),
            delivered_at: None,
        }
    }
}
