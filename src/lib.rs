//! # roomcast
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Output dispatch and delivery engine for live audio call rooms.
//!
//! `roomcast` pushes a room's mixed audio to multiple independent
//! destinations (Icecast relays, SRT endpoints, local recordings) while
//! notifying external systems of domain events via signed webhooks with
//! retry and backoff.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use roomcast::{
//!     AudioChunk, EngineConfig, IcecastConfig, OutputDestination, OutputKind, OutputManager,
//! };
//! use std::sync::Arc;
//!
//! let manager = OutputManager::new("room-42", EngineConfig::default(), transport_factory);
//!
//! let id = manager.add_output(OutputDestination::new(
//!     "main relay",
//!     OutputKind::Icecast(IcecastConfig {
//!         host: "ice.example.com".into(),
//!         port: 8000,
//!         mount: "/live".into(),
//!         username: "source".into(),
//!         password: "hackme".into(),
//!     }),
//! ))?;
//! manager.start_output(id).await?;
//!
//! // On every media tick from the mixing engine:
//! manager.fan_out(&chunk);
//! ```
//!
//! ## Architecture
//!
//! The engine keeps every destination independent:
//!
//! - **Output Unit**: One worker task per destination owns its connection
//!   lifecycle (`idle → connecting → streaming ⇄ reconnecting → idle|error`)
//!   and statistics
//! - **Output Manager**: Fans each chunk out to all streaming units through
//!   bounded per-unit queues - a slow destination drops chunks, it never
//!   stalls the producer or its siblings
//! - **Webhook Dispatcher**: One FIFO queue and worker per endpoint
//!   delivers signed event payloads with exponential backoff, recording
//!   every attempt
//!
//! Reconnects and delivery retries share one jittered backoff policy, and
//! stopping a unit or removing an endpoint deterministically cancels its
//! pending retries.

#![warn(missing_docs)]
// unwrap/expect allowed in tests only
#![allow(clippy::unwrap_used)]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod chunk;
mod config;
mod error;
mod event;
pub mod output;
mod retry;
mod template;
pub mod webhook;

pub use chunk::AudioChunk;
pub use config::{
    EngineConfig, IcecastConfig, OutputDestination, OutputId, OutputKind, RecordingConfig,
    RecordingFormat, SrtConfig,
};
pub use error::{classify_status, DeliveryError, EngineError, FailureKind, TransportError};
pub use event::{event_callback, EngineEvent, EventCallback};
pub use output::{
    OutputManager, OutputStats, OutputStatus, OutputTransport, RecordingTransport, RoomStatus,
    TransportFactory, UnitState,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use template::{ChannelTemplate, MasterTemplate, SessionTemplate};
pub use webhook::{
    DeliveryAttempt, DeliveryId, DeliveryPage, DeliveryStatus, DomainEvent, EndpointId, EventType,
    UpdateEndpoint, WebhookDelivery, WebhookDispatcher, WebhookEndpoint, WebhookPayload,
};
