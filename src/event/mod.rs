//! Transport-agnostic CloudEvents.
//!
//! This module contains:
//! - `Transport` trait: one delivery mechanism (HTTP, Kafka, channel, RPC)
//! - `Event`: the unit application code builds once and sends
//! - `EventHandler` trait: inbound callback used by every receiver
//! - `EventRuntime`: composition root holding shared clients and factories
//! - The error surface for failures that cannot be returned to a caller

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

pub mod channel;
mod envelope;
mod errors;
pub mod http;
#[cfg(feature = "kafka")]
pub mod kafka;
mod receiver;
pub mod rpc;
mod runtime;

pub use envelope::{CloudEventBuilderExt, CloudEventEnvelope, Envelope};
pub use errors::{ErrorDrain, ErrorSurface, EventErr};
pub use receiver::{ReceiverHandle, ReceiverState, ReceiverStatus};
pub use runtime::EventRuntime;

/// Content type for structured-mode CloudEvents.
pub const CLOUDEVENTS_JSON: &str = "application/cloudevents+json";
/// Content type for batched structured-mode CloudEvents.
pub const CLOUDEVENTS_BATCH_JSON: &str = "application/cloudevents-batch+json";

/// Result type for event operations.
pub type Result<T> = std::result::Result<T, EventError>;

/// Errors that can occur while building, sending or receiving events.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Invalid endpoint '{endpoint}': {message}")]
    InvalidEndpoint { endpoint: String, message: String },

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Transient delivery failure; the same send may succeed later.
    #[error("Delivery unavailable: {0}")]
    Unavailable(String),

    /// Permanent delivery failure; the receiver refused the event.
    #[error("Delivery rejected: {0}")]
    Rejected(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("RPC error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} support requires the '{1}' feature")]
    Unsupported(&'static str, &'static str),

    #[error("Event construction failed: {0}")]
    Construction(Arc<EventError>),
}

impl EventError {
    /// Whether retrying the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Http(err) => err.is_timeout() || err.is_connect(),
            Self::Rpc(status) => matches!(
                status.code(),
                tonic::Code::Unavailable
                    | tonic::Code::DeadlineExceeded
                    | tonic::Code::ResourceExhausted
            ),
            Self::Construction(inner) => inner.is_transient(),
            _ => false,
        }
    }
}

/// Which delivery mechanism backs an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    Kafka,
    Channel,
    Rpc,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Http => "http",
            Self::Kafka => "kafka",
            Self::Channel => "channel",
            Self::Rpc => "rpc",
        };
        f.write_str(name)
    }
}

/// One delivery mechanism.
///
/// Implementations own whatever they need to deliver (a client, a topic, a
/// channel sender) and stamp the envelope onto every outgoing CloudEvent.
#[async_trait]
pub trait Transport: Send + Sync {
    fn set_id(&mut self, id: String);

    fn set_type(&mut self, event_type: String);

    fn set_source(&mut self, source: String);

    fn envelope(&self) -> &Envelope;

    fn kind(&self) -> TransportKind;

    /// Deliver `data` as the event payload.
    ///
    /// No retry or acknowledgement is layered on top of the transport.
    async fn send(&self, data: Value) -> Result<()>;
}

/// An outgoing event bound to exactly one transport.
pub struct Event {
    transport: Box<dyn Transport>,
}

impl Event {
    /// Wrap a transport whose envelope is already assigned.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn id(&self) -> &str {
        &self.transport.envelope().id
    }

    pub fn event_type(&self) -> &str {
        &self.transport.envelope().event_type
    }

    pub fn source(&self) -> &str {
        &self.transport.envelope().source
    }

    pub fn envelope(&self) -> &Envelope {
        self.transport.envelope()
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Override the default source.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.transport.set_source(source.into());
        self
    }

    /// Serialize `payload` to JSON and deliver it.
    #[tracing::instrument(name = "event.send", skip_all, fields(id = %self.id(), kind = %self.kind()))]
    pub async fn send<T: Serialize + ?Sized>(&self, payload: &T) -> Result<()> {
        let data = serde_json::to_value(payload)?;
        self.transport.send(data).await
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind())
            .field("envelope", self.envelope())
            .finish()
    }
}

/// Errors returned by inbound handlers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// The event is malformed or unwanted; redelivery will not help.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Processing failed.
    #[error("Failed: {0}")]
    Failed(String),
}

/// Result of handling one inbound event.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Handler invoked by receivers for each decoded event.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: CloudEventEnvelope) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> EventHandler for F
where
    F: Fn(CloudEventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, event: CloudEventEnvelope) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(event))
    }
}
