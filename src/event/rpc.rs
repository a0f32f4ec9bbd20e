//! gRPC transport.
//!
//! Events are delivered with the unary `EventSink.Deliver` call. The client
//! channel is connected on first send and reused afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cloudevents::event::AttributesReader;
use serde_json::Value;
use tokio::sync::OnceCell;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use super::envelope::{data_bytes, decode_binary};
use super::receiver::dispatch;
use super::{
    CloudEventEnvelope, Envelope, EventError, EventHandler, HandlerError, Result, Transport,
    TransportKind,
};
use crate::config::RpcConfig;
use crate::proto::event_sink_client::EventSinkClient;
use crate::proto::event_sink_server::{EventSink, EventSinkServer};
use crate::proto::{CloudEventMessage, DeliveryAck};

/// Event delivered to a remote `EventSink` service.
pub struct RpcEvent {
    envelope: Envelope,
    endpoint: Endpoint,
    client: OnceCell<EventSinkClient<Channel>>,
}

impl RpcEvent {
    /// Bind an event to `endpoint` (`host:port` or a full `http://` URI).
    ///
    /// Only the address is validated here; the connection is opened on the
    /// first send.
    pub fn new(endpoint: &str, config: &RpcConfig) -> Result<Self> {
        let uri = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("http://{}", endpoint)
        };

        let parsed = Endpoint::from_shared(uri).map_err(|e| EventError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;

        if parsed.uri().host().is_none() {
            return Err(EventError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                message: "missing host".to_string(),
            });
        }

        Ok(Self {
            envelope: Envelope::default(),
            endpoint: parsed
                .connect_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
                .timeout(std::time::Duration::from_secs(config.timeout_secs)),
            client: OnceCell::new(),
        })
    }

    pub fn endpoint(&self) -> String {
        self.endpoint.uri().to_string()
    }

    async fn client(&self) -> Result<EventSinkClient<Channel>> {
        let client = self
            .client
            .get_or_try_init(|| async {
                let channel = self.endpoint.connect().await.map_err(|e| {
                    EventError::Unavailable(format!(
                        "Connection to {} failed: {}",
                        self.endpoint.uri(),
                        e
                    ))
                })?;
                info!(endpoint = %self.endpoint.uri(), "Connected to event sink");
                Ok::<_, EventError>(EventSinkClient::new(channel))
            })
            .await?;
        Ok(client.clone())
    }
}

#[async_trait]
impl Transport for RpcEvent {
    fn set_id(&mut self, id: String) {
        self.envelope.id = id;
    }

    fn set_type(&mut self, event_type: String) {
        self.envelope.event_type = event_type;
    }

    fn set_source(&mut self, source: String) {
        self.envelope.source = source;
    }

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Rpc
    }

    async fn send(&self, data: Value) -> Result<()> {
        let event = self.envelope.to_cloud_event(data)?;
        let message = to_message(&event)?;

        let mut client = self.client().await?;
        client.deliver(Request::new(message)).await?;

        debug!(
            endpoint = %self.endpoint.uri(),
            id = %self.envelope.id,
            "Delivered event over gRPC"
        );
        Ok(())
    }
}

/// Convert a CloudEvent into its wire message.
///
/// Optional attributes (`subject`, `time`, `dataschema`) and extensions are
/// carried stringified in `attributes`.
pub fn to_message(event: &CloudEventEnvelope) -> Result<CloudEventMessage> {
    let (data_content_type, data) = data_bytes(event)?;

    let mut attributes = HashMap::new();
    if let Some(subject) = event.subject() {
        attributes.insert("subject".to_string(), subject.to_string());
    }
    if let Some(time) = event.time() {
        attributes.insert("time".to_string(), time.to_rfc3339());
    }
    for (name, value) in event.iter_extensions() {
        attributes.insert(name.to_string(), value.to_string());
    }

    Ok(CloudEventMessage {
        id: event.id().to_string(),
        source: event.source().to_string(),
        spec_version: event.specversion().to_string(),
        event_type: event.ty().to_string(),
        data_content_type,
        data,
        attributes,
    })
}

/// Rebuild a CloudEvent from its wire message.
pub fn from_message(message: CloudEventMessage) -> Result<CloudEventEnvelope> {
    let mut attributes = vec![
        ("id".to_string(), message.id),
        ("type".to_string(), message.event_type),
        ("source".to_string(), message.source),
    ];
    if !message.spec_version.is_empty() {
        attributes.push(("specversion".to_string(), message.spec_version));
    }
    attributes.extend(message.attributes);

    let content_type =
        (!message.data_content_type.is_empty()).then_some(message.data_content_type.as_str());

    decode_binary(
        "",
        attributes.iter().map(|(k, v)| (k.as_str(), v.as_bytes())),
        content_type,
        &message.data,
    )
}

/// `EventSink` server dispatching delivered events to a handler.
pub struct SinkService {
    handler: Arc<dyn EventHandler>,
}

impl SinkService {
    pub fn new(handler: Arc<dyn EventHandler>) -> Self {
        Self { handler }
    }

    /// Wrap into the generated tonic server.
    pub fn into_server(self) -> EventSinkServer<Self> {
        EventSinkServer::new(self)
    }
}

#[tonic::async_trait]
impl EventSink for SinkService {
    async fn deliver(
        &self,
        request: Request<CloudEventMessage>,
    ) -> std::result::Result<Response<DeliveryAck>, Status> {
        let event = from_message(request.into_inner())
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        match dispatch(self.handler.as_ref(), event).await {
            Ok(()) => Ok(Response::new(DeliveryAck {})),
            Err(HandlerError::Rejected(msg)) => Err(Status::invalid_argument(msg)),
            Err(HandlerError::Failed(msg)) => Err(Status::internal(msg)),
        }
    }
}
