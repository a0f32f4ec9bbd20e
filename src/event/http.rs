//! HTTP webhook transport and receiver.
//!
//! Sending POSTs a structured-mode CloudEvent (`application/cloudevents+json`)
//! to the event's endpoint. The receiver accepts structured, batched and
//! binary-mode requests and hands each event to the registered handler.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use http::{header, HeaderMap, StatusCode};
use reqwest::Client;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::envelope::decode_binary;
use super::receiver::dispatch;
use super::{
    CloudEventEnvelope, Envelope, EventError, EventHandler, HandlerError, ReceiverState,
    ReceiverStatus, Result, Transport, TransportKind, CLOUDEVENTS_BATCH_JSON, CLOUDEVENTS_JSON,
};

/// Event POSTed to a webhook endpoint.
pub struct HttpEvent {
    envelope: Envelope,
    client: Client,
    endpoint: reqwest::Url,
    headers: Vec<(String, String)>,
}

impl HttpEvent {
    /// Bind an event to `endpoint`, which must be an absolute http(s) URL.
    pub fn new(client: Client, endpoint: &str) -> Result<Self> {
        let url = reqwest::Url::parse(endpoint).map_err(|e| EventError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(EventError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                message: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        Ok(Self {
            envelope: Envelope::default(),
            client,
            endpoint: url,
            headers: Vec::new(),
        })
    }

    /// Add a header sent with every request.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    /// Determine if an HTTP status code is retryable.
    fn is_retryable_status(status: reqwest::StatusCode) -> bool {
        // Retry 429 (rate limit) and 5xx (server errors)
        status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }
}

#[async_trait]
impl Transport for HttpEvent {
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
        TransportKind::Http
    }

    async fn send(&self, data: Value) -> Result<()> {
        let event = self.envelope.to_cloud_event(data)?;
        let json = serde_json::to_vec(&event)?;

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header("Content-Type", CLOUDEVENTS_JSON)
            .body(json);

        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            debug!(
                endpoint = %self.endpoint,
                id = %self.envelope.id,
                "CloudEvent posted successfully"
            );
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let detail = format!(
            "HTTP {} - {}",
            status,
            body.chars().take(200).collect::<String>()
        );

        if Self::is_retryable_status(status) {
            warn!(endpoint = %self.endpoint, status = %status, "CloudEvent POST returned retryable status");
            Err(EventError::Unavailable(detail))
        } else {
            error!(endpoint = %self.endpoint, status = %status, "CloudEvent POST failed");
            Err(EventError::Rejected(detail))
        }
    }
}

/// Build the protocol handler (an axum router) for inbound events.
///
/// Every POST to any path is decoded and dispatched to `handler`. Mount it
/// into an existing application or serve it with `HttpReceiver`.
pub fn router(handler: Arc<dyn EventHandler>) -> Router {
    Router::new()
        .route("/", post(receive))
        .route("/*path", post(receive))
        .with_state(handler)
}

async fn receive(
    State(handler): State<Arc<dyn EventHandler>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let events = match decode_request(&headers, &body) {
        Ok(events) => events,
        Err(e) => {
            warn!(error = %e, "Rejecting undecodable request");
            return StatusCode::BAD_REQUEST;
        }
    };

    for event in events {
        match dispatch(handler.as_ref(), event).await {
            Ok(()) => {}
            Err(HandlerError::Rejected(_)) => return StatusCode::BAD_REQUEST,
            Err(HandlerError::Failed(_)) => return StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    StatusCode::OK
}

/// Decode one request into events according to its content mode.
fn decode_request(headers: &HeaderMap, body: &[u8]) -> Result<Vec<CloudEventEnvelope>> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if content_type.starts_with(CLOUDEVENTS_BATCH_JSON) {
        return Ok(serde_json::from_slice(body)?);
    }
    if content_type.starts_with(CLOUDEVENTS_JSON) {
        return Ok(vec![serde_json::from_slice(body)?]);
    }

    let attributes = headers
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_bytes()));
    let content_type = (!content_type.is_empty()).then_some(content_type);
    Ok(vec![decode_binary("ce-", attributes, content_type, body)?])
}

/// HTTP server running the receiver router.
pub struct HttpReceiver {
    listener: TcpListener,
    handler: Arc<dyn EventHandler>,
    status: ReceiverStatus,
}

impl HttpReceiver {
    /// Bind the listening socket. Bind failures are returned here, not later.
    pub async fn bind(addr: &str, handler: Arc<dyn EventHandler>) -> Result<Self> {
        let status = ReceiverStatus::new();
        status.advance(ReceiverState::Connecting);

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                status.advance(ReceiverState::Faulted);
                return Err(EventError::Io(e));
            }
        };

        Ok(Self {
            listener,
            handler,
            status,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn status(&self) -> ReceiverStatus {
        self.status.clone()
    }

    /// Serve until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        let app = router(self.handler);
        let status = self.status;

        status.advance(ReceiverState::Receiving);
        info!(addr = %addr, "HTTP receiver listening");

        let shutdown = async move { cancel.cancelled().await };
        match axum::serve(self.listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            Ok(()) => {
                status.advance(ReceiverState::Stopped);
                info!(addr = %addr, "HTTP receiver stopped");
                Ok(())
            }
            Err(e) => {
                status.advance(ReceiverState::Faulted);
                error!(addr = %addr, error = %e, "HTTP receiver failed");
                Err(EventError::Io(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudevents::event::AttributesReader;
    use http::HeaderValue;

    #[test]
    fn test_invalid_endpoint() {
        let result = HttpEvent::new(Client::new(), "not a url");
        assert!(matches!(result, Err(EventError::InvalidEndpoint { .. })));
    }

    #[test]
    fn test_unsupported_scheme() {
        let result = HttpEvent::new(Client::new(), "ftp://example.com/events");
        assert!(matches!(result, Err(EventError::InvalidEndpoint { .. })));
    }

    #[test]
    fn test_retryable_status_codes() {
        use reqwest::StatusCode;

        assert!(HttpEvent::is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(HttpEvent::is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(HttpEvent::is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));

        assert!(!HttpEvent::is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!HttpEvent::is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!HttpEvent::is_retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_decode_structured() {
        let event = Envelope {
            id: "s-1".to_string(),
            event_type: "t".to_string(),
            source: "urn:s".to_string(),
        }
        .to_cloud_event(serde_json::json!({"k": "v"}))
        .unwrap();
        let body = serde_json::to_vec(&event).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(CLOUDEVENTS_JSON));

        let decoded = decode_request(&headers, &body).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].id(), "s-1");
    }

    #[test]
    fn test_decode_batch() {
        let events: Vec<_> = ["b-1", "b-2"]
            .iter()
            .map(|id| {
                Envelope {
                    id: id.to_string(),
                    event_type: "t".to_string(),
                    source: "urn:s".to_string(),
                }
                .to_cloud_event(Value::Null)
                .unwrap()
            })
            .collect();
        let body = serde_json::to_vec(&events).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(CLOUDEVENTS_BATCH_JSON),
        );

        let decoded = decode_request(&headers, &body).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].id(), "b-2");
    }

    #[test]
    fn test_decode_binary_mode() {
        let mut headers = HeaderMap::new();
        headers.insert("ce-id", HeaderValue::from_static("bin-1"));
        headers.insert("ce-type", HeaderValue::from_static("order.created"));
        headers.insert("ce-source", HeaderValue::from_static("urn:orders"));
        headers.insert("ce-specversion", HeaderValue::from_static("1.0"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let decoded = decode_request(&headers, br#"{"x":1}"#).unwrap();
        assert_eq!(decoded[0].id(), "bin-1");
        assert_eq!(decoded[0].ty(), "order.created");
    }

    #[test]
    fn test_decode_garbage_fails() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(CLOUDEVENTS_JSON));
        assert!(decode_request(&headers, b"{not json").is_err());
    }
}
