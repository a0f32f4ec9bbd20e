//! Kafka transport and consumer-group receiver.
//!
//! Events are published in structured mode: the CloudEvent JSON is the
//! record value, the event id is the record key (so every send of one event
//! lands on the same partition). The receiver also accepts binary-mode
//! records carrying `ce_` headers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::envelope::decode_binary;
use super::receiver::dispatch;
use super::{
    CloudEventEnvelope, Envelope, EventError, EventHandler, ReceiverState, ReceiverStatus,
    Result, Transport, TransportKind, CLOUDEVENTS_JSON,
};
use crate::config::KafkaConfig;

const CONTENT_TYPE_HEADER: &str = "content-type";

/// Build a ClientConfig for producers.
fn build_producer_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.bootstrap_servers);
    client.set(
        "message.timeout.ms",
        (config.timeout_secs * 1000).to_string(),
    );
    client.set("acks", "all");
    client.set("enable.idempotence", "true");

    apply_security_config(config, &mut client);
    client
}

/// Build a ClientConfig for a consumer group.
fn build_consumer_config(config: &KafkaConfig, group: &str) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.bootstrap_servers);
    client.set("group.id", group);
    client.set("enable.auto.commit", "false");
    client.set("auto.offset.reset", "earliest");

    apply_security_config(config, &mut client);
    client
}

/// Apply security settings to a ClientConfig.
fn apply_security_config(config: &KafkaConfig, client: &mut ClientConfig) {
    if let Some(ref protocol) = config.security_protocol {
        client.set("security.protocol", protocol);
    }

    if let Some(ref mechanism) = config.sasl_mechanism {
        client.set("sasl.mechanism", mechanism);
    }

    if let Some(ref username) = config.sasl_username {
        client.set("sasl.username", username);
    }

    if let Some(ref password) = config.sasl_password {
        client.set("sasl.password", password);
    }

    if let Some(ref ca_location) = config.ssl_ca_location {
        client.set("ssl.ca.location", ca_location);
    }
}

/// Map a producer error, separating transient broker conditions.
fn classify_produce_error(err: KafkaError) -> EventError {
    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::QueueFull
            | RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::LeaderNotAvailable
            | RDKafkaErrorCode::NotLeaderForPartition,
        ) => EventError::Unavailable(format!("Kafka: {}", err)),
        _ => EventError::Broker(format!("Failed to publish: {}", err)),
    }
}

/// Whether a consumer stream error should end the receive loop.
fn is_fatal_consume_error(err: &KafkaError) -> bool {
    matches!(
        err.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::Fatal
                | RDKafkaErrorCode::Authentication
                | RDKafkaErrorCode::SaslAuthenticationFailed
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::GroupAuthorizationFailed
                | RDKafkaErrorCode::ClusterAuthorizationFailed
        )
    )
}

/// Shared producer used by every Kafka event of a runtime.
pub struct KafkaClient {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaClient {
    /// Create the producer. No broker round-trip happens here.
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = build_producer_config(config).create().map_err(|e| {
            EventError::Broker(format!("Failed to create Kafka producer: {}", e))
        })?;

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            "Kafka producer created"
        );

        Ok(Self {
            producer,
            timeout: config.timeout(),
        })
    }
}

/// Event published to a Kafka topic.
pub struct KafkaEvent {
    envelope: Envelope,
    topic: String,
    client: Arc<KafkaClient>,
}

impl KafkaEvent {
    pub fn new(client: Arc<KafkaClient>, topic: impl Into<String>) -> Result<Self> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(EventError::InvalidEndpoint {
                endpoint: topic,
                message: "topic is empty".to_string(),
            });
        }
        Ok(Self {
            envelope: Envelope::default(),
            topic,
            client,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl Transport for KafkaEvent {
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
        TransportKind::Kafka
    }

    async fn send(&self, data: Value) -> Result<()> {
        let event = self.envelope.to_cloud_event(data)?;
        let payload = serde_json::to_vec(&event)?;

        let headers = OwnedHeaders::new().insert(Header {
            key: CONTENT_TYPE_HEADER,
            value: Some(CLOUDEVENTS_JSON),
        });

        let record = FutureRecord::to(&self.topic)
            .key(&self.envelope.id)
            .payload(&payload)
            .headers(headers);

        let (partition, offset) = self
            .client
            .producer
            .send(record, self.client.timeout)
            .await
            .map_err(|(e, _)| classify_produce_error(e))?;

        debug!(
            topic = %self.topic,
            key = %self.envelope.id,
            partition,
            offset,
            "Published event to Kafka"
        );
        Ok(())
    }
}

/// Consumer-group receiver for one topic.
pub struct KafkaReceiver {
    consumer: StreamConsumer,
    topic: String,
    group: String,
    handler: Arc<dyn EventHandler>,
    status: ReceiverStatus,
}

impl KafkaReceiver {
    /// Create the consumer. Subscription happens in `run`.
    pub fn new(
        config: &KafkaConfig,
        topic: impl Into<String>,
        group: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        let topic = topic.into();
        let group = group.into();
        if topic.is_empty() || group.is_empty() {
            return Err(EventError::Broker(
                "Kafka receiver needs a topic and a group".to_string(),
            ));
        }

        let consumer: StreamConsumer = build_consumer_config(config, &group)
            .create()
            .map_err(|e| EventError::Broker(format!("Failed to create Kafka consumer: {}", e)))?;

        Ok(Self {
            consumer,
            topic,
            group,
            handler,
            status: ReceiverStatus::new(),
        })
    }

    pub fn status(&self) -> ReceiverStatus {
        self.status.clone()
    }

    /// Consume until `cancel` fires or the stream fails.
    ///
    /// Offsets are committed after the handler returns, whatever its
    /// outcome; undecodable records are committed and skipped.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            self.status.advance(ReceiverState::Stopped);
            return Ok(());
        }

        self.status.advance(ReceiverState::Connecting);
        if let Err(e) = self.consumer.subscribe(&[&self.topic]) {
            self.status.advance(ReceiverState::Faulted);
            error!(topic = %self.topic, error = %e, "Failed to subscribe");
            return Err(EventError::Broker(format!(
                "Failed to subscribe to {}: {}",
                self.topic, e
            )));
        }
        self.status.advance(ReceiverState::Receiving);
        info!(topic = %self.topic, group = %self.group, "Kafka receiver subscribed");

        let mut stream = self.consumer.stream();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.status.advance(ReceiverState::Stopped);
                    info!(topic = %self.topic, "Kafka receiver stopped");
                    return Ok(());
                }
                next = stream.next() => match next {
                    Some(Ok(message)) => self.process(&message).await,
                    Some(Err(e)) if is_fatal_consume_error(&e) => {
                        self.status.advance(ReceiverState::Faulted);
                        error!(topic = %self.topic, error = %e, "Kafka consumer failed");
                        return Err(EventError::Broker(e.to_string()));
                    }
                    Some(Err(e)) => {
                        // librdkafka recovers from these on its own
                        warn!(topic = %self.topic, error = %e, "Kafka consumer error");
                    }
                    None => {
                        self.status.advance(ReceiverState::Faulted);
                        return Err(EventError::Broker("consumer stream ended".to_string()));
                    }
                }
            }
        }
    }

    async fn process(&self, message: &BorrowedMessage<'_>) {
        let headers: Vec<(&str, &[u8])> = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|h| h.value.map(|v| (h.key, v)))
                    .collect()
            })
            .unwrap_or_default();

        match decode_record(&headers, message.payload().unwrap_or_default()) {
            Ok(event) => {
                debug!(
                    topic = %message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    "Received event"
                );
                let _ = dispatch(self.handler.as_ref(), event).await;
            }
            Err(e) => {
                warn!(
                    topic = %message.topic(),
                    offset = message.offset(),
                    error = %e,
                    "Skipping undecodable record"
                );
            }
        }

        if let Err(e) = self.consumer.commit_message(message, CommitMode::Async) {
            error!(error = %e, "Failed to commit offset");
        }
    }
}

/// Decode a record as a binary-mode event when it carries `ce_` headers,
/// otherwise as a structured-mode event.
fn decode_record(headers: &[(&str, &[u8])], payload: &[u8]) -> Result<CloudEventEnvelope> {
    let binary = headers
        .iter()
        .any(|(key, _)| key.to_ascii_lowercase().starts_with("ce_"));

    if !binary {
        return Ok(serde_json::from_slice(payload)?);
    }

    let content_type = headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(CONTENT_TYPE_HEADER))
        .and_then(|(_, value)| std::str::from_utf8(value).ok());

    decode_binary("ce_", headers.iter().copied(), content_type, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudevents::event::AttributesReader;

    #[test]
    fn test_transient_consume_errors_are_not_fatal() {
        assert!(!is_fatal_consume_error(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::UnknownTopicOrPartition
        )));
        assert!(!is_fatal_consume_error(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::BrokerTransportFailure
        )));
        assert!(!is_fatal_consume_error(&KafkaError::PartitionEOF(0)));
    }

    #[test]
    fn test_fatal_consume_errors() {
        assert!(is_fatal_consume_error(&KafkaError::Global(
            RDKafkaErrorCode::Fatal
        )));
        assert!(is_fatal_consume_error(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::TopicAuthorizationFailed
        )));
    }

    #[test]
    fn test_producer_config_applies_security() {
        let config = KafkaConfig::new("broker:9092")
            .with_sasl("user", "secret", "SCRAM-SHA-256")
            .with_ssl_ca("/etc/ca.pem");
        let client = build_producer_config(&config);

        assert_eq!(client.get("bootstrap.servers"), Some("broker:9092"));
        assert_eq!(client.get("acks"), Some("all"));
        assert_eq!(client.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(client.get("sasl.mechanism"), Some("SCRAM-SHA-256"));
        assert_eq!(client.get("ssl.ca.location"), Some("/etc/ca.pem"));
    }

    #[test]
    fn test_consumer_config_uses_group() {
        let client = build_consumer_config(&KafkaConfig::default(), "g1");
        assert_eq!(client.get("group.id"), Some("g1"));
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
        assert_eq!(client.get("security.protocol"), None);
    }

    #[test]
    fn test_decode_structured_record() {
        let event = Envelope {
            id: "k-1".to_string(),
            event_type: "order.created".to_string(),
            source: "urn:orders".to_string(),
        }
        .to_cloud_event(serde_json::json!({"n": 1}))
        .unwrap();
        let payload = serde_json::to_vec(&event).unwrap();

        let headers: Vec<(&str, &[u8])> = vec![(CONTENT_TYPE_HEADER, CLOUDEVENTS_JSON.as_bytes())];
        let decoded = decode_record(&headers, &payload).unwrap();
        assert_eq!(decoded.id(), "k-1");
        assert_eq!(decoded.ty(), "order.created");
    }

    #[test]
    fn test_decode_binary_record() {
        let headers: Vec<(&str, &[u8])> = vec![
            ("ce_id", b"k-2".as_slice()),
            ("ce_type", b"order.shipped".as_slice()),
            ("ce_source", b"urn:orders".as_slice()),
            ("ce_specversion", b"1.0".as_slice()),
            (CONTENT_TYPE_HEADER, b"application/json".as_slice()),
        ];
        let decoded = decode_record(&headers, br#"{"n":2}"#).unwrap();
        assert_eq!(decoded.id(), "k-2");
        assert_eq!(decoded.ty(), "order.shipped");
    }

    #[test]
    fn test_empty_topic_rejected() {
        let client = Arc::new(KafkaClient::new(&KafkaConfig::default()).unwrap());
        assert!(matches!(
            KafkaEvent::new(client, ""),
            Err(EventError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn test_queue_full_is_transient() {
        let err = classify_produce_error(KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull));
        assert!(err.is_transient());

        let err = classify_produce_error(KafkaError::MessageProduction(
            RDKafkaErrorCode::MessageSizeTooLarge,
        ));
        assert!(!err.is_transient());
    }
}
