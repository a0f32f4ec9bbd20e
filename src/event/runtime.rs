//! Composition root for events.
//!
//! `EventRuntime` owns the clients shared by every event it builds: the
//! reqwest client, the channel hub, the lazily created Kafka producer and the
//! error surface. Build one at startup and pass it (or clones) around.

use std::sync::Arc;
#[cfg(feature = "kafka")]
use std::sync::Mutex;

use reqwest::Client;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::channel::{ChannelEvent, ChannelHub};
use super::http::{HttpEvent, HttpReceiver};
#[cfg(feature = "kafka")]
use super::kafka::{KafkaClient, KafkaEvent, KafkaReceiver};
use super::rpc::RpcEvent;
use super::{
    ErrorDrain, ErrorSurface, Event, EventErr, EventError, EventHandler, ReceiverHandle, Result,
    Transport,
};
use crate::config::{Config, MessagingConfig};

/// Shared event clients and factories.
#[derive(Clone)]
pub struct EventRuntime {
    messaging: Arc<MessagingConfig>,
    http: Client,
    hub: ChannelHub,
    errors: ErrorSurface,
    #[cfg(feature = "kafka")]
    kafka: Arc<Mutex<Option<Arc<KafkaClient>>>>,
}

impl EventRuntime {
    /// Build a runtime from configuration.
    ///
    /// Returns the drain of the runtime's error surface; the caller must
    /// consume it (`ErrorDrain::spawn_logger` is the simplest choice).
    pub fn new(config: &Config) -> Result<(Self, ErrorDrain)> {
        let http = Client::builder()
            .timeout(config.messaging.http.timeout())
            .build()?;
        let (errors, drain) = ErrorSurface::new(config.errors.capacity);

        let runtime = Self {
            messaging: Arc::new(config.messaging.clone()),
            http,
            hub: ChannelHub::new(config.messaging.channel.capacity),
            errors,
            #[cfg(feature = "kafka")]
            kafka: Arc::new(Mutex::new(None)),
        };
        Ok((runtime, drain))
    }

    /// Sending half of the error surface.
    pub fn errors(&self) -> &ErrorSurface {
        &self.errors
    }

    pub fn channel_hub(&self) -> &ChannelHub {
        &self.hub
    }

    /// Default `source` stamped on new events.
    pub fn source(&self) -> &str {
        &self.messaging.source
    }

    /// Event POSTed to `endpoint`.
    pub fn http_event(&self, endpoint: &str, name: &str) -> Result<Event> {
        let built = HttpEvent::new(self.http.clone(), endpoint).map(|mut event| {
            for (key, value) in &self.messaging.http.headers {
                event = event.with_header(key.clone(), value.clone());
            }
            event
        });
        self.assemble(built, name)
    }

    /// Event published to the Kafka `topic`.
    pub fn kafka_event(&self, topic: &str, name: &str) -> Result<Event> {
        #[cfg(feature = "kafka")]
        {
            let built = self
                .kafka_client()
                .and_then(|client| KafkaEvent::new(client, topic));
            self.assemble(built, name)
        }

        #[cfg(not(feature = "kafka"))]
        {
            let _ = topic;
            Err(self.reject(EventError::Unsupported("Kafka", "kafka"), name))
        }
    }

    /// Event broadcast on the in-process hub.
    pub fn channel_event(&self, name: &str) -> Result<Event> {
        self.assemble(Ok(ChannelEvent::new(&self.hub)), name)
    }

    /// Event delivered to the gRPC sink at `endpoint`.
    pub fn rpc_event(&self, endpoint: &str, name: &str) -> Result<Event> {
        self.assemble(RpcEvent::new(endpoint, &self.messaging.rpc), name)
    }

    /// Assign the envelope, or report the construction failure.
    fn assemble<T>(&self, built: Result<T>, name: &str) -> Result<Event>
    where
        T: Transport + 'static,
    {
        match built {
            Ok(mut transport) => {
                transport.set_id(Uuid::new_v4().to_string());
                transport.set_type(name.to_string());
                transport.set_source(self.messaging.source.clone());
                debug!(id = %transport.envelope().id, kind = %transport.kind(), event_type = %name, "Event created");
                Ok(Event::new(Box::new(transport)))
            }
            Err(e) => Err(self.reject(e, name)),
        }
    }

    fn reject(&self, err: EventError, name: &str) -> EventError {
        warn!(event_type = %name, error = %err, "Event construction failed");
        let err = Arc::new(err);
        self.errors.report(EventErr::new(err.clone(), None));
        EventError::Construction(err)
    }

    #[cfg(feature = "kafka")]
    fn kafka_client(&self) -> Result<Arc<KafkaClient>> {
        let mut guard = self
            .kafka
            .lock()
            .map_err(|_| EventError::Broker("Kafka client lock poisoned".to_string()))?;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = Arc::new(KafkaClient::new(&self.messaging.kafka)?);
        *guard = Some(client.clone());
        Ok(client)
    }

    /// Start a channel receiver on its own task.
    pub fn channel_receiver(
        &self,
        cancel: CancellationToken,
        handler: Arc<dyn EventHandler>,
    ) -> ReceiverHandle {
        self.hub.spawn_receiver(cancel, handler, self.errors.clone())
    }

    /// Bind an HTTP receiver on `addr`.
    pub async fn http_receiver(
        &self,
        addr: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<HttpReceiver> {
        HttpReceiver::bind(addr, handler).await
    }

    /// Consumer-group receiver on `topic`.
    #[cfg(feature = "kafka")]
    pub fn kafka_receiver(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<KafkaReceiver> {
        KafkaReceiver::new(&self.messaging.kafka, topic, group, handler)
    }

    /// Send without waiting for the outcome.
    ///
    /// A failure is pushed onto the error surface with the event's envelope,
    /// waiting for capacity if the surface is full.
    pub fn spawn_send(&self, event: Arc<Event>, data: Value) -> JoinHandle<()> {
        let errors = self.errors.clone();
        tokio::spawn(async move {
            if let Err(e) = event.send(&data).await {
                errors
                    .report_wait(EventErr::new(Arc::new(e), Some(event.envelope().clone())))
                    .await;
            }
        })
    }
}
