//! In-process channel transport.
//!
//! Uses a tokio broadcast channel owned by the runtime. Every channel event
//! holds a sender clone; every receiver subscribes at start and sees events
//! sent after that point.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::receiver::dispatch;
use super::{
    CloudEventEnvelope, Envelope, ErrorSurface, EventErr, EventError, EventHandler,
    ReceiverHandle, ReceiverState, ReceiverStatus, Result, Transport, TransportKind,
};

/// Broadcast hub shared by channel events and receivers.
#[derive(Debug, Clone)]
pub struct ChannelHub {
    sender: broadcast::Sender<Arc<CloudEventEnvelope>>,
}

impl ChannelHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        info!(capacity, "Channel hub initialized");
        Self { sender }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn subscribe(&self) -> broadcast::Receiver<Arc<CloudEventEnvelope>> {
        self.sender.subscribe()
    }

    /// Start a receive loop on its own task.
    ///
    /// Subscribes before returning, so events sent afterwards are seen. The
    /// loop ends quietly on cancellation. If the hub closes under it, the
    /// loop faults: the failure is pushed onto `errors` and returned from
    /// `ReceiverHandle::join`.
    pub fn spawn_receiver(
        &self,
        cancel: CancellationToken,
        handler: Arc<dyn EventHandler>,
        errors: ErrorSurface,
    ) -> ReceiverHandle {
        let status = ReceiverStatus::new();
        status.advance(ReceiverState::Connecting);
        let mut receiver = self.subscribe();
        status.advance(ReceiverState::Receiving);

        let task = {
            let status = status.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            status.advance(ReceiverState::Stopped);
                            info!("Channel receiver stopped");
                            return Ok(());
                        }
                        received = receiver.recv() => match received {
                            Ok(event) => {
                                debug!("Received event via channel");
                                let _ = dispatch(handler.as_ref(), (*event).clone()).await;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "Channel receiver lagged, skipped events");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                status.advance(ReceiverState::Faulted);
                                error!("Channel closed under receiver");
                                errors.report_wait(EventErr::new(
                                    Arc::new(EventError::ChannelClosed),
                                    None,
                                )).await;
                                return Err(EventError::ChannelClosed);
                            }
                        }
                    }
                }
            })
        };

        info!("Channel receiver started");
        ReceiverHandle::new(status, cancel, task)
    }
}

/// Event delivered through the in-process hub.
pub struct ChannelEvent {
    envelope: Envelope,
    sender: broadcast::Sender<Arc<CloudEventEnvelope>>,
}

impl ChannelEvent {
    pub fn new(hub: &ChannelHub) -> Self {
        Self {
            envelope: Envelope::default(),
            sender: hub.sender.clone(),
        }
    }
}

#[async_trait]
impl Transport for ChannelEvent {
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
        TransportKind::Channel
    }

    async fn send(&self, data: Value) -> Result<()> {
        let event = self.envelope.to_cloud_event(data)?;

        match self.sender.send(Arc::new(event)) {
            Ok(receivers) => {
                debug!(id = %self.envelope.id, receivers, "Published event to channel");
            }
            Err(_) => {
                // No receivers, that's okay for publish-only scenarios
                debug!(id = %self.envelope.id, "Published event (no receivers)");
            }
        }
        Ok(())
    }
}
