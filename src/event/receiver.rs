//! Receiver lifecycle shared by every inbound transport.
//!
//! `Idle → Connecting → Receiving → {Stopped | Faulted}`. `Stopped` is only
//! reached through cancellation; `Faulted` on any transport error. Both are
//! terminal, receivers never reconnect on their own.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{CloudEventEnvelope, EventError, EventHandler, HandlerResult, Result};

/// Lifecycle state of a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    Connecting,
    Receiving,
    Stopped,
    Faulted,
}

impl ReceiverState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Faulted)
    }

    fn can_advance_to(self, next: Self) -> bool {
        use ReceiverState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Stopped)
                | (Connecting, Receiving)
                | (Connecting, Stopped)
                | (Connecting, Faulted)
                | (Receiving, Stopped)
                | (Receiving, Faulted)
        )
    }
}

/// Observable receiver state.
#[derive(Debug, Clone)]
pub struct ReceiverStatus {
    tx: Arc<watch::Sender<ReceiverState>>,
}

impl Default for ReceiverStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiverStatus {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ReceiverState::Idle);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> ReceiverState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReceiverState> {
        self.tx.subscribe()
    }

    /// Move to `next` if the transition is legal. Returns whether it moved.
    pub(crate) fn advance(&self, next: ReceiverState) -> bool {
        self.tx.send_if_modified(|state| {
            if state.can_advance_to(next) {
                debug!(from = ?*state, to = ?next, "Receiver state changed");
                *state = next;
                true
            } else {
                false
            }
        })
    }

    /// Wait until the receiver reaches a terminal state.
    pub async fn terminated(&self) -> ReceiverState {
        let mut rx = self.subscribe();
        let state = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            // Sender lives in self, so the channel cannot close while we wait
            Err(_) => self.state(),
        };
        state
    }
}

/// Supervisor handle for a receiver running on its own task.
#[derive(Debug)]
pub struct ReceiverHandle {
    status: ReceiverStatus,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl ReceiverHandle {
    pub(crate) fn new(
        status: ReceiverStatus,
        cancel: CancellationToken,
        task: JoinHandle<Result<()>>,
    ) -> Self {
        Self {
            status,
            cancel,
            task,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.status.state()
    }

    pub fn status(&self) -> &ReceiverStatus {
        &self.status
    }

    /// Request cooperative shutdown.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the receive loop to end.
    ///
    /// `Ok(())` after cancellation; the loop's error when it faulted.
    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                self.status.advance(ReceiverState::Faulted);
                Err(EventError::Broker(format!("receiver task failed: {}", e)))
            }
        }
    }
}

/// Invoke the handler for one event, logging failures.
pub(crate) async fn dispatch(
    handler: &dyn EventHandler,
    event: CloudEventEnvelope,
) -> HandlerResult {
    use cloudevents::event::AttributesReader;

    let id = event.id().to_string();
    let result = handler.handle(event).await;
    if let Err(ref e) = result {
        warn!(id = %id, error = %e, "Event handler failed");
    }
    result
}
