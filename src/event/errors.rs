//! Error surface for failures that cannot be returned to a caller.
//!
//! A single bounded channel per runtime. Factories push construction failures
//! with `report`, which never blocks: when the surface is full the newest
//! error is dropped and counted. Detached sends use `report_wait`, which waits
//! for capacity. If nothing drains the surface, `report_wait` callers stall
//! once it fills, so every runtime needs a drain (see `ErrorDrain::spawn_logger`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{Envelope, EventError};

/// A failure paired with the envelope of the event it concerns, if any.
#[derive(Debug, Clone)]
pub struct EventErr {
    pub error: Arc<EventError>,
    pub event: Option<Envelope>,
}

impl EventErr {
    pub fn new(error: Arc<EventError>, event: Option<Envelope>) -> Self {
        Self { error, event }
    }
}

/// Sending half of the error surface. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ErrorSurface {
    sender: mpsc::Sender<EventErr>,
    dropped: Arc<AtomicU64>,
}

/// Receiving half of the error surface.
#[derive(Debug)]
pub struct ErrorDrain {
    receiver: mpsc::Receiver<EventErr>,
}

impl ErrorSurface {
    /// Create a surface holding at most `capacity` undrained errors.
    pub fn new(capacity: usize) -> (Self, ErrorDrain) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            ErrorDrain { receiver },
        )
    }

    /// Push without blocking. Returns false if the error was dropped.
    pub fn report(&self, err: EventErr) -> bool {
        match self.sender.try_send(err) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(err)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    error = %err.error,
                    dropped_total = dropped,
                    "Error surface full, dropping newest error"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(err)) => {
                debug!(error = %err.error, "Error surface closed, error discarded");
                false
            }
        }
    }

    /// Push, waiting for capacity.
    pub async fn report_wait(&self, err: EventErr) {
        if let Err(mpsc::error::SendError(err)) = self.sender.send(err).await {
            debug!(error = %err.error, "Error surface closed, error discarded");
        }
    }

    /// Number of errors dropped because the surface was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ErrorDrain {
    /// Wait for the next error. Returns `None` once every surface handle is gone.
    pub async fn recv(&mut self) -> Option<EventErr> {
        self.receiver.recv().await
    }

    /// Take the next error if one is queued.
    pub fn try_recv(&mut self) -> Option<EventErr> {
        self.receiver.try_recv().ok()
    }

    /// Drain the surface into the log until every surface handle is dropped.
    pub fn spawn_logger(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(err) = self.recv().await {
                match err.event {
                    Some(ref envelope) => error!(
                        error = %err.error,
                        id = %envelope.id,
                        event_type = %envelope.event_type,
                        "Event failure"
                    ),
                    None => error!(error = %err.error, "Event failure"),
                }
            }
        })
    }
}
