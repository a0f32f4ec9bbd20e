//! Storage abstraction for queued messages.
//!
//! A message lives in the store from `push` until it is acknowledged or
//! buried. `reserve` hands out the earliest eligible message and keeps it
//! reserved until the consumer settles it with `ack`, `release` or `bury`,
//! or until its lease runs out and the next `reserve` reclaims it.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{QueueMessage, QueueOpError, Result};

/// Storage operations required by the queue engine.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Store a new message, eligible from `available_at`.
    async fn push(&self, message: QueueMessage, available_at: Instant) -> Result<()>;

    /// Reserve the next eligible message for `(topic, queue)`, counting an
    /// attempt. `None` when nothing is eligible yet.
    ///
    /// With a `lease`, a reservation left unsettled past it returns to the
    /// queue; settling it afterwards fails with `QueueOpError::LeaseLost`.
    async fn reserve(
        &self,
        topic: &str,
        queue: &str,
        lease: Option<Duration>,
    ) -> Result<Option<QueueMessage>>;

    /// Remove a reserved message after success.
    async fn ack(&self, id: &str) -> Result<()>;

    /// Return a reserved message to the queue, eligible from `available_at`.
    async fn release(&self, id: &str, available_at: Instant) -> Result<()>;

    /// Move a reserved message to the failed set.
    async fn bury(&self, id: &str) -> Result<()>;

    /// Messages waiting (not reserved) for `(topic, queue)`.
    async fn pending(&self, topic: &str, queue: &str) -> Result<usize>;

    /// Refuse further operations.
    async fn close(&self);
}

struct Waiting {
    message: QueueMessage,
    available_at: Instant,
}

struct Reservation {
    message: QueueMessage,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    ready: HashMap<(String, String), VecDeque<Waiting>>,
    reserved: HashMap<String, Reservation>,
    buried: Vec<QueueMessage>,
    closed: bool,
}

impl Inner {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(QueueOpError::Closed)
        } else {
            Ok(())
        }
    }

    fn enqueue(&mut self, message: QueueMessage, available_at: Instant) {
        self.ready
            .entry((message.topic.clone(), message.queue.clone()))
            .or_default()
            .push_back(Waiting {
                message,
                available_at,
            });
    }

    fn take_reserved(&mut self, id: &str) -> Result<QueueMessage> {
        self.reclaim_expired(Instant::now());
        self.reserved
            .remove(id)
            .map(|r| r.message)
            .ok_or_else(|| QueueOpError::LeaseLost(id.to_string()))
    }

    /// Return reservations whose lease ended at or before `now` to the queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .reserved
            .iter()
            .filter(|(_, r)| r.expires_at.is_some_and(|at| at <= now))
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some(reservation) = self.reserved.remove(&id) {
                let available_at = reservation.expires_at.unwrap_or(now);
                debug!(id = %id, attempts = reservation.message.attempts, "Reservation lease expired");
                self.enqueue(reservation.message, available_at);
            }
        }
    }
}

/// In-memory store. Contents are lost when it is dropped.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the messages that exhausted their attempts.
    pub async fn take_buried(&self) -> Vec<QueueMessage> {
        std::mem::take(&mut self.inner.lock().await.buried)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn push(&self, message: QueueMessage, available_at: Instant) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        inner.enqueue(message, available_at);
        Ok(())
    }

    async fn reserve(
        &self,
        topic: &str,
        queue: &str,
        lease: Option<Duration>,
    ) -> Result<Option<QueueMessage>> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;

        let now = Instant::now();
        inner.reclaim_expired(now);

        let Some(waiting) = inner.ready.get_mut(&(topic.to_string(), queue.to_string())) else {
            return Ok(None);
        };

        let next = waiting
            .iter()
            .enumerate()
            .filter(|(_, w)| w.available_at <= now)
            .min_by_key(|(_, w)| w.available_at)
            .map(|(index, _)| index);

        let Some(mut message) = next
            .and_then(|index| waiting.remove(index))
            .map(|w| w.message)
        else {
            return Ok(None);
        };

        message.attempts += 1;
        let expires_at = lease.and_then(|lease| now.checked_add(lease));
        inner.reserved.insert(
            message.id.clone(),
            Reservation {
                message: message.clone(),
                expires_at,
            },
        );
        Ok(Some(message))
    }

    async fn ack(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        inner.take_reserved(id)?;
        Ok(())
    }

    async fn release(&self, id: &str, available_at: Instant) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        let message = inner.take_reserved(id)?;
        inner.enqueue(message, available_at);
        Ok(())
    }

    async fn bury(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check_open()?;
        let message = inner.take_reserved(id)?;
        inner.buried.push(message);
        Ok(())
    }

    async fn pending(&self, topic: &str, queue: &str) -> Result<usize> {
        let inner = self.inner.lock().await;
        inner.check_open()?;
        Ok(inner
            .ready
            .get(&(topic.to_string(), queue.to_string()))
            .map_or(0, VecDeque::len))
    }

    async fn close(&self) {
        self.inner.lock().await.closed = true;
    }
}
