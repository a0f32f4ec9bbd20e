//! Queue engine over a `JobStore`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ConsumerPolicy, FailedJobs, FailureReporter, Job, JobStore, LogReporter, MemoryJobStore,
    Queue, QueueError, QueueMessage, QueueOpError, Result,
};
use crate::config::QueueConfig;

/// Slack on top of the attempt timeout before a reservation is reclaimed.
const LEASE_MARGIN: Duration = Duration::from_secs(5);

/// Deadline used when `now + delay` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 86_400);

fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Reservation held by a running attempt. Dropping it unsettled, when the
/// consumer is cancelled or the job panics, puts the message back.
struct InFlight<S: JobStore> {
    store: Arc<S>,
    id: Option<String>,
}

impl<S: JobStore> InFlight<S> {
    fn new(store: Arc<S>, id: &str) -> Self {
        Self {
            store,
            id: Some(id.to_string()),
        }
    }

    fn disarm(mut self) {
        self.id = None;
    }
}

impl<S: JobStore> Drop for InFlight<S> {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(id = %id, "No runtime to release abandoned reservation");
            return;
        };
        let store = self.store.clone();
        handle.spawn(async move {
            match store.release(&id, Instant::now()).await {
                Ok(()) => warn!(id = %id, "Released abandoned reservation"),
                Err(e) => debug!(id = %id, error = %e, "Abandoned reservation not released"),
            }
        });
    }
}

/// `Queue` implementation polling a `JobStore`.
pub struct StoreQueue<S> {
    store: Arc<S>,
    reporter: Arc<dyn FailureReporter>,
    poll_interval: Duration,
    connected: AtomicBool,
    producer_ready: AtomicBool,
    consumer_ready: AtomicBool,
    closed: CancellationToken,
}

impl StoreQueue<MemoryJobStore> {
    /// In-memory queue that logs failed jobs.
    pub fn memory(config: &QueueConfig) -> Self {
        Self::new(MemoryJobStore::new(), Arc::new(LogReporter), config)
    }
}

impl<S: JobStore> StoreQueue<S> {
    pub fn new(store: S, reporter: Arc<dyn FailureReporter>, config: &QueueConfig) -> Self {
        Self {
            store: Arc::new(store),
            reporter,
            poll_interval: config.poll_interval().max(Duration::from_millis(1)),
            connected: AtomicBool::new(false),
            producer_ready: AtomicBool::new(false),
            consumer_ready: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn ensure_role(&self, ready: &AtomicBool, role: &'static str) -> Result<()> {
        if self.is_closed() {
            return Err(QueueOpError::Closed);
        }
        if !ready.load(Ordering::Acquire) {
            return Err(QueueOpError::NotConnected(role));
        }
        Ok(())
    }

    fn check_target(topic: &str, queue: &str) -> Result<()> {
        if topic.is_empty() || queue.is_empty() {
            return Err(QueueOpError::InvalidArgument(
                "topic and queue must be non-empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Run one attempt, bounded by `timeout` unless it is zero.
    async fn attempt(
        job: &dyn Job,
        message: &QueueMessage,
        timeout: Duration,
    ) -> std::result::Result<(), QueueError> {
        if timeout.is_zero() {
            return job.handle(message).await;
        }
        match tokio::time::timeout(timeout, job.handle(message)).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::new(format!(
                "job {} timed out after {:?}",
                message.id, timeout
            ))),
        }
    }

    /// Settle one reserved message according to the attempt's outcome.
    async fn settle(
        &self,
        message: QueueMessage,
        outcome: std::result::Result<(), QueueError>,
        policy: &ConsumerPolicy,
    ) -> Result<()> {
        match outcome {
            Ok(()) => {
                self.store.ack(&message.id).await?;
                debug!(id = %message.id, attempts = message.attempts, "Job completed");
            }
            Err(error) if message.attempts < policy.attempts() => {
                warn!(
                    id = %message.id,
                    attempt = message.attempts,
                    max_attempts = policy.attempts(),
                    error = %error,
                    "Job failed, retrying"
                );
                self.store
                    .release(&message.id, deadline_after(policy.sleep))
                    .await?;
            }
            Err(error) => {
                self.store.bury(&message.id).await?;
                self.err(FailedJobs::new(message, error)).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S: JobStore> Queue for StoreQueue<S> {
    async fn connect(&self) -> Result<()> {
        if self.is_closed() {
            return Err(QueueOpError::Closed);
        }
        if !self.connected.swap(true, Ordering::AcqRel) {
            info!("Queue connected");
        }
        Ok(())
    }

    async fn producer_connect(&self) -> Result<()> {
        self.connect().await?;
        self.producer_ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn consumer_connect(&self) -> Result<()> {
        self.connect().await?;
        self.consumer_ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn producer(
        &self,
        topic: &str,
        queue: &str,
        message: Vec<u8>,
        delay: Duration,
    ) -> Result<String> {
        self.ensure_role(&self.producer_ready, "producer")?;
        Self::check_target(topic, queue)?;

        let id = Uuid::new_v4().to_string();
        let queued = QueueMessage {
            id: id.clone(),
            topic: topic.to_string(),
            queue: queue.to_string(),
            payload: message,
            attempts: 0,
            enqueued_at: Utc::now(),
        };

        let available_at = Instant::now().checked_add(delay).ok_or_else(|| {
            QueueOpError::InvalidArgument(format!("delay {:?} is too large", delay))
        })?;
        self.store.push(queued, available_at).await?;
        debug!(id = %id, topic, queue, delay_ms = delay.as_millis() as u64, "Job enqueued");
        Ok(id)
    }

    async fn consumer(
        &self,
        topic: &str,
        queue: &str,
        job: Arc<dyn Job>,
        policy: ConsumerPolicy,
    ) -> Result<()> {
        self.ensure_role(&self.consumer_ready, "consumer")?;
        Self::check_target(topic, queue)?;
        info!(topic, queue, attempts = policy.attempts(), "Consumer started");

        let lease = (!policy.timeout.is_zero())
            .then(|| policy.timeout.saturating_add(LEASE_MARGIN));

        loop {
            if self.is_closed() {
                break;
            }

            let reserved = match self.store.reserve(topic, queue, lease).await {
                Ok(reserved) => reserved,
                Err(QueueOpError::Closed) => break,
                Err(e) => return Err(e),
            };

            let message = match reserved {
                Some(message) => message,
                None => {
                    tokio::select! {
                        _ = self.closed.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                    continue;
                }
            };

            let in_flight = InFlight::new(self.store.clone(), &message.id);
            let outcome = Self::attempt(job.as_ref(), &message, policy.timeout).await;
            let id = message.id.clone();
            let settled = self.settle(message, outcome, &policy).await;
            in_flight.disarm();
            match settled {
                Ok(()) => {}
                Err(QueueOpError::LeaseLost(_)) => {
                    warn!(id = %id, "Reservation lost before settling");
                }
                Err(QueueOpError::Closed) => break,
                Err(e) => return Err(e),
            }
        }

        info!(topic, queue, "Consumer stopped");
        Ok(())
    }

    async fn err(&self, failed: FailedJobs) {
        self.reporter.report(failed).await;
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.store.close().await;
        info!("Queue closed");
    }
}
