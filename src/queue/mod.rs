//! Background job queue.
//!
//! Producers enqueue a payload for a `(topic, queue)` pair, optionally delayed.
//! Consumers reserve eligible messages and run a `Job` on each: success
//! acknowledges the message, failure re-queues it after the policy's sleep
//! until the attempt budget is spent, and exhausted messages are handed to
//! `Queue::err` exactly once.

use std::backtrace::Backtrace;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

mod engine;
mod job;
mod report;
mod store;

pub use engine::StoreQueue;
pub use job::{Job, JsonJob};
pub use report::{ChannelReporter, FailureReporter, LogReporter};
pub use store::{JobStore, MemoryJobStore};

use crate::config::QueueConfig;

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueOpError>;

/// Failure of a job, with the stack captured where it was created.
#[derive(Clone)]
pub struct QueueError {
    message: String,
    stack: Arc<str>,
}

impl QueueError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: Backtrace::force_capture().to_string().into(),
        }
    }

    /// Wrap any displayable error.
    pub fn from_error<E: fmt::Display>(err: E) -> Self {
        Self::new(err.to_string())
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Stack snapshot taken when the error was created.
    pub fn stack(&self) -> &str {
        &self.stack
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueError")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl std::error::Error for QueueError {}

/// Errors returned by queue operations themselves (not by jobs).
#[derive(Debug, thiserror::Error)]
pub enum QueueOpError {
    #[error("Queue is closed")]
    Closed,

    #[error("Queue {0} role is not connected")]
    NotConnected(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Store error: {0}")]
    Store(String),

    /// The message is no longer reserved by the caller, usually because its
    /// lease ran out.
    #[error("Message {0} is not reserved")]
    LeaseLost(String),
}

/// Retry policy for one consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerPolicy {
    /// Delay before a failed message becomes eligible again.
    pub sleep: Duration,
    /// Total attempts per message; 0 is treated as 1.
    pub retry_limit: u32,
    /// Bound on each handler call; zero means unbounded.
    pub timeout: Duration,
}

impl ConsumerPolicy {
    pub fn new(sleep_secs: u64, retry_limit: u32, timeout_secs: u64) -> Self {
        Self {
            sleep: Duration::from_secs(sleep_secs),
            retry_limit,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Attempts allowed per message.
    pub fn attempts(&self) -> u32 {
        self.retry_limit.max(1)
    }
}

impl From<&QueueConfig> for ConsumerPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self::new(config.sleep_secs, config.retry_limit, config.timeout_secs)
    }
}

/// A queued payload and its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    pub topic: String,
    pub queue: String,
    pub payload: Vec<u8>,
    /// Attempts made so far, including the one in progress.
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// A message that used up its attempts, with the last failure.
#[derive(Debug, Clone)]
pub struct FailedJobs {
    pub message: QueueMessage,
    pub error: QueueError,
    pub failed_at: DateTime<Utc>,
}

impl FailedJobs {
    pub fn new(message: QueueMessage, error: QueueError) -> Self {
        Self {
            message,
            error,
            failed_at: Utc::now(),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.message.attempts
    }
}

/// Queue contract.
///
/// `producer_connect` and `consumer_connect` enable the respective role and
/// connect the queue if needed. After `close`, role operations fail with
/// `QueueOpError::Closed` and running consumers return `Ok(())`.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn producer_connect(&self) -> Result<()>;

    async fn consumer_connect(&self) -> Result<()>;

    /// Enqueue `message`, eligible no earlier than `delay` from now.
    /// Returns the message id.
    async fn producer(
        &self,
        topic: &str,
        queue: &str,
        message: Vec<u8>,
        delay: Duration,
    ) -> Result<String>;

    /// Consume `(topic, queue)` with `job` until the queue is closed.
    async fn consumer(
        &self,
        topic: &str,
        queue: &str,
        job: Arc<dyn Job>,
        policy: ConsumerPolicy,
    ) -> Result<()>;

    /// Report a message that exhausted its attempts.
    async fn err(&self, failed: FailedJobs);

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_captures_stack() {
        let err = QueueError::new("boom");
        assert_eq!(err.message(), "boom");
        assert_eq!(err.to_string(), "boom");
        assert!(!err.stack().is_empty());
    }

    #[test]
    fn test_queue_error_from_error() {
        let source = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = QueueError::from_error(source);
        assert_eq!(err.message(), "disk gone");
    }

    #[test]
    fn test_policy_zero_retry_means_one_attempt() {
        assert_eq!(ConsumerPolicy::new(0, 0, 0).attempts(), 1);
        assert_eq!(ConsumerPolicy::new(0, 4, 0).attempts(), 4);
    }

    #[test]
    fn test_policy_from_config() {
        let policy = ConsumerPolicy::from(&QueueConfig::default());
        assert_eq!(policy.sleep, Duration::from_secs(1));
        assert_eq!(policy.retry_limit, 3);
        assert_eq!(policy.timeout, Duration::from_secs(30));
    }
}
