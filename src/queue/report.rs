//! Destinations for messages that exhausted their attempts.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::FailedJobs;

/// Receives failed jobs from `Queue::err`.
#[async_trait]
pub trait FailureReporter: Send + Sync {
    async fn report(&self, failed: FailedJobs);
}

/// Reporter that only logs.
///
/// Default when nothing else is configured.
pub struct LogReporter;

#[async_trait]
impl FailureReporter for LogReporter {
    async fn report(&self, failed: FailedJobs) {
        error!(
            id = %failed.message.id,
            topic = %failed.message.topic,
            queue = %failed.message.queue,
            attempts = failed.attempts(),
            error = %failed.error,
            stack = %failed.error.stack(),
            "Job failed permanently"
        );
    }
}

/// In-memory reporter using a channel.
pub struct ChannelReporter {
    sender: mpsc::UnboundedSender<FailedJobs>,
}

impl ChannelReporter {
    /// Returns the reporter and a receiver for consuming failed jobs.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FailedJobs>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl FailureReporter for ChannelReporter {
    async fn report(&self, failed: FailedJobs) {
        info!(id = %failed.message.id, "Publishing failed job to channel");
        if let Err(e) = self.sender.send(failed) {
            warn!(id = %e.0.message.id, "Failed job receiver dropped, logging instead");
            LogReporter.report(e.0).await;
        }
    }
}
