//! Units of work run by queue consumers.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::{QueueError, QueueMessage};

/// Work performed for each consumed message.
#[async_trait]
pub trait Job: Send + Sync {
    async fn handle(&self, message: &QueueMessage) -> Result<(), QueueError>;
}

#[async_trait]
impl<F, Fut> Job for F
where
    F: Fn(QueueMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), QueueError>> + Send + 'static,
{
    async fn handle(&self, message: &QueueMessage) -> Result<(), QueueError> {
        self(message.clone()).await
    }
}

/// Job decoding the payload as JSON into `T` before calling `handler`.
///
/// A payload that does not decode fails the attempt like any other error.
pub struct JsonJob<T, F> {
    handler: F,
    _payload: PhantomData<fn() -> T>,
}

impl<T, F> JsonJob<T, F> {
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> Job for JsonJob<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), QueueError>> + Send + 'static,
{
    async fn handle(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let payload: T = serde_json::from_slice(&message.payload).map_err(|e| {
            QueueError::new(format!("Failed to decode job {}: {}", message.id, e))
        })?;
        (self.handler)(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Deserialize, PartialEq)]
    struct SendEmail {
        to: String,
    }

    fn message(payload: &[u8]) -> QueueMessage {
        QueueMessage {
            id: "m-1".to_string(),
            topic: "mail".to_string(),
            queue: "outbound".to_string(),
            payload: payload.to_vec(),
            attempts: 1,
            enqueued_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_json_job_decodes_payload() {
        let seen = Arc::new(Mutex::new(None));
        let job = {
            let seen = seen.clone();
            JsonJob::new(move |email: SendEmail| {
                let seen = seen.clone();
                async move {
                    *seen.lock().unwrap() = Some(email);
                    Ok::<(), QueueError>(())
                }
            })
        };

        job.handle(&message(br#"{"to":"a@example.com"}"#))
            .await
            .unwrap();
        assert_eq!(
            seen.lock().unwrap().take(),
            Some(SendEmail {
                to: "a@example.com".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_json_job_rejects_bad_payload() {
        let job = JsonJob::new(|_: SendEmail| async { Ok::<(), QueueError>(()) });
        let err = job.handle(&message(b"not json")).await.unwrap_err();
        assert!(err.message().contains("m-1"));
    }

    #[tokio::test]
    async fn test_closure_job() {
        let job = |message: QueueMessage| async move {
            if message.payload.is_empty() {
                Err(QueueError::new("empty"))
            } else {
                Ok(())
            }
        };
        assert!(job.handle(&message(b"x")).await.is_ok());
        assert_eq!(job.handle(&message(b"")).await.unwrap_err().message(), "empty");
    }
}
