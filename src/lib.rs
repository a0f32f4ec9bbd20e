//! Eventline - transport-agnostic event publishing and job queues
//!
//! Build a CloudEvent once and deliver it over HTTP, Kafka, an in-process
//! channel or gRPC without touching the call site. The companion queue
//! module produces delayed jobs and consumes them with bounded retries.

pub mod config;
pub mod event;
pub mod queue;
pub mod utils;

pub mod proto {
    tonic::include_proto!("eventline");
}

pub use event::{Event, EventError, EventRuntime};
pub use queue::{Queue, QueueError};
