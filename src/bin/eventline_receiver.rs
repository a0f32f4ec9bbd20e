//! eventline-receiver: logging event receiver
//!
//! Accepts CloudEvents over HTTP (structured, batch or binary mode) and on the
//! in-process channel, and logs each one.
//!
//! ## Configuration
//! - `config.yaml` / `EVENTLINE_CONFIG`: configuration file (optional)
//! - `EVENTLINE__SERVER__PORT`: HTTP port (default: 8080)
//! - `EVENTLINE_LOG`: log filter (default: info)

use std::sync::Arc;

use cloudevents::event::AttributesReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use eventline::config::Config;
use eventline::event::{CloudEventEnvelope, EventHandler, HandlerResult};
use eventline::utils::bootstrap::{cancel_on_ctrl_c, init_tracing};
use eventline::EventRuntime;

async fn log_event(event: CloudEventEnvelope) -> HandlerResult {
    info!(
        id = %event.id(),
        event_type = %event.ty(),
        source = %event.source(),
        data = ?event.data(),
        "Event received"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let (runtime, errors) = EventRuntime::new(&config)?;
    let error_logger = errors.spawn_logger();

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    let handler: Arc<dyn EventHandler> = Arc::new(log_event);

    let channel = runtime.channel_receiver(shutdown.child_token(), handler.clone());

    let receiver = runtime
        .http_receiver(&config.server.addr(), handler)
        .await?;
    info!(
        addr = %receiver.local_addr()?,
        app = %config.app.name,
        env = %config.app.env,
        "eventline-receiver started"
    );

    let served = receiver.run(shutdown.child_token()).await;

    shutdown.cancel();
    if let Err(e) = channel.join().await {
        error!(error = %e, "Channel receiver ended with error");
    }

    drop(runtime);
    let _ = error_logger.await;

    served?;
    info!("eventline-receiver stopped");
    Ok(())
}
