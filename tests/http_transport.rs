//! HTTP transport against a live HTTP receiver.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use cloudevents::event::{AttributesReader, Data};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use eventline::config::Config;
use eventline::event::{
    CloudEventEnvelope, EventError, EventHandler, HandlerError, HandlerResult, ReceiverState,
    ReceiverStatus,
};
use eventline::EventRuntime;

async fn start_receiver(
    runtime: &EventRuntime,
    handler: Arc<dyn EventHandler>,
) -> (SocketAddr, ReceiverStatus, CancellationToken, JoinHandle<Result<(), EventError>>) {
    let receiver = runtime
        .http_receiver("127.0.0.1:0", handler)
        .await
        .expect("bind receiver");
    let addr = receiver.local_addr().unwrap();
    let status = receiver.status();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(receiver.run(cancel.clone()));
    (addr, status, cancel, task)
}

fn recording_handler() -> (Arc<dyn EventHandler>, mpsc::UnboundedReceiver<CloudEventEnvelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |event: CloudEventEnvelope| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event);
            HandlerResult::Ok(())
        }
    };
    let handler: Arc<dyn EventHandler> = Arc::new(handler);
    (handler, rx)
}

/// Serve a router that always answers with `status`.
async fn fixed_status_server(status: StatusCode) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/", post(move || async move { status }));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

#[tokio::test]
async fn test_http_roundtrip() {
    let (runtime, _drain) = EventRuntime::new(&Config::for_test()).unwrap();
    let (handler, mut rx) = recording_handler();
    let (addr, status, cancel, task) = start_receiver(&runtime, handler).await;

    let event = runtime
        .http_event(&format!("http://{}/", addr), "invoice.paid")
        .unwrap();
    event
        .send(&serde_json::json!({"invoice": "INV-1", "amount": 120}))
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("handler not invoked")
        .unwrap();
    assert_eq!(received.id(), event.id());
    assert_eq!(received.ty(), "invoice.paid");
    assert_eq!(
        received.data(),
        Some(&Data::Json(
            serde_json::json!({"invoice": "INV-1", "amount": 120})
        ))
    );

    assert_eq!(status.state(), ReceiverState::Receiving);
    cancel.cancel();
    task.await.unwrap().unwrap();
    assert_eq!(status.state(), ReceiverState::Stopped);
}

#[tokio::test]
async fn test_binary_mode_request() {
    let (runtime, _drain) = EventRuntime::new(&Config::for_test()).unwrap();
    let (handler, mut rx) = recording_handler();
    let (addr, _status, cancel, task) = start_receiver(&runtime, handler).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/hooks/orders", addr))
        .header("ce-id", "bin-42")
        .header("ce-type", "order.created")
        .header("ce-source", "urn:shop")
        .header("ce-specversion", "1.0")
        .header("content-type", "application/json")
        .body(r#"{"sku":"A1"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let received = rx.recv().await.unwrap();
    assert_eq!(received.id(), "bin-42");
    assert_eq!(received.source().to_string(), "urn:shop");

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_undecodable_request_is_bad_request() {
    let (runtime, _drain) = EventRuntime::new(&Config::for_test()).unwrap();
    let (handler, mut rx) = recording_handler();
    let (addr, _status, cancel, task) = start_receiver(&runtime, handler).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/", addr))
        .header("content-type", "application/cloudevents+json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    assert!(rx.try_recv().is_err());

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_handler_rejection_is_permanent_for_sender() {
    let (runtime, _drain) = EventRuntime::new(&Config::for_test()).unwrap();
    let handler: Arc<dyn EventHandler> = Arc::new(|_: CloudEventEnvelope| async {
        Err::<(), _>(HandlerError::Rejected("unknown tenant".to_string()))
    });
    let (addr, _status, cancel, task) = start_receiver(&runtime, handler).await;

    let event = runtime
        .http_event(&format!("http://{}/", addr), "t")
        .unwrap();
    let err = event.send(&()).await.unwrap_err();
    assert!(matches!(err, EventError::Rejected(_)), "got {err}");
    assert!(!err.is_transient());

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_server_errors_are_transient() {
    let (runtime, _drain) = EventRuntime::new(&Config::for_test()).unwrap();

    for status in [StatusCode::SERVICE_UNAVAILABLE, StatusCode::TOO_MANY_REQUESTS] {
        let addr = fixed_status_server(status).await;
        let event = runtime
            .http_event(&format!("http://{}/", addr), "t")
            .unwrap();
        let err = event.send(&()).await.unwrap_err();
        assert!(matches!(err, EventError::Unavailable(_)), "got {err}");
        assert!(err.is_transient());
    }
}

#[tokio::test]
async fn test_connection_refused_is_transient() {
    let (runtime, _drain) = EventRuntime::new(&Config::for_test()).unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let event = runtime
        .http_event(&format!("http://{}/", addr), "t")
        .unwrap();
    let err = event.send(&()).await.unwrap_err();
    assert!(err.is_transient(), "got {err}");
}

#[tokio::test]
async fn test_bind_failure_is_returned() {
    let (runtime, _drain) = EventRuntime::new(&Config::for_test()).unwrap();
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = taken.local_addr().unwrap();
    let (handler, _rx) = recording_handler();

    let result = runtime.http_receiver(&addr.to_string(), handler).await;
    assert!(matches!(result, Err(EventError::Io(_))));
}
