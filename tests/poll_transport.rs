use axum::{extract::State, http::StatusCode, routing::post, Form, Router};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use lapse_harness::config::PollConfig;
use lapse_harness::control_poll::PollTransport;
use lapse_harness::counters::EventCounters;
use lapse_harness::job::RetryPolicy;
use lapse_harness::models::JobKind;

#[derive(Default)]
struct Mock {
    updates: Vec<HashMap<String, String>>,
    command_keys: Vec<String>,
    commands: Vec<String>,
}

type Shared = Arc<Mutex<Mock>>;

async fn update(State(mock): State<Shared>, Form(form): Form<HashMap<String, String>>) -> &'static str {
    mock.lock().unwrap().updates.push(form);
    "1"
}

async fn command(State(mock): State<Shared>, Form(form): Form<HashMap<String, String>>) -> String {
    let mut mock = mock.lock().unwrap();
    mock.command_keys
        .push(form.get("api_key").cloned().unwrap_or_default());
    if mock.commands.is_empty() {
        String::new()
    } else {
        mock.commands.remove(0)
    }
}

async fn broken() -> StatusCode {
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn start(mock: Shared) -> SocketAddr {
    let app = Router::new()
        .route("/update", post(update))
        .route("/command", post(command))
        .route("/broken", post(broken))
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn poll_config(addr: SocketAddr, status_path: &str) -> PollConfig {
    PollConfig {
        status_url: format!("http://{}{}", addr, status_path),
        command_url: Some(format!("http://{}/command", addr)),
        write_key: "WRITE".to_string(),
        read_key: "READ".to_string(),
        timeout_secs: 5,
    }
}

#[tokio::test]
async fn test_status_push_sends_fields_and_summary() {
    let mock = Shared::default();
    let addr = start(mock.clone()).await;
    let transport = PollTransport::new(&poll_config(addr, "/update")).unwrap();

    let counters = EventCounters::new();
    let capture = counters
        .register(JobKind::Capture, RetryPolicy::default())
        .unwrap();
    counters
        .register(JobKind::Upload, RetryPolicy::default())
        .unwrap();
    capture.set_paused(true);

    transport
        .push_status(&counters.snapshot("CAM1", None))
        .await
        .unwrap();

    let mock = mock.lock().unwrap();
    assert_eq!(mock.updates.len(), 1);
    let form = &mock.updates[0];
    assert_eq!(form["api_key"], "WRITE");
    assert_eq!(form["field1"], "16");
    assert_eq!(form["field3"], "0");
    assert!(form["status"].contains("capture:"));
}

#[tokio::test]
async fn test_pull_command_consumes_once() {
    let mock = Shared::default();
    mock.lock()
        .unwrap()
        .commands
        .push("capture/pause\n".to_string());
    let addr = start(mock.clone()).await;
    let transport = PollTransport::new(&poll_config(addr, "/update")).unwrap();

    assert_eq!(
        transport.pull_command().await.unwrap().as_deref(),
        Some("capture/pause")
    );
    assert_eq!(transport.pull_command().await.unwrap(), None);
    assert_eq!(mock.lock().unwrap().command_keys, vec!["READ", "READ"]);
}

#[tokio::test]
async fn test_server_error_is_network_error() {
    let mock = Shared::default();
    let addr = start(mock).await;
    let transport = PollTransport::new(&poll_config(addr, "/broken")).unwrap();
    let counters = EventCounters::new();

    let err = transport
        .push_status(&counters.snapshot("CAM1", None))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "network");
    assert!(err.to_string().contains("500"));
}

#[tokio::test]
async fn test_unreachable_endpoint_is_network_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let transport = PollTransport::new(&poll_config(addr, "/update")).unwrap();
    let err = transport.pull_command().await.unwrap_err();
    assert_eq!(err.kind(), "network");
}
