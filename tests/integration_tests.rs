//! Integration tests for the wakeproxy server
//!
//! These tests run the real hyper client against a fake backend bound to a loopback
//! port, covering the behaviour that depends on actual sockets: streaming, timeouts,
//! refused connections and wake delivery.

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_test::TestServer;
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use wakeproxy::{
    AppState, build_router, client::ClientOptions, dialect::Dialect, dispatcher::ProxySettings,
};

#[derive(Clone, Default)]
struct FakeBackend {
    asleep: Arc<AtomicBool>,
    chat_bodies: Arc<Mutex<Vec<Value>>>,
    wakes: Arc<AtomicUsize>,
}

async fn tags(State(backend): State<FakeBackend>) -> Json<Value> {
    if backend.asleep.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
    Json(json!({"models": [{"name": "llama3"}]}))
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(5)).await;
    "too late"
}

async fn chat(State(backend): State<FakeBackend>, Json(body): Json<Value>) -> Response {
    backend.chat_bodies.lock().unwrap().push(body);

    // Chunk boundaries deliberately fall in the middle of lines
    let chunks = vec![
        "{\"message\":{\"content\":\"He\"},\"done\":false}\n{\"mess",
        "age\":{\"content\":\"llo\"},\"done\":false}\n\n",
        "{\"done\":true}\n",
    ];
    let stream = futures_util::stream::iter(chunks).then(|chunk| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok::<_, std::convert::Infallible>(chunk)
    });

    (
        [("content-type", "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn wake(State(backend): State<FakeBackend>) -> StatusCode {
    backend.wakes.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

async fn spawn_backend(backend: FakeBackend) -> String {
    let app = Router::new()
        .route("/api/tags", get(tags))
        .route("/api/slow", get(slow))
        .route("/api/chat", post(chat))
        .route("/wake", get(wake))
        .with_state(backend);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// A loopback address nothing listens on.
async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

fn proxy(backend_url: &str, wake_url: Option<String>) -> TestServer {
    let settings = ProxySettings::builder()
        .backend_url(backend_url)
        .dialect(Dialect::Ollama)
        .maybe_wake_url(wake_url)
        .list_timeout(Duration::from_millis(300))
        .model_timeout(Duration::from_millis(300))
        .wake_timeout(Duration::from_secs(1))
        .build();
    let options = ClientOptions {
        connect_timeout: Duration::from_secs(1),
        ..ClientOptions::default()
    };
    TestServer::new(build_router(AppState::new(settings, &options))).unwrap()
}

#[tokio::test]
async fn test_model_list_is_served_from_cache_while_backend_sleeps() {
    let backend = FakeBackend::default();
    let backend_url = spawn_backend(backend.clone()).await;
    let server = proxy(&backend_url, None);

    let response = server.get("/api/tags").await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(
        response.json::<Value>(),
        json!({"models": [{"name": "llama3"}]})
    );

    backend.asleep.store(true, Ordering::SeqCst);

    let response = server.get("/api/tags").await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(
        response.json::<Value>(),
        json!({"models": [{"name": "llama3"}]})
    );
}

#[tokio::test]
async fn test_chat_is_streamed_with_stream_forced_on() {
    let backend = FakeBackend::default();
    let backend_url = spawn_backend(backend.clone()).await;
    let server = proxy(&backend_url, None);

    let response = server
        .post("/api/chat")
        .json(&json!({
            "model": "llama3",
            "messages": [{"role": "user", "content": "Hello"}],
            "stream": false
        }))
        .await;

    assert_eq!(response.status_code(), 200);
    assert_eq!(
        response.text(),
        "{\"message\":{\"content\":\"He\"},\"done\":false}\n\
         {\"message\":{\"content\":\"llo\"},\"done\":false}\n\
         {\"done\":true}\n"
    );

    let bodies = backend.chat_bodies.lock().unwrap().clone();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["stream"], json!(true));
    assert_eq!(bodies[0]["messages"][0]["content"], json!("Hello"));
}

#[tokio::test]
async fn test_unreachable_backend_returns_waking_and_sends_wake() {
    let wake_backend = FakeBackend::default();
    let wake_base = spawn_backend(wake_backend.clone()).await;
    let backend_url = closed_port_url().await;
    let server = proxy(&backend_url, Some(format!("{wake_base}/wake")));

    let response = server.get("/api/tags").await;

    assert_eq!(response.status_code(), 503);
    assert!(
        response.json::<Value>()["message"]
            .as_str()
            .unwrap()
            .contains("retry")
    );

    // One preventive wake before the request, one reactive wake after the failure
    for _ in 0..100 {
        if wake_backend.wakes.load(Ordering::SeqCst) >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(wake_backend.wakes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_slow_backend_without_wake_url_times_out() {
    let backend = FakeBackend::default();
    let backend_url = spawn_backend(backend).await;
    let server = proxy(&backend_url, None);

    let response = server.get("/api/slow").await;

    assert_eq!(response.status_code(), 504);
    assert!(
        response.json::<Value>()["message"]
            .as_str()
            .unwrap()
            .contains("timeout")
    );
}

#[tokio::test]
async fn test_unreachable_backend_without_wake_url_is_bad_gateway() {
    let backend_url = closed_port_url().await;
    let server = proxy(&backend_url, None);

    let response = server
        .post("/api/show")
        .json(&json!({"model": "llama3"}))
        .await;

    assert_eq!(response.status_code(), 502);
}

#[tokio::test]
async fn test_health_never_reaches_backend() {
    let backend_url = closed_port_url().await;
    let server = proxy(&backend_url, None);

    let response = server.get("/health").await;

    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<Value>(), json!({"status": "healthy"}));
}
