//! Integration tests for the orchestrator HTTP server.

use sentinel_orchestrator::orchestrator::Orchestrator;
use sentinel_orchestrator::server::{self, ServerConfig};
use sentinel_orchestrator::store::{InMemoryModelStore, InMemorySessionStore, InMemoryTrustedContextStore};
use std::sync::Arc;
use std::time::Duration;

fn test_orchestrator() -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(
        Arc::new(InMemorySessionStore::new()),
        Arc::new(InMemoryModelStore::new()),
        Arc::new(InMemoryTrustedContextStore::new()),
    ))
}

async fn spawn() -> (std::net::SocketAddr, tokio::sync::oneshot::Sender<()>) {
    let config = ServerConfig::new("127.0.0.1", 0);
    let (addr, shutdown_tx) = server::run(config, test_orchestrator()).await.expect("server should start");
    tokio::time::sleep(Duration::from_millis(100)).await;
    (addr, shutdown_tx)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (addr, shutdown_tx) = spawn().await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .expect("request should succeed");

    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.expect("response should be JSON");
    assert_eq!(body["status"], "healthy");
    assert!(body["version"].as_str().is_some());

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_cors_headers() {
    let (addr, shutdown_tx) = spawn().await;

    let client = reqwest::Client::new();
    let response = client
        .request(reqwest::Method::OPTIONS, format!("http://{addr}/evaluate"))
        .header("Origin", "http://localhost")
        .header("Access-Control-Request-Method", "POST")
        .send()
        .await
        .expect("preflight request should succeed");

    assert!(
        response.status().is_success() || response.status() == reqwest::StatusCode::NO_CONTENT,
        "CORS preflight failed: {}",
        response.status()
    );

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_stream_keyboard_accepts_batch() {
    let (addr, shutdown_tx) = spawn().await;

    let body = serde_json::json!({
        "session_id": "sess-1",
        "user_id": "user-1",
        "batch_id": 1,
        "events": [
            {"key": "a", "kind": "DOWN", "ts": 0},
            {"key": "a", "kind": "UP", "ts": 80}
        ]
    });

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/stream/keyboard"))
        .json(&body)
        .send()
        .await
        .expect("request should succeed");

    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT, "status: {}", response.status());

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_evaluate_cold_start_challenges() {
    let (addr, shutdown_tx) = spawn().await;

    let body = serde_json::json!({
        "session_id": "sess-cold",
        "eval_id": "eval-1",
        "request_context": {
            "ip_address": "203.0.113.10",
            "user_agent": "Mozilla/5.0",
            "endpoint": "/checkout",
            "method": "POST",
            "user_id": "user-cold"
        },
        "business_context": {
            "service": "checkout",
            "action_type": "purchase",
            "resource_target": "order:123",
            "transaction_details": null
        },
        "role": "customer",
        "mfa_status": "none",
        "session_start_time": 0,
        "client_fingerprint": null
    });

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/evaluate"))
        .json(&body)
        .send()
        .await
        .expect("request should succeed");

    assert!(response.status().is_success(), "status: {}", response.status());
    let parsed: serde_json::Value = response.json().await.expect("response should be JSON");
    assert!(parsed["decision"].is_string());
    assert!(parsed["risk"].is_number());
    assert!(parsed["mode"].is_string());

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_evaluate_rejects_malformed_body() {
    let (addr, shutdown_tx) = spawn().await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/evaluate"))
        .json(&serde_json::json!({"session_id": "sess-bad"}))
        .send()
        .await
        .expect("request should succeed");

    assert!(response.status().is_client_error(), "status: {}", response.status());

    let _ = shutdown_tx.send(());
}
