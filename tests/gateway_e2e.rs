//! End-to-end scenarios against a fully-wired [`AppState`] and router,
//! with a real mock upstream bound on a loopback port, mirroring the
//! teacher's `openai_chat_forward.rs` real-listener style.
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use model_gateway::config::AppConfig;
use model_gateway::state::AppState;
use model_gateway::store::memory::{
    AlwaysSucceedsBilling, AlwaysSufficientBalance, MemoryKeyValueStore, MemoryRelationalStore,
    MemoryUserDirectory, NullSearchLogSink,
};
use model_gateway::store::model_types::{ApiKey, Channel, ChannelBinding, EntityStatus, Model};
use serde_json::{json, Value};

async fn spawn_mock_upstream() -> String {
    let router = Router::new()
        .route(
            "/v1/models",
            get(|| async { Json(json!({"object": "list", "data": []})) }),
        )
        .route(
            "/v1/chat/completions",
            axum::routing::post(echo_chat_completion),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("mock upstream serve");
    });
    format!("http://{addr}")
}

async fn echo_chat_completion(Json(body): Json<Value>) -> Json<Value> {
    let _ = body;
    Json(json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello back"}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
    }))
}

async fn build_gateway(upstream_base: &str) -> (String, Arc<AppState>) {
    let relational = Arc::new(MemoryRelationalStore::new());
    relational.seed_api_key(ApiKey {
        id: "sk-test".to_string(),
        creator: "user-1".to_string(),
        status: EntityStatus::Active,
        last_used_at: 0,
    });
    relational.seed_model(Model {
        id: 1,
        name: "gpt-4o-mini".to_string(),
        status: EntityStatus::Active,
    });
    relational.seed_channel(Channel {
        id: 1,
        name: "mock".to_string(),
        upstream_url: upstream_base.to_string(),
        upstream_secret: "upstream-secret".to_string(),
        status: EntityStatus::Active,
        health: 1,
        model_redirect_json: String::new(),
    });
    relational.seed_binding(ChannelBinding { channel_id: 1, model_id: 1 });

    let state = Arc::new(AppState::new(
        AppConfig::default(),
        Arc::new(MemoryKeyValueStore::new()),
        relational,
        Arc::new(AlwaysSufficientBalance),
        Arc::new(AlwaysSucceedsBilling),
        Arc::new(MemoryUserDirectory::new()),
        Arc::new(NullSearchLogSink),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind gateway");
    let addr = listener.local_addr().expect("local addr");
    let router = model_gateway::proxy::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("gateway serve");
    });

    (format!("http://{addr}"), state)
}

#[tokio::test]
async fn chat_completion_round_trips_through_a_healthy_channel() {
    let upstream = spawn_mock_upstream().await;
    let (gateway, _state) = build_gateway(&upstream).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{gateway}/v1/chat/completions"))
        .bearer_auth("sk-test")
        .json(&json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .send()
        .await
        .expect("request gateway");

    assert!(response.status().is_success(), "status: {}", response.status());
    assert!(response.headers().contains_key("trace-id"));
    let body: Value = response.json().await.expect("parse json");
    assert_eq!(body["choices"][0]["message"]["content"], "hello back");
}

#[tokio::test]
async fn missing_bearer_token_is_rejected_before_reaching_upstream() {
    let upstream = spawn_mock_upstream().await;
    let (gateway, _state) = build_gateway(&upstream).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{gateway}/v1/chat/completions"))
        .json(&json!({"model": "gpt-4o-mini", "messages": []}))
        .send()
        .await
        .expect("request gateway");

    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.expect("parse json");
    assert_eq!(body["object"], "error");
}

#[tokio::test]
async fn unknown_model_surfaces_a_not_found_error() {
    let upstream = spawn_mock_upstream().await;
    let (gateway, _state) = build_gateway(&upstream).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{gateway}/v1/chat/completions"))
        .bearer_auth("sk-test")
        .json(&json!({"model": "no-such-model", "messages": []}))
        .send()
        .await
        .expect("request gateway");

    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn unrouted_path_returns_the_catch_all_not_found() {
    let upstream = spawn_mock_upstream().await;
    let (gateway, _state) = build_gateway(&upstream).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{gateway}/v1/not-a-real-route"))
        .send()
        .await
        .expect("request gateway");

    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let body: Value = response.json().await.expect("parse json");
    assert_eq!(body["object"], "error");
}

#[tokio::test]
async fn models_endpoint_lists_bound_models_without_auth() {
    let upstream = spawn_mock_upstream().await;
    let (gateway, _state) = build_gateway(&upstream).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{gateway}/v1/models"))
        .send()
        .await
        .expect("request gateway");

    assert!(response.status().is_success());
    let body: Value = response.json().await.expect("parse json");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .expect("data array")
        .iter()
        .map(|m| m["id"].as_str().expect("id string"))
        .collect();
    assert!(ids.contains(&"gpt-4o-mini"));
}
