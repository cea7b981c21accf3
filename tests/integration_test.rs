//! Cross-crate end-to-end scenarios (spec §8). Unlike the per-crate unit
//! suites, these drive the real HTTP router and multiple components
//! together the way a deployed host would see them.

use std::sync::Arc;

use chrono::Utc;
use fern_archive::ArchivalObserver;
use fern_embeddings::StubEmbeddingsClient;
use fern_llm::stub::EchoLlmClient;
use fern_llm::LlmClient;
use fern_memory::{MemoryStore, MemoryType};
use fern_registry::SessionRegistry;
use fern_scheduler::JobScheduler;
use fern_search::SearchEngine;
use fern_storage::Store;
use fern_watchdog::{Watchdog, WatchdogConfig};
use fern_webhook::{AppState, AutoMemoryConfig, ChannelSender, LoggingChannelSender, WebhookConfig};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

async fn harness(config: WebhookConfig) -> (axum::Router, Arc<MemoryStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).await.unwrap();
    let llm: Arc<dyn LlmClient> = Arc::new(EchoLlmClient::new());
    let embeddings = Arc::new(StubEmbeddingsClient::new(8));
    let registry = Arc::new(SessionRegistry::new(store.clone(), llm.clone()));
    let memory = Arc::new(MemoryStore::new(store.clone(), embeddings.clone()));
    let search = Arc::new(SearchEngine::new(store.clone(), embeddings.clone()));
    let archive = Arc::new(ArchivalObserver::new(store.clone(), embeddings, llm.clone(), dir.path()));
    let channel_sender: Arc<dyn ChannelSender> = Arc::new(LoggingChannelSender);
    let watchdog = Arc::new(Watchdog::open(dir.path().join("watchdog-state"), WatchdogConfig::default(), Box::new(|_| {})));
    let state = Arc::new(AppState { store, llm, registry, memory: memory.clone(), search, archive, channel_sender, watchdog, config });
    (fern_webhook::router(state), memory, dir)
}

/// Scenario 1: happy path chat.
#[tokio::test]
async fn happy_path_chat_returns_nonempty_response_with_session_id() {
    let (app, _memory, _dir) = harness(WebhookConfig::default()).await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/chat")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"message":"hi"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let session_id = body["sessionId"].as_str().unwrap();
    assert!(session_id.starts_with("chat_"), "expected a chat_* session id, got: {session_id}");
    assert!(!body["response"].as_str().unwrap().is_empty());
}

/// A channel message should create a thread session, run a turn, and leave
/// that thread visible through the internal dashboard API — the registry,
/// the reasoning loop, and the webhook layer all agreeing on one thread.
#[tokio::test]
async fn channel_message_creates_a_durable_thread_session() {
    let (app, _memory, _dir) = harness(WebhookConfig::default()).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/sms")
                .header("content-type", "application/x-www-form-urlencoded")
                .body(Body::from("From=%2B1555&Body=hello+there"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // The background turn is spawned; give it a beat to land.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let response = app
        .oneshot(Request::builder().uri("/internal/sessions/sms:%2B1555").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

/// Auto-retrieval (spec §6): with a matching memory on file, the augmented
/// prompt that reaches the (echoing) reasoning loop should carry that
/// memory's text ahead of the user's own message.
#[tokio::test]
async fn auto_memory_folds_matching_memory_into_the_prompt() {
    let config = WebhookConfig {
        auto_memory: AutoMemoryConfig { enabled: true, min_relevance: 0.0, ..AutoMemoryConfig::default() },
        ..WebhookConfig::default()
    };
    let (app, memory, _dir) = harness(config).await;
    memory.add(MemoryType::Preference, "the user prefers concise answers", vec![]).await.unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/chat")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"message":"how should you answer me?"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let reply = body["response"].as_str().unwrap();
    assert!(reply.contains("concise answers"), "expected the matching memory folded into the echoed prompt, got: {reply}");
}

/// Scenario 5 (stale claim) composed with scenario 4 (cron next fire): a
/// job left `running` by a simulated crash is recovered to `pending`, and a
/// due recurring job is re-armed for its next cron occurrence after it
/// executes.
#[tokio::test]
async fn scheduler_recovers_stale_jobs_and_rearms_recurring_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).await.unwrap();
    let llm: Arc<dyn LlmClient> = Arc::new(EchoLlmClient::new());
    let scheduler = JobScheduler::new(store.clone(), llm);

    let mut stuck = JobScheduler::schedule_one_shot("orphaned by a crash", Utc::now());
    stuck.status = "running".to_string();
    store.insert_job(stuck.clone()).await.unwrap();

    let recovered = scheduler.recover_stale_jobs().await.unwrap();
    assert_eq!(recovered, 1);
    let pending = store.list_jobs(Some("pending".to_string())).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, stuck.id);

    let recurring = JobScheduler::schedule_recurring(
        "daily digest",
        "0 0 * * * *",
        Utc::now() - chrono::Duration::seconds(1),
        serde_json::json!({}),
    );
    store.insert_job(recurring.clone()).await.unwrap();

    let executed = scheduler.tick().await.unwrap();
    assert_eq!(executed, 2, "both the recovered one-shot and the due recurring job should run");

    let all_pending = store.list_jobs(Some("pending".to_string())).await.unwrap();
    let rearmed = all_pending.iter().find(|j| j.id == recurring.id).expect("recurring job should be re-armed, not completed");
    assert!(rearmed.scheduled_at > recurring.scheduled_at, "recurring job should be re-armed for a future fire");
    assert!(rearmed.last_error.is_none());

    let completed = store.list_jobs(Some("completed".to_string())).await.unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, stuck.id);
}
