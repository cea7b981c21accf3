//! HTTP surface (spec §4.K, §6): channel and source-control webhook
//! ingestion plus the `/internal/*` dashboard read APIs, built on the
//! same router/state conventions the rest of the corpus uses for its
//! model-context-protocol servers.

mod channel;
mod config;
mod handlers;
mod signature;

pub use channel::{ChannelSendError, ChannelSender, LoggingChannelSender, RecordingChannelSender};
pub use config::{AutoMemoryConfig, WebhookConfig};

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use fern_archive::ArchivalObserver;
use fern_llm::LlmClient;
use fern_memory::MemoryStore;
use fern_registry::SessionRegistry;
use fern_search::SearchEngine;
use fern_storage::Store;
use fern_watchdog::Watchdog;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub store: Store,
    pub llm: Arc<dyn LlmClient>,
    pub registry: Arc<SessionRegistry>,
    pub memory: Arc<MemoryStore>,
    pub search: Arc<SearchEngine>,
    pub archive: Arc<ArchivalObserver>,
    pub channel_sender: Arc<dyn ChannelSender>,
    pub watchdog: Arc<Watchdog>,
    pub config: WebhookConfig,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/chat", post(handlers::chat))
        .route("/webhooks/github", post(handlers::github_webhook))
        .route("/webhooks/:channel", post(handlers::channel_webhook))
        .route("/internal/sessions", get(handlers::list_sessions))
        .route("/internal/sessions/:thread_id", get(handlers::get_session))
        .route("/internal/memories", get(handlers::list_memories))
        .route("/internal/memories/:id", delete(handlers::delete_memory))
        .route("/internal/archives/:thread_id", get(handlers::get_archive))
        .route("/internal/jobs", get(handlers::list_jobs))
        .route("/internal/tools", get(handlers::list_tools))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use fern_embeddings::StubEmbeddingsClient;
    use fern_llm::stub::EchoLlmClient;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use tower::ServiceExt;

    async fn test_state(config: WebhookConfig) -> (Router, tempfile::TempDir) {
        let (state, dir) = test_app_state(config).await;
        (router(state), dir)
    }

    async fn test_app_state(config: WebhookConfig) -> (Arc<AppState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let llm: Arc<dyn LlmClient> = Arc::new(EchoLlmClient::new());
        let embeddings = Arc::new(StubEmbeddingsClient::new(8));
        let registry = Arc::new(SessionRegistry::new(store.clone(), llm.clone()));
        let memory = Arc::new(MemoryStore::new(store.clone(), embeddings.clone()));
        let search = Arc::new(SearchEngine::new(store.clone(), embeddings.clone()));
        let archive = Arc::new(ArchivalObserver::new(store.clone(), embeddings, llm.clone(), dir.path()));
        let channel_sender: Arc<dyn ChannelSender> = Arc::new(LoggingChannelSender);
        let watchdog = Arc::new(fern_watchdog::Watchdog::open(
            dir.path().join("watchdog-state"),
            fern_watchdog::WatchdogConfig::default(),
            Box::new(|_| {}),
        ));
        let state = Arc::new(AppState { store, llm, registry, memory, search, archive, channel_sender, watchdog, config });
        (state, dir)
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let (app, _dir) = test_state(WebhookConfig::default()).await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn chat_rejects_empty_message() {
        let (app, _dir) = test_state(WebhookConfig::default()).await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"message":""}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn chat_accepts_nonempty_message() {
        let (app, _dir) = test_state(WebhookConfig::default()).await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chat")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"message":"hello"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn channel_webhook_rejects_missing_fields() {
        let (app, _dir) = test_state(WebhookConfig::default()).await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/sms")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from("From=%2B1555"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn channel_webhook_rejects_bad_signature_when_public_url_configured() {
        let mut config = WebhookConfig::default();
        config.public_base_url = Some("https://fern.example.com".to_string());
        config.channel_secrets.insert("sms".to_string(), "shh".to_string());
        let (app, _dir) = test_state(config).await;

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/sms")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .header("x-webhook-signature", "not-a-real-signature")
                    .body(Body::from("From=%2B1555&Body=hi"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn channel_webhook_accepts_valid_signature() {
        let mut config = WebhookConfig::default();
        config.public_base_url = Some("https://fern.example.com".to_string());
        config.channel_secrets.insert("sms".to_string(), "shh".to_string());
        let (app, _dir) = test_state(config).await;

        let mut mac = Hmac::<Sha256>::new_from_slice(b"shh").unwrap();
        mac.update(b"https://fern.example.com/webhooks/sms");
        mac.update(b"From");
        mac.update(b"+1555");
        mac.update(b"Body");
        mac.update(b"hi");
        let sig = hex::encode(mac.finalize().into_bytes());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/sms")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .header("x-webhook-signature", sig)
                    .body(Body::from("From=%2B1555&Body=hi"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn github_webhook_ignores_non_push_events() {
        let (app, _dir) = test_state(WebhookConfig { github_default_branch: "main".to_string(), ..Default::default() }).await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/github")
                    .header("content-type", "application/json")
                    .header("x-github-event", "issues")
                    .body(Body::from(r#"{"ref":"refs/heads/main"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn github_webhook_accepts_push_to_default_branch() {
        let (app, _dir) = test_state(WebhookConfig { github_default_branch: "main".to_string(), ..Default::default() }).await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/github")
                    .header("content-type", "application/json")
                    .header("x-github-event", "push")
                    .body(Body::from(r#"{"ref":"refs/heads/main"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn github_webhook_ignores_push_to_other_branch() {
        let (app, _dir) = test_state(WebhookConfig { github_default_branch: "main".to_string(), ..Default::default() }).await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/github")
                    .header("content-type", "application/json")
                    .header("x-github-event", "push")
                    .body(Body::from(r#"{"ref":"refs/heads/feature-x"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn internal_jobs_lists_empty_initially() {
        let (app, _dir) = test_state(WebhookConfig::default()).await;
        let response = app
            .oneshot(Request::builder().uri("/internal/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn delete_memory_removes_it_and_repeat_delete_404s() {
        let (state, _dir) = test_app_state(WebhookConfig::default()).await;
        let saved = state.memory.add(fern_memory::MemoryType::Fact, "forget me", vec![]).await.unwrap();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/internal/memories/{}", saved.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/internal/memories/{}", saved.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
