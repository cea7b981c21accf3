use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use fern_types::FernError;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::signature::{verify_channel_signature, verify_source_control_signature};
use crate::AppState;

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "timestamp": Utc::now().to_rfc3339() }))
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub response: String,
}

pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<impl IntoResponse, FernError> {
    if req.message.trim().is_empty() {
        return Err(FernError::Validation("message must not be empty".to_string()));
    }

    let session_id = match req.session_id {
        Some(id) => id,
        None => {
            state
                .llm
                .create_session(None)
                .await
                .map_err(|e| FernError::Transient(e.to_string()))?
                .session_id
        }
    };

    let prompt = augment_with_memories(&state, None, &req.message).await;
    let response = run_turn_prompt(&state, &session_id, &prompt).await?;

    Ok(Json(ChatResponse { session_id, response }))
}

/// Runs a single turn against the reasoning loop, bounded by
/// `AGENT_TURN_TIMEOUT_MS` when configured.
async fn run_turn_prompt(state: &AppState, session_id: &str, prompt: &str) -> Result<String, FernError> {
    let fut = fern_llm::run_prompt_to_completion(state.llm.as_ref(), session_id, prompt);
    let result = match state.config.turn_timeout {
        Some(budget) => {
            let started = std::time::Instant::now();
            match tokio::time::timeout(budget, fut).await {
                Ok(result) => result.map_err(|e| FernError::Transient(e.to_string())),
                Err(_) => Err(FernError::Timeout { elapsed_ms: started.elapsed().as_millis() as u64 }),
            }
        }
        None => fut.await.map_err(|e| FernError::Transient(e.to_string())),
    };
    if result.is_err() {
        state.watchdog.record_llm_failure();
    }
    result
}

/// Folds the top-scoring persistent memories relevant to `message` into the
/// prompt sent to the reasoning loop (spec §6 "Auto-retrieval"). A no-op
/// when disabled or when nothing clears `min_relevance`.
async fn augment_with_memories(state: &AppState, thread_id: Option<&str>, message: &str) -> String {
    let policy = &state.config.auto_memory;
    if !policy.enabled {
        return message.to_string();
    }

    let options = fern_search::SearchOptions {
        thread_id: if policy.thread_scoped { thread_id.map(str::to_string) } else { None },
        limit: policy.top_k.min(10),
        min_score: policy.min_relevance.clamp(0.0, 1.0),
    };

    let hits = match state.search.search(message, options).await {
        Ok(hits) => hits,
        Err(err) => {
            tracing::warn!(error = %err, "auto-memory search failed, proceeding without context");
            return message.to_string();
        }
    };

    let mut context = String::new();
    for hit in hits.into_iter().filter(|h| h.source == fern_search::Source::Memory) {
        if context.chars().count() + hit.text.chars().count() > policy.max_chars {
            break;
        }
        if !context.is_empty() {
            context.push('\n');
        }
        context.push_str("- ");
        context.push_str(&hit.text);
    }

    if context.is_empty() {
        message.to_string()
    } else {
        format!("Relevant memories:\n{context}\n\n{message}")
    }
}

#[derive(Debug, Deserialize)]
pub struct ChannelForm {
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "Body")]
    pub body: String,
}

const CHANNEL_SIGNATURE_HEADER: &str = "x-webhook-signature";

pub async fn channel_webhook(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    headers: HeaderMap,
    axum::Form(form): axum::Form<ChannelForm>,
) -> Result<impl IntoResponse, FernError> {
    if form.from.trim().is_empty() || form.body.trim().is_empty() {
        return Err(FernError::Validation("From and Body fields are required".to_string()));
    }

    if let Some(base_url) = &state.config.public_base_url {
        if let Some(secret) = state.config.channel_secret(&channel) {
            let url = format!("{base_url}/webhooks/{channel}");
            let fields = [("From", form.from.as_str()), ("Body", form.body.as_str())];
            let provided = headers
                .get(CHANNEL_SIGNATURE_HEADER)
                .and_then(|v| v.to_str().ok());
            let ok = provided
                .map(|sig| verify_channel_signature(secret, &url, &fields, sig))
                .unwrap_or(false);
            if !ok {
                return Err(FernError::Signature("channel signature mismatch or missing".to_string()));
            }
        }
    }

    if state.config.ignored_senders.contains(&form.from) {
        tracing::debug!(from = %form.from, "ignoring message from filtered sender");
        return Ok((StatusCode::ACCEPTED, Json(json!({ "message": "ignored" }))));
    }

    let thread_id = format!("{channel}:{}", form.from);
    let state = state.clone();
    tokio::spawn(async move {
        if let Err(err) = run_turn(&state, &thread_id, &form.body).await {
            tracing::error!(error = %err, thread_id, "background turn failed");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(json!({ "message": "Processing" }))))
}

pub async fn github_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, FernError> {
    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if let Some(secret) = &state.config.github_secret {
        let provided = headers.get("x-hub-signature-256").and_then(|v| v.to_str().ok());
        let ok = provided
            .map(|sig| verify_source_control_signature(secret, &body, sig))
            .unwrap_or(false);
        if !ok {
            return Err(FernError::Signature("source control signature mismatch or missing".to_string()));
        }
    }

    if event != "push" {
        return Ok((StatusCode::OK, Json(json!({ "message": format!("{event} event ignored") }))));
    }

    let payload: serde_json::Value =
        serde_json::from_slice(&body).map_err(|e| FernError::Validation(e.to_string()))?;
    let git_ref = payload.get("ref").and_then(|v| v.as_str()).unwrap_or("");
    let expected_ref = format!("refs/heads/{}", state.config.github_default_branch);
    if git_ref != expected_ref {
        return Ok((StatusCode::OK, Json(json!({ "message": "push to non-default branch ignored" }))));
    }

    tracing::info!(git_ref, "accepted push to default branch");
    Ok((StatusCode::ACCEPTED, Json(json!({ "message": "Processing" }))))
}

async fn run_turn(state: &Arc<AppState>, thread_id: &str, message: &str) -> Result<(), FernError> {
    let (session_id, _share_url) = state
        .registry
        .get_or_create_session(thread_id, None)
        .await
        .map_err(|e| FernError::Transient(e.to_string()))?;

    let prompt = augment_with_memories(state, Some(thread_id), message).await;
    let result = run_turn_prompt(state, &session_id, &prompt).await;

    match result {
        Ok(_response) => {
            if let Err(err) = state.archive.archive_after_turn(thread_id, &session_id).await {
                tracing::warn!(error = %err, thread_id, "archival pass failed after turn");
            }
            Ok(())
        }
        Err(err) => {
            let notice = channel_error_notice(&err);
            if let Err(send_err) = state.channel_sender.send(thread_id, &notice).await {
                tracing::warn!(error = %send_err, thread_id, "failed to deliver turn error back to the channel");
            }
            Err(err)
        }
    }
}

/// Formats the message sent back over the originating channel when a turn
/// fails (spec §7). Timeouts get their own wording rather than the
/// generic error line.
fn channel_error_notice(err: &FernError) -> String {
    match err {
        FernError::Timeout { .. } => "[Fern] Error: the request took too long. Try again.".to_string(),
        other => format!("[Fern] Error: {other}. Try again."),
    }
}

pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, FernError> {
    let sessions = state
        .store
        .list_thread_sessions()
        .await
        .map_err(|e| FernError::Transient(e.to_string()))?;
    Ok(Json(json!({ "sessions": sessions })))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
) -> Result<impl IntoResponse, FernError> {
    let session = state
        .store
        .get_thread_session(&thread_id)
        .await
        .map_err(|e| FernError::Transient(e.to_string()))?
        .ok_or_else(|| FernError::NotFound(thread_id.clone()))?;
    Ok(Json(json!({ "session": session })))
}

#[derive(Debug, Deserialize)]
pub struct MemoriesQuery {
    #[serde(rename = "type")]
    pub memory_type: Option<String>,
    pub q: Option<String>,
}

pub async fn list_memories(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MemoriesQuery>,
) -> Result<impl IntoResponse, FernError> {
    if let Some(q) = query.q.filter(|q| !q.trim().is_empty()) {
        let hits = state
            .search
            .search(&q, fern_search::SearchOptions { thread_id: None, ..Default::default() })
            .await
            .map_err(|e| FernError::Transient(e.to_string()))?
            .into_iter()
            .filter(|hit| hit.source == fern_search::Source::Memory)
            .collect::<Vec<_>>();
        return Ok(Json(json!({ "memories": hits })));
    }

    let memory_type = query.memory_type.map(|t| fern_memory::MemoryType::parse(&t));
    let memories = state
        .memory
        .list(memory_type, 50)
        .await
        .map_err(|e| FernError::Transient(e.to_string()))?;
    Ok(Json(json!({ "memories": memories })))
}

pub async fn delete_memory(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, FernError> {
    let removed = state.memory.delete(&id).await.map_err(|e| FernError::Transient(e.to_string()))?;
    if !removed {
        return Err(FernError::NotFound(id));
    }
    Ok(Json(json!({ "deleted": id })))
}

pub async fn get_archive(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
) -> Result<impl IntoResponse, FernError> {
    let summaries = state
        .store
        .list_summaries_for_thread(&thread_id)
        .await
        .map_err(|e| FernError::Transient(e.to_string()))?;
    let watermark = state.archive.watermark_for(&thread_id).await;
    Ok(Json(json!({ "chunks": summaries, "watermark": watermark })))
}

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    pub status: Option<String>,
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> Result<impl IntoResponse, FernError> {
    let jobs = state
        .store
        .list_jobs(query.status)
        .await
        .map_err(|e| FernError::Transient(e.to_string()))?;
    Ok(Json(json!({ "jobs": jobs })))
}

pub async fn list_tools(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, FernError> {
    let tools = state
        .llm
        .list_tools()
        .await
        .map_err(|e| FernError::Transient(e.to_string()))?;
    Ok(Json(json!({ "tools": tools })))
}
