//! The LLM reasoning loop is treated as a black box (spec §1 "Out of
//! scope"): prompts go in, tokenised events come out. This crate defines the
//! narrow interface Fern drives it through and ships an in-memory stub
//! (`EchoLlmClient`) so every other crate can be tested without a live model.

use async_trait::async_trait;
use fern_types::{AgentEvent, Message};
use std::pin::Pin;

pub mod stub;

pub type EventStream = Pin<Box<dyn futures::Stream<Item = AgentEvent> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("provider error: {0}")]
    Provider(String),
}

/// Describes a tool the model may call, as reported by `list_tools`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
}

/// A freshly created or resumed reasoning session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: String,
    /// Present when the provider exposes a web URL for this session
    /// (e.g. a shareable transcript link).
    pub share_url: Option<String>,
}

/// The five operations the agent host drives the LLM black box through.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn create_session(
        &self,
        title: Option<&str>,
    ) -> Result<SessionHandle, LlmError>;

    /// Send a prompt into an existing session and stream back the turn's
    /// events. The stream ends (naturally) when the turn completes.
    async fn send_prompt(
        &self,
        session_id: &str,
        prompt: &str,
    ) -> Result<EventStream, LlmError>;

    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>, LlmError>;

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, LlmError>;
}

/// Drains a turn's event stream into its final assistant text. Used by
/// callers (the scheduler, the sub-agent executor) that invoke the
/// reasoning loop as a single request/response step rather than streaming
/// progress back to a channel.
pub async fn run_prompt_to_completion(
    llm: &dyn LlmClient,
    session_id: &str,
    prompt: &str,
) -> Result<String, LlmError> {
    use futures::StreamExt;

    let mut stream = llm.send_prompt(session_id, prompt).await?;
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event {
            AgentEvent::Text { delta } => text.push_str(&delta),
            AgentEvent::SessionError { message } => return Err(LlmError::Provider(message)),
            _ => {}
        }
    }
    Ok(text)
}
