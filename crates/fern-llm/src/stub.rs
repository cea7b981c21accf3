//! In-memory `LlmClient` used by tests and by any crate that needs a
//! deterministic stand-in for the real provider.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use fern_types::{AgentEvent, Message, Part, Role, TokenUsage};
use uuid::Uuid;

use crate::{EventStream, LlmClient, LlmError, SessionHandle, ToolDescriptor};

#[derive(Default)]
pub struct EchoLlmClient {
    sessions: Mutex<HashMap<String, Vec<Message>>>,
}

impl EchoLlmClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LlmClient for EchoLlmClient {
    async fn create_session(&self, _title: Option<&str>) -> Result<SessionHandle, LlmError> {
        let session_id = format!("chat_{}", Uuid::new_v4());
        self.sessions
            .lock()
            .unwrap()
            .insert(session_id.clone(), Vec::new());
        Ok(SessionHandle {
            session_id,
            share_url: None,
        })
    }

    async fn send_prompt(
        &self,
        session_id: &str,
        prompt: &str,
    ) -> Result<EventStream, LlmError> {
        let reply = format!("echo: {prompt}");
        {
            let mut sessions = self.sessions.lock().unwrap();
            let log = sessions
                .get_mut(session_id)
                .ok_or_else(|| LlmError::UnknownSession(session_id.to_string()))?;
            let now = Utc::now();
            log.push(Message {
                id: format!("msg_{}", Uuid::new_v4()),
                session_id: session_id.to_string(),
                role: Role::User,
                time: now,
                parts: vec![Part::Text {
                    text: prompt.to_string(),
                }],
                tokens: None,
            });
            log.push(Message {
                id: format!("msg_{}", Uuid::new_v4()),
                session_id: session_id.to_string(),
                role: Role::Assistant,
                time: now,
                parts: vec![Part::Text {
                    text: reply.clone(),
                }],
                tokens: Some(TokenUsage {
                    input: (prompt.len() / 4) as u32,
                    output: (reply.len() / 4) as u32,
                    reasoning: 0,
                }),
            });
        }

        let events = vec![
            AgentEvent::Text { delta: reply },
            AgentEvent::SessionIdle,
        ];
        Ok(Box::pin(futures::stream::iter(events)))
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>, LlmError> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| LlmError::UnknownSession(session_id.to_string()))
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, LlmError> {
        Ok(vec![])
    }
}
