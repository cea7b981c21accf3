// Wire types for the conversation the LLM client owns (spec §3 "Message").
//
// Fern never mutates these — the LLM client is the sole writer. Every other
// component (tokeniser, archival observer, hybrid search) treats `Message`
// as a read-only view handed back from `list_messages`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolTime {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolState {
    pub status: ToolStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub time: ToolTime,
}

/// One piece of a message's content. A message's `parts` form an ordered
/// sequence; tool parts carry their own lifecycle state independent of the
/// message's own timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text { text: String },
    Tool { tool: String, state: ToolState },
    Reasoning { text: String },
    StepStart,
    StepFinish,
}

impl Part {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Per-message token accounting, when the LLM client reports it directly.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u32,
    pub output: u32,
    pub reasoning: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input + self.output + self.reasoning
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub time: DateTime<Utc>,
    pub parts: Vec<Part>,
    pub tokens: Option<TokenUsage>,
}

impl Message {
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("")
    }
}
