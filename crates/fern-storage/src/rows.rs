use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSessionRow {
    pub thread_id: String,
    pub session_id: String,
    pub share_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRow {
    pub chunk_id: String,
    pub thread_id: String,
    pub session_id: String,
    pub summary: String,
    pub token_count: i64,
    pub message_count: i64,
    pub first_message_id: String,
    pub last_message_id: String,
    pub first_ts: String,
    pub last_ts: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRow {
    pub id: String,
    pub memory_type: String,
    pub content: String,
    pub tags: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    pub id: String,
    pub job_type: String,
    pub status: String,
    pub prompt: String,
    pub scheduled_at: String,
    pub cron_expr: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub last_run_response: Option<String>,
    pub last_error: Option<String>,
    pub metadata: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: String,
    pub agent_type: String,
    pub status: String,
    pub prompt: String,
    pub parent_session_id: String,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
}
