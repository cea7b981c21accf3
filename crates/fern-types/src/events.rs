// Tagged-union event type replacing the untyped event bags the source used
// (spec §9 "Dynamic event objects"). Consumers match on the variant instead
// of probing an arbitrary map for fields that may or may not be present.

use serde::{Deserialize, Serialize};

use crate::message::ToolState;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentEvent {
    ToolStart {
        call_id: String,
        tool: String,
        input: serde_json::Value,
    },
    ToolComplete {
        call_id: String,
        tool: String,
        state: ToolState,
    },
    ToolError {
        call_id: String,
        tool: String,
        error: String,
    },
    Text {
        delta: String,
    },
    Thinking {
        delta: String,
    },
    SessionIdle,
    SessionError {
        message: String,
    },
}
