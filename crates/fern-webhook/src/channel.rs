//! Outbound channel delivery (spec §7): once a background turn finishes
//! (or fails), the result is sent back over the channel its message
//! arrived from. Like the LLM and embeddings black boxes, a real channel
//! integration (SMS, Slack, …) is out of scope here; this defines the
//! seam the webhook layer drives it through and ships a logging stand-in
//! so the host runs without one.

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum ChannelSendError {
    #[error("channel send failed: {0}")]
    Provider(String),
}

#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Sends `text` back over the channel that owns `thread_id` (e.g.
    /// `"sms:+1555"`).
    async fn send(&self, thread_id: &str, text: &str) -> Result<(), ChannelSendError>;
}

/// Logs what would have been sent instead of calling out to a provider.
pub struct LoggingChannelSender;

#[async_trait]
impl ChannelSender for LoggingChannelSender {
    async fn send(&self, thread_id: &str, text: &str) -> Result<(), ChannelSendError> {
        tracing::info!(thread_id, text, "channel send (stub)");
        Ok(())
    }
}

/// Records every send in memory instead of delivering it; used by tests
/// that need to assert on what the host would have said back to a channel.
#[derive(Default)]
pub struct RecordingChannelSender {
    sent: std::sync::Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ChannelSender for RecordingChannelSender {
    async fn send(&self, thread_id: &str, text: &str) -> Result<(), ChannelSendError> {
        self.sent.lock().unwrap().push((thread_id.to_string(), text.to_string()));
        Ok(())
    }
}

impl RecordingChannelSender {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}
