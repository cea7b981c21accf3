use std::collections::{HashMap, HashSet};

/// Auto-retrieval policy (spec §6 "Auto-retrieval"): before a turn is sent
/// to the reasoning loop, the most relevant persistent memories are folded
/// into the prompt as context.
#[derive(Debug, Clone)]
pub struct AutoMemoryConfig {
    pub enabled: bool,
    /// Capped at 10 regardless of configured value.
    pub top_k: usize,
    /// 0..1; hits scoring below this are dropped.
    pub min_relevance: f64,
    pub max_chars: usize,
    /// When true, retrieval is scoped to the calling thread's own memories.
    pub thread_scoped: bool,
}

impl Default for AutoMemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            top_k: 5,
            min_relevance: 0.0,
            max_chars: 2000,
            thread_scoped: false,
        }
    }
}

/// Webhook-facing configuration (spec §6 "Environment configuration").
#[derive(Debug, Clone, Default)]
pub struct WebhookConfig {
    /// Signature checks against the channel webhook only apply once a
    /// public URL is configured — without one the channel has nothing to
    /// sign against, so unsigned local/dev traffic is accepted.
    pub public_base_url: Option<String>,
    /// Per-channel HMAC secret, keyed by the `:channel` path segment.
    pub channel_secrets: HashMap<String, String>,
    pub github_secret: Option<String>,
    pub github_default_branch: String,
    pub ignored_senders: HashSet<String>,
    pub auto_memory: AutoMemoryConfig,
    /// Per-turn budget (spec §6 `AGENT_TURN_TIMEOUT_MS`). `None` disables
    /// the timeout.
    pub turn_timeout: Option<std::time::Duration>,
}

impl WebhookConfig {
    pub fn channel_secret(&self, channel: &str) -> Option<&str> {
        self.channel_secrets.get(channel).map(String::as_str)
    }
}
