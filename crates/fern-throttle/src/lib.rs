//! Status throttler (spec §4.L): coalesces streaming `text`/`thinking`
//! fragments from a turn into throttled status updates, so a channel
//! integration isn't asked to push an edit on every token.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(1500);
const MAX_CHARS: usize = 150;

struct State {
    text: String,
    thinking: String,
    last_flush: Option<Instant>,
    timer_scheduled: bool,
    destroyed: bool,
}

/// `sink` receives each flushed status string; it must not block (typical
/// implementations enqueue onto a channel or edit a message in place).
pub struct StatusThrottler {
    sink: Box<dyn Fn(String) + Send + Sync>,
    min_interval: Duration,
    state: Mutex<State>,
    generation: AtomicU64,
}

impl StatusThrottler {
    pub fn new(sink: impl Fn(String) + Send + Sync + 'static) -> Arc<Self> {
        Self::with_min_interval(sink, DEFAULT_MIN_INTERVAL)
    }

    pub fn with_min_interval(sink: impl Fn(String) + Send + Sync + 'static, min_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            sink: Box::new(sink),
            min_interval,
            state: Mutex::new(State {
                text: String::new(),
                thinking: String::new(),
                last_flush: None,
                timer_scheduled: false,
                destroyed: false,
            }),
            generation: AtomicU64::new(0),
        })
    }

    pub fn append_text(self: &Arc<Self>, delta: &str) {
        {
            let mut state = self.state.lock().unwrap();
            state.text.push_str(delta);
        }
        self.flush_or_schedule();
    }

    pub fn append_thinking(self: &Arc<Self>, delta: &str) {
        {
            let mut state = self.state.lock().unwrap();
            state.thinking.push_str(delta);
        }
        self.flush_or_schedule();
    }

    fn flush_or_schedule(self: &Arc<Self>) {
        let now = Instant::now();
        let (due, remaining) = {
            let state = self.state.lock().unwrap();
            if state.destroyed || state.timer_scheduled {
                return;
            }
            match state.last_flush {
                None => (true, Duration::ZERO),
                Some(last) if now.duration_since(last) >= self.min_interval => (true, Duration::ZERO),
                Some(last) => (false, self.min_interval - now.duration_since(last)),
            }
        };

        if due {
            self.flush();
            return;
        }

        let generation = self.generation.load(Ordering::SeqCst);
        {
            let mut state = self.state.lock().unwrap();
            state.timer_scheduled = true;
        }
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            {
                let mut state = this.state.lock().unwrap();
                state.timer_scheduled = false;
                if state.destroyed || this.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
            }
            this.flush();
        });
    }

    /// Flushes accumulated content immediately, bypassing the interval
    /// check. Safe to call after `destroy()` to drain any remaining
    /// content before discarding the throttler.
    pub fn flush(self: &Arc<Self>) {
        let content = {
            let mut state = self.state.lock().unwrap();
            let content = preferred_content(&state.text, &state.thinking);
            state.text.clear();
            state.thinking.clear();
            state.last_flush = Some(Instant::now());
            content
        };
        if let Some(content) = content {
            (self.sink)(content);
        }
    }

    /// Cancels any pending timer and stops scheduling future flushes.
    /// Content already buffered is not flushed — call `flush()`
    /// afterward if it must not be lost.
    pub fn destroy(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().destroyed = true;
    }
}

fn preferred_content(text: &str, thinking: &str) -> Option<String> {
    let source = if !text.is_empty() { text } else { thinking };
    if source.is_empty() {
        return None;
    }
    Some(truncate_at_boundary(source, MAX_CHARS))
}

fn truncate_at_boundary(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }

    let truncated: String = s.chars().take(max_chars).collect();
    if let Some(idx) = truncated.rfind(['.', '!', '?']) {
        if idx > 0 {
            return truncated[..=idx].to_string();
        }
    }
    if let Some(idx) = truncated.rfind(' ') {
        if idx > 0 {
            return format!("{}…", &truncated[..idx]);
        }
    }
    format!("{truncated}…")
}
