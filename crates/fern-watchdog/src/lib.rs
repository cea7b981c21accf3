//! Watchdog (spec §4.J): two failure counters guard against crash loops.
//! The scheduler counter lives in memory only — a fresh process starts
//! clean. The LLM counter is persisted to disk so repeated start-up
//! failures across restarts still trip the threshold.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed counter file: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    pub max_llm_failures: u32,
    pub max_scheduler_failures: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            max_llm_failures: 5,
            max_scheduler_failures: 10,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    llm_failures: u32,
}

/// Invoked exactly once, the moment a threshold is first crossed. The
/// callback owns bringing the process down: stop background loops, close
/// the DB, exit.
pub type ShutdownHook = Box<dyn Fn(&str) + Send + Sync>;

pub struct Watchdog {
    path: PathBuf,
    config: WatchdogConfig,
    llm_failures: Mutex<u32>,
    scheduler_failures: AtomicU32,
    on_shutdown: ShutdownHook,
}

impl Watchdog {
    /// Loads the persisted LLM-failure count from `path` (0 if absent or
    /// unreadable) and wires `on_shutdown` to fire the first time either
    /// counter crosses its threshold.
    pub fn open(path: impl Into<PathBuf>, config: WatchdogConfig, on_shutdown: ShutdownHook) -> Self {
        let path = path.into();
        let llm_failures = read_counter(&path).unwrap_or(0);
        Self {
            path,
            config,
            llm_failures: Mutex::new(llm_failures),
            scheduler_failures: AtomicU32::new(0),
            on_shutdown,
        }
    }

    /// Increments the disk-persisted LLM failure counter and returns
    /// whether this call crossed `max_llm_failures`. The counter file is
    /// rewritten whole under the lock so concurrent bumpers serialise.
    pub fn record_llm_failure(&self) -> bool {
        let mut count = self.llm_failures.lock().unwrap();
        *count += 1;
        let crossed = *count >= self.config.max_llm_failures;
        if let Err(err) = write_counter(&self.path, *count) {
            tracing::error!(error = %err, "failed to persist watchdog counter");
        }
        if crossed {
            (self.on_shutdown)(&format!(
                "LLM failure count {} reached threshold {}",
                *count, self.config.max_llm_failures
            ));
        }
        crossed
    }

    pub fn reset_llm_failures(&self) {
        let mut count = self.llm_failures.lock().unwrap();
        *count = 0;
        if let Err(err) = write_counter(&self.path, 0) {
            tracing::error!(error = %err, "failed to persist watchdog counter reset");
        }
    }

    /// Increments the in-memory scheduler failure counter and returns
    /// whether this call crossed `max_scheduler_failures`.
    pub fn record_scheduler_failure(&self) -> bool {
        let count = self.scheduler_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let crossed = count >= self.config.max_scheduler_failures;
        if crossed {
            (self.on_shutdown)(&format!(
                "scheduler failure count {} reached threshold {}",
                count, self.config.max_scheduler_failures
            ));
        }
        crossed
    }

    pub fn reset_scheduler_failures(&self) {
        self.scheduler_failures.store(0, Ordering::SeqCst);
    }

    pub fn llm_failure_count(&self) -> u32 {
        *self.llm_failures.lock().unwrap()
    }

    pub fn scheduler_failure_count(&self) -> u32 {
        self.scheduler_failures.load(Ordering::SeqCst)
    }
}

fn read_counter(path: &Path) -> Result<u32, WatchdogError> {
    let bytes = std::fs::read(path)?;
    let state: PersistedState =
        serde_json::from_slice(&bytes).map_err(|e| WatchdogError::Malformed(e.to_string()))?;
    Ok(state.llm_failures)
}

fn write_counter(path: &Path, llm_failures: u32) -> Result<(), WatchdogError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let state = PersistedState { llm_failures };
    let json = serde_json::to_vec(&state).map_err(|e| WatchdogError::Malformed(e.to_string()))?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn counter_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("fern-watchdog-state")
    }

    #[test]
    fn llm_failures_trip_shutdown_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let tripped = Arc::new(AtomicBool::new(false));
        let tripped2 = tripped.clone();
        let watchdog = Watchdog::open(
            counter_path(&dir),
            WatchdogConfig { max_llm_failures: 3, max_scheduler_failures: 10 },
            Box::new(move |_reason| tripped2.store(true, Ordering::SeqCst)),
        );

        assert!(!watchdog.record_llm_failure());
        assert!(!watchdog.record_llm_failure());
        assert!(watchdog.record_llm_failure());
        assert!(tripped.load(Ordering::SeqCst));
    }

    #[test]
    fn counter_survives_reopen_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = counter_path(&dir);
        {
            let watchdog = Watchdog::open(&path, WatchdogConfig::default(), Box::new(|_| {}));
            watchdog.record_llm_failure();
            watchdog.record_llm_failure();
        }
        let watchdog = Watchdog::open(&path, WatchdogConfig::default(), Box::new(|_| {}));
        assert_eq!(watchdog.llm_failure_count(), 2);
    }

    #[test]
    fn reset_clears_persisted_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = counter_path(&dir);
        let watchdog = Watchdog::open(&path, WatchdogConfig::default(), Box::new(|_| {}));
        watchdog.record_llm_failure();
        watchdog.reset_llm_failures();
        assert_eq!(watchdog.llm_failure_count(), 0);

        let reopened = Watchdog::open(&path, WatchdogConfig::default(), Box::new(|_| {}));
        assert_eq!(reopened.llm_failure_count(), 0);
    }

    #[test]
    fn scheduler_failures_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = counter_path(&dir);
        let watchdog = Watchdog::open(&path, WatchdogConfig { max_llm_failures: 5, max_scheduler_failures: 2 }, Box::new(|_| {}));
        assert!(!watchdog.record_scheduler_failure());
        assert!(watchdog.record_scheduler_failure());

        let reopened = Watchdog::open(&path, WatchdogConfig::default(), Box::new(|_| {}));
        assert_eq!(reopened.scheduler_failure_count(), 0);
    }
}
