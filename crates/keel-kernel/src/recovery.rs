use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, warn};

/// A failure captured by the recovery layer: a subscriber error or panic,
/// attributed to a stable label like `"subscriber:planner/tool_call_failed"`.
#[derive(Debug, Clone)]
pub struct RecoveredFailure {
    pub label: String,
    pub message: String,
    pub at: SystemTime,
    /// Occurrences of this label within the current time bucket, this
    /// one included.
    pub recurrence: u32,
}

/// Callback invoked for every recovered failure, after counting.
pub type FailureHandler = Arc<dyn Fn(&RecoveredFailure) + Send + Sync>;

/// Catches subscriber errors and panics so one bad handler never takes
/// down the bus, and counts recurrences per (label, time bucket) so
/// repeated failures surface as explicit warnings. No circuit breaking:
/// a failing handler keeps running, it just gets louder in the logs.
pub struct RecoveryManager {
    handlers: RwLock<Vec<FailureHandler>>,
    counters: Mutex<HashMap<(String, u64), u32>>,
    window: Duration,
    threshold: u32,
}

impl RecoveryManager {
    pub fn new(window: Duration, threshold: u32) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            counters: Mutex::new(HashMap::new()),
            window,
            threshold,
        }
    }

    /// Register an additional failure handler. The built-in structured
    /// logging always runs first.
    pub fn on_failure(&self, handler: FailureHandler) {
        self.handlers.write().push(handler);
    }

    /// Run a fallible future, absorbing both `Err` and panics. Returns
    /// the produced value, or `None` after recording the failure.
    pub async fn run_isolated<F, T>(&self, label: &str, fut: F) -> Option<T>
    where
        F: Future<Output = keel_core::Result<T>>,
    {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.record_failure(label, &e.to_string());
                None
            }
            Err(payload) => {
                self.record_failure(label, &format!("panic: {}", panic_message(&payload)));
                None
            }
        }
    }

    /// Count and report a failure.
    pub fn record_failure(&self, label: &str, message: &str) {
        let now = SystemTime::now();
        let bucket = self.bucket(now);
        let recurrence = {
            let mut counters = self.counters.lock();
            // Old buckets are dead weight once their window passes.
            counters.retain(|(_, b), _| *b + 1 >= bucket);
            let count = counters.entry((label.to_string(), bucket)).or_insert(0);
            *count += 1;
            *count
        };

        error!(%label, %message, recurrence, "recovered failure");
        if recurrence == self.threshold {
            warn!(
                %label,
                recurrence,
                window_secs = self.window.as_secs(),
                "failure is recurring within one window"
            );
        }

        let failure = RecoveredFailure {
            label: label.to_string(),
            message: message.to_string(),
            at: now,
            recurrence,
        };
        for handler in self.handlers.read().iter() {
            handler(&failure);
        }
    }

    /// Occurrences of a label in the current bucket.
    pub fn recurrence(&self, label: &str) -> u32 {
        let bucket = self.bucket(SystemTime::now());
        self.counters
            .lock()
            .get(&(label.to_string(), bucket))
            .copied()
            .unwrap_or(0)
    }

    fn bucket(&self, at: SystemTime) -> u64 {
        let epoch_secs = at
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        epoch_secs / self.window.as_secs().max(1)
    }
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), 3)
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
