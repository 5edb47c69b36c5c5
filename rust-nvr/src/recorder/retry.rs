//! Per-key retry cooldown tracking.
//!
//! A transient encoder failure earns one delayed restart, but only if the
//! last retry for the same key is older than the cooldown. This is what
//! keeps a flapping camera from turning into a restart storm.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::domain::RecordingKey;

/// Tracks the last retry instant per recording key.
pub struct RetryTracker {
    cooldown: Duration,
    last_retry: Mutex<HashMap<RecordingKey, Instant>>,
}

impl RetryTracker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_retry: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a retry is allowed for this key right now.
    ///
    /// Records the attempt when allowed, so two callers cannot both win
    /// within one cooldown window.
    pub fn try_retry(&self, key: &RecordingKey) -> bool {
        let now = Instant::now();
        let mut last_retry = self.last_retry.lock();
        match last_retry.get(key) {
            Some(last) if now.duration_since(*last) <= self.cooldown => false,
            _ => {
                last_retry.insert(key.clone(), now);
                true
            }
        }
    }

    /// Forget a key after a successful recording.
    pub fn clear(&self, key: &RecordingKey) {
        self.last_retry.lock().remove(key);
    }
}
