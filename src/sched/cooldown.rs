//! Per-key failure cooldown, shared across all channel sets.
//!
//! A credential revocation affects every use of that key regardless of the
//! wire format it was used under, so entries are keyed by the raw API-key
//! string process-wide. This is an advisory pre-filter for key rotation;
//! the circuit breaker lives in [`super::metrics`].

use ahash::AHashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_BASE_RECOVERY: Duration = Duration::from_secs(5 * 60);
const DEFAULT_MAX_FAILURE_COUNT: u32 = 3;

#[derive(Debug, Clone, Copy)]
struct FailedKey {
    first_failure: Instant,
    failures: u32,
}

pub struct KeyCooldownCache {
    inner: Mutex<AHashMap<String, FailedKey>>,
    base_recovery: Duration,
    max_failure_count: u32,
}

impl Default for KeyCooldownCache {
    fn default() -> Self {
        Self::with_policy(DEFAULT_BASE_RECOVERY, DEFAULT_MAX_FAILURE_COUNT)
    }
}

impl KeyCooldownCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(base_recovery: Duration, max_failure_count: u32) -> Self {
        Self {
            inner: Mutex::new(AHashMap::new()),
            base_recovery,
            max_failure_count,
        }
    }

    /// Record (or escalate) a failure for `key`.
    pub fn mark_failed(&self, key: &str) {
        let mut guard = self.inner.lock().expect("cooldown lock poisoned");
        guard
            .entry(key.to_string())
            .and_modify(|entry| entry.failures += 1)
            .or_insert(FailedKey {
                first_failure: Instant::now(),
                failures: 1,
            });
    }

    /// True until the computed recovery deadline passes. Recovery doubles
    /// once the failure count exceeds the configured maximum.
    pub fn is_failed(&self, key: &str) -> bool {
        let guard = self.inner.lock().expect("cooldown lock poisoned");
        let Some(entry) = guard.get(key) else {
            return false;
        };
        entry.first_failure.elapsed() < self.recovery_time(entry.failures)
    }

    /// Drop entries whose recovery deadline has passed. Returns how many
    /// were reclaimed. Driven by a 1-minute tick.
    pub fn sweep(&self) -> usize {
        let mut guard = self.inner.lock().expect("cooldown lock poisoned");
        let before = guard.len();
        guard.retain(|_, entry| entry.first_failure.elapsed() < self.recovery_time(entry.failures));
        let removed = before - guard.len();
        if removed > 0 {
            debug!(removed, "cooldown cache swept");
        }
        removed
    }

    /// Purge entries for keys that no longer exist in any channel, so
    /// deleted channels do not leak cache memory.
    pub fn purge_keys(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        let mut guard = self.inner.lock().expect("cooldown lock poisoned");
        for key in keys {
            guard.remove(key);
        }
    }

    fn recovery_time(&self, failures: u32) -> Duration {
        if failures <= self.max_failure_count {
            self.base_recovery
        } else {
            self.base_recovery * 2
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().expect("cooldown lock poisoned").len()
    }
}
