//! Trace affinity: pin a logical conversation to a channel index.
//!
//! Backed by a time-to-idle cache, so every lookup refreshes the entry and
//! expired entries are evicted in the background without a bespoke sweeper.

use moka::sync::Cache;
use std::time::Duration;

pub struct TraceAffinity {
    cache: Cache<String, usize>,
}

impl TraceAffinity {
    pub fn new(ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(100_000)
            .time_to_idle(ttl)
            .build();
        Self { cache }
    }

    pub fn set_preferred_channel(&self, user_id: &str, channel_index: usize) {
        if user_id.is_empty() {
            return;
        }
        self.cache.insert(user_id.to_string(), channel_index);
    }

    /// The pinned index, if the entry is still live. Reading refreshes the
    /// idle deadline.
    pub fn get_preferred_channel(&self, user_id: &str) -> Option<usize> {
        if user_id.is_empty() {
            return None;
        }
        self.cache.get(user_id)
    }

    /// Refresh the entry without changing the channel.
    pub fn update_last_used(&self, user_id: &str) {
        let _ = self.get_preferred_channel(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_returns_pinned_index() {
        let affinity = TraceAffinity::new(Duration::from_secs(60));
        affinity.set_preferred_channel("conv-1", 2);
        assert_eq!(affinity.get_preferred_channel("conv-1"), Some(2));
        assert_eq!(affinity.get_preferred_channel("conv-2"), None);

        affinity.set_preferred_channel("conv-1", 0);
        assert_eq!(affinity.get_preferred_channel("conv-1"), Some(0));
    }

    #[test]
    fn empty_user_id_disables_affinity() {
        let affinity = TraceAffinity::new(Duration::from_secs(60));
        affinity.set_preferred_channel("", 1);
        assert_eq!(affinity.get_preferred_channel(""), None);
    }

    #[test]
    fn entries_expire_after_idle_ttl() {
        let affinity = TraceAffinity::new(Duration::from_millis(50));
        affinity.set_preferred_channel("conv-1", 1);

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(affinity.get_preferred_channel("conv-1"), None);
    }

    #[test]
    fn lookups_keep_entries_alive() {
        let affinity = TraceAffinity::new(Duration::from_millis(80));
        affinity.set_preferred_channel("conv-1", 1);

        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(40));
            affinity.update_last_used("conv-1");
        }
        assert_eq!(affinity.get_preferred_channel("conv-1"), Some(1));
    }
}
