//! Per-channel ordering of alternative base URLs.
//!
//! Channels with a single base URL bypass this entirely; multi-URL channels
//! get their list re-partitioned on every failure so that URLs whose most
//! recent outcome was a success are tried first.

use crate::config::ChannelConfig;
use ahash::AHashMap;
use std::sync::Mutex;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct UrlState {
    url: String,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
}

impl UrlState {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            last_success: None,
            last_failure: None,
        }
    }

    /// "Preferred" means the most recent outcome was a success, or the URL
    /// has never failed.
    fn preferred(&self) -> bool {
        match (self.last_success, self.last_failure) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(ok), Some(bad)) => ok > bad,
        }
    }
}

#[derive(Default)]
pub struct UrlHealthManager {
    inner: Mutex<AHashMap<String, Vec<UrlState>>>,
}

impl UrlHealthManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The base URLs of `channel` in the order they should be attempted.
    pub fn ordered_urls(&self, channel: &ChannelConfig) -> Vec<String> {
        if channel.base_urls.len() <= 1 {
            return channel.base_urls.clone();
        }
        let mut guard = self.inner.lock().expect("url health lock poisoned");
        let states = guard
            .entry(channel.name.clone())
            .or_insert_with(|| channel.base_urls.iter().map(|u| UrlState::new(u)).collect());
        reconcile(states, &channel.base_urls);
        states.iter().map(|s| s.url.clone()).collect()
    }

    pub fn mark_success(&self, channel_name: &str, url: &str) {
        let mut guard = self.inner.lock().expect("url health lock poisoned");
        if let Some(states) = guard.get_mut(channel_name)
            && let Some(state) = states.iter_mut().find(|s| s.url == url)
        {
            state.last_success = Some(Instant::now());
        }
    }

    /// Record a failure and re-partition: preferred URLs first, stable
    /// within each partition.
    pub fn mark_failure(&self, channel_name: &str, url: &str) {
        let mut guard = self.inner.lock().expect("url health lock poisoned");
        let Some(states) = guard.get_mut(channel_name) else {
            return;
        };
        if let Some(state) = states.iter_mut().find(|s| s.url == url) {
            state.last_failure = Some(Instant::now());
        }
        states.sort_by_key(|s| !s.preferred());
        debug!(channel = channel_name, url, "base URL demoted after failure");
    }

    /// Forget a channel's state after a configuration update.
    pub fn invalidate(&self, channel_name: &str) {
        self.inner
            .lock()
            .expect("url health lock poisoned")
            .remove(channel_name);
    }
}

/// Keep stored state in sync with the configured URL list: drop vanished
/// URLs, append new ones in configured order.
fn reconcile(states: &mut Vec<UrlState>, configured: &[String]) {
    states.retain(|s| configured.iter().any(|u| u == &s.url));
    for url in configured {
        if !states.iter().any(|s| &s.url == url) {
            states.push(UrlState::new(url));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(urls: &[&str]) -> ChannelConfig {
        ChannelConfig {
            name: "multi".to_string(),
            base_urls: urls.iter().map(ToString::to_string).collect(),
            api_keys: vec!["k".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn initial_order_is_configured_order() {
        let mgr = UrlHealthManager::new();
        let ch = channel(&["https://a", "https://b", "https://c"]);
        assert_eq!(mgr.ordered_urls(&ch), vec!["https://a", "https://b", "https://c"]);
    }

    #[test]
    fn failure_rotates_failed_url_behind_healthy_ones() {
        let mgr = UrlHealthManager::new();
        let ch = channel(&["https://a", "https://b", "https://c"]);
        mgr.ordered_urls(&ch);

        mgr.mark_failure("multi", "https://a");
        assert_eq!(mgr.ordered_urls(&ch), vec!["https://b", "https://c", "https://a"]);

        // A later success on the failed URL restores its preference.
        mgr.mark_success("multi", "https://a");
        mgr.mark_failure("multi", "https://b");
        assert_eq!(mgr.ordered_urls(&ch), vec!["https://c", "https://a", "https://b"]);
    }

    #[test]
    fn single_url_channels_bypass_state() {
        let mgr = UrlHealthManager::new();
        let ch = channel(&["https://only"]);
        assert_eq!(mgr.ordered_urls(&ch), vec!["https://only"]);
        mgr.mark_failure("multi", "https://only");
        assert_eq!(mgr.ordered_urls(&ch), vec!["https://only"]);
    }

    #[test]
    fn invalidate_resets_to_configured_order() {
        let mgr = UrlHealthManager::new();
        let ch = channel(&["https://a", "https://b"]);
        mgr.ordered_urls(&ch);
        mgr.mark_failure("multi", "https://a");
        assert_eq!(mgr.ordered_urls(&ch), vec!["https://b", "https://a"]);

        mgr.invalidate("multi");
        assert_eq!(mgr.ordered_urls(&ch), vec!["https://a", "https://b"]);
    }

    #[test]
    fn reconcile_tracks_config_changes() {
        let mgr = UrlHealthManager::new();
        let ch = channel(&["https://a", "https://b"]);
        mgr.ordered_urls(&ch);
        mgr.mark_failure("multi", "https://a");

        let updated = channel(&["https://a", "https://c"]);
        let order = mgr.ordered_urls(&updated);
        assert_eq!(order, vec!["https://a", "https://c"]);
    }
}
