//! Upstream scheduling: channel selection, failover support state, and the
//! per-key circuit breaker.
//!
//! The scheduler is synchronous and lock-scoped: every decision works on a
//! deep-copied config snapshot, takes one component lock at a time, and is
//! never held across an upstream call.

mod affinity;
mod cooldown;
mod metrics;
mod url_health;

pub use affinity::TraceAffinity;
pub use cooldown::KeyCooldownCache;
pub use metrics::{MetricsManager, MetricsSettings, UsageObservation};
pub use url_health::UrlHealthManager;

use crate::config::{
    BasicConfig, ChannelConfig, ChannelSet, ConfigStore, LoadStrategy, SwapDiff,
};
use crate::error::ProxyError;
use chrono::Utc;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Why a channel was chosen; logged and attached to responses for
/// dashboard attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    PromotionPriority,
    TraceAffinity,
    PriorityOrder,
    WeightedRandom,
    RoundRobin,
    Fallback,
}

impl SelectionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SelectionReason::PromotionPriority => "promotion_priority",
            SelectionReason::TraceAffinity => "trace_affinity",
            SelectionReason::PriorityOrder => "priority_order",
            SelectionReason::WeightedRandom => "weighted_random",
            SelectionReason::RoundRobin => "round_robin",
            SelectionReason::Fallback => "fallback",
        }
    }
}

/// A chosen channel: its index within the set, a deep copy of its config,
/// and the reason tag.
#[derive(Debug, Clone)]
pub struct Selected {
    pub index: usize,
    pub channel: ChannelConfig,
    pub reason: SelectionReason,
}

/// A key admitted for the next attempt. `via_force_probe` marks keys that
/// passed only because every key of the channel was breaker-open.
#[derive(Debug, Clone)]
pub struct KeyPick {
    pub key: String,
    pub via_force_probe: bool,
}

struct SetState {
    metrics: MetricsManager,
    /// Original index of the last round-robin choice; `usize::MAX` = none.
    rr_cursor: AtomicUsize,
}

pub struct ChannelScheduler {
    store: Arc<ConfigStore>,
    messages: SetState,
    responses: SetState,
    gemini: SetState,
    cooldown: KeyCooldownCache,
    url_health: UrlHealthManager,
    affinity: TraceAffinity,
}

impl ChannelScheduler {
    pub fn new(store: Arc<ConfigStore>, basic: &BasicConfig) -> Self {
        let sched_cfg = store.scheduler();
        let settings = MetricsSettings::resolve(basic, &sched_cfg);
        let set_state = || SetState {
            metrics: MetricsManager::new(settings),
            rr_cursor: AtomicUsize::new(usize::MAX),
        };
        Self {
            store,
            messages: set_state(),
            responses: set_state(),
            gemini: set_state(),
            cooldown: KeyCooldownCache::new(),
            url_health: UrlHealthManager::new(),
            affinity: TraceAffinity::new(Duration::from_secs(sched_cfg.affinity.ttl_seconds)),
        }
    }

    fn set_state(&self, set: ChannelSet) -> &SetState {
        match set {
            ChannelSet::Messages => &self.messages,
            ChannelSet::Responses => &self.responses,
            ChannelSet::Gemini => &self.gemini,
        }
    }

    pub fn metrics(&self, set: ChannelSet) -> &MetricsManager {
        &self.set_state(set).metrics
    }

    pub fn cooldown(&self) -> &KeyCooldownCache {
        &self.cooldown
    }

    pub fn url_health(&self) -> &UrlHealthManager {
        &self.url_health
    }

    pub fn affinity(&self) -> &TraceAffinity {
        &self.affinity
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Select a channel for a request. Deterministic cascade:
    /// promotion → affinity → healthy candidates under the load-balance
    /// strategy → unhealthy fallback → error.
    pub fn select_channel(
        &self,
        user_id: &str,
        failed_channels: &HashSet<usize>,
        set: ChannelSet,
    ) -> Result<Selected, ProxyError> {
        let cfg = self.store.snapshot();
        let sched = cfg.scheduler.clone().validated();
        let channels = cfg.channels(set);
        let metrics = self.metrics(set);

        let mut active: Vec<(usize, &ChannelConfig)> = channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_active())
            .collect();
        if active.is_empty() {
            return Err(ProxyError::NoChannelAvailable);
        }
        active.sort_by_key(|(idx, c)| (c.effective_priority(*idx), *idx));

        // Promotion window: the unique future-deadline channel overrides
        // ranking while its aggregate failure rate stays acceptable.
        if sched.promotion.enabled {
            let now = Utc::now();
            if let Some(&(idx, channel)) = active
                .iter()
                .find(|(idx, c)| c.promotion_active(now) && !failed_channels.contains(idx))
            {
                let rate = metrics.channel_failure_rate(channel);
                let rate_ok = rate <= sched.promotion.max_failure_rate;
                let health_ok = sched.promotion.bypass_health_check
                    || (!channel.api_keys.is_empty() && metrics.is_channel_healthy(channel));
                if rate_ok && health_ok {
                    info!(
                        set = set.as_str(),
                        channel = %channel.name,
                        failure_rate = rate,
                        "promoted channel selected"
                    );
                    return Ok(Selected {
                        index: idx,
                        channel: channel.clone(),
                        reason: SelectionReason::PromotionPriority,
                    });
                }
                debug!(
                    set = set.as_str(),
                    channel = %channel.name,
                    failure_rate = rate,
                    "promoted channel too unhealthy, falling through"
                );
            }
        }

        let healthy: Vec<(usize, &ChannelConfig)> = active
            .iter()
            .filter(|(idx, c)| {
                !failed_channels.contains(idx)
                    && !c.api_keys.is_empty()
                    && metrics.is_channel_healthy(c)
            })
            .copied()
            .collect();

        // Trace affinity: keep a conversation on its channel while healthy.
        if sched.affinity.enabled
            && !user_id.is_empty()
            && let Some(preferred) = self.affinity.get_preferred_channel(user_id)
            && let Some(&(idx, channel)) = healthy.iter().find(|(i, _)| *i == preferred)
        {
            let same_tier = !sched.affinity.only_within_same_priority
                || healthy
                    .first()
                    .is_some_and(|(bi, bc)| {
                        bc.effective_priority(*bi) == channel.effective_priority(idx)
                    });
            if same_tier {
                return Ok(Selected {
                    index: idx,
                    channel: channel.clone(),
                    reason: SelectionReason::TraceAffinity,
                });
            }
        }

        // Healthy candidates, truncated to the first priority group.
        if let Some(&(first_idx, first_channel)) = healthy.first() {
            let group_priority = first_channel.effective_priority(first_idx);
            let group: Vec<(usize, &ChannelConfig)> = healthy
                .iter()
                .take_while(|(i, c)| c.effective_priority(*i) == group_priority)
                .copied()
                .collect();

            let (index, channel, reason) = match cfg.strategy(set) {
                LoadStrategy::Priority => {
                    (first_idx, first_channel, SelectionReason::PriorityOrder)
                }
                LoadStrategy::WeightedRandom => {
                    let (idx, ch) = weighted_pick(&group);
                    (idx, ch, SelectionReason::WeightedRandom)
                }
                LoadStrategy::RoundRobin => {
                    let (idx, ch) = self.round_robin_pick(set, &group);
                    (idx, ch, SelectionReason::RoundRobin)
                }
            };
            return Ok(Selected {
                index,
                channel: channel.clone(),
                reason,
            });
        }

        // Admission of defeat: no healthy candidate. Order the remaining
        // unfailed active channels and hand back the least-bad one.
        let mut rest: Vec<(usize, &ChannelConfig, f64)> = active
            .iter()
            .filter(|(idx, c)| !failed_channels.contains(idx) && !c.api_keys.is_empty())
            .map(|&(idx, c)| (idx, c, metrics.channel_failure_rate(c)))
            .collect();
        if rest.is_empty() {
            return Err(ProxyError::NoChannelAvailable);
        }
        if sched.fallback.priority_first {
            rest.sort_by(|a, b| {
                a.1.effective_priority(a.0)
                    .cmp(&b.1.effective_priority(b.0))
                    .then(a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
                    .then(a.0.cmp(&b.0))
            });
        } else {
            rest.sort_by(|a, b| {
                a.2.partial_cmp(&b.2)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.1.effective_priority(a.0).cmp(&b.1.effective_priority(b.0)))
                    .then(a.0.cmp(&b.0))
            });
        }
        let (index, channel, rate) = rest[0];
        warn!(
            set = set.as_str(),
            channel = %channel.name,
            failure_rate = rate,
            "no healthy channel, falling back"
        );
        Ok(Selected {
            index,
            channel: channel.clone(),
            reason: SelectionReason::Fallback,
        })
    }

    fn round_robin_pick<'a>(
        &self,
        set: ChannelSet,
        group: &[(usize, &'a ChannelConfig)],
    ) -> (usize, &'a ChannelConfig) {
        let cursor = &self.set_state(set).rr_cursor;
        loop {
            let last = cursor.load(Ordering::SeqCst);
            let pos = group
                .iter()
                .position(|(idx, _)| *idx > last)
                .unwrap_or(0);
            let (idx, channel) = group[pos];
            if cursor
                .compare_exchange(last, idx, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return (idx, channel);
            }
        }
    }

    /// Pick the next admissible key for `(channel, base_url)`.
    ///
    /// Skip order: per-request failed set, cooldown cache, breaker gate.
    /// When every key of the channel is gated, `allow_force_probe` lets
    /// exactly one through so the breaker cannot black-hole the channel.
    pub fn next_api_key(
        &self,
        set: ChannelSet,
        channel: &ChannelConfig,
        base_url: &str,
        failed_keys: &HashSet<String>,
        allow_force_probe: bool,
    ) -> Option<KeyPick> {
        let metrics = self.metrics(set);
        let force_probe = allow_force_probe
            && !channel.api_keys.is_empty()
            && channel
                .api_keys
                .iter()
                .all(|key| metrics.is_suspended(base_url, key));

        for key in &channel.api_keys {
            if failed_keys.contains(key) || self.cooldown.is_failed(key) {
                continue;
            }
            let gated = metrics.is_suspended(base_url, key);
            if gated && !force_probe {
                continue;
            }
            if gated {
                warn!(url = base_url, "force-probing a breaker-open key");
            }
            return Some(KeyPick {
                key: key.clone(),
                via_force_probe: gated,
            });
        }
        None
    }

    pub fn on_upstream_success(
        &self,
        set: ChannelSet,
        channel: &ChannelConfig,
        base_url: &str,
        key: &str,
        usage: Option<&UsageObservation>,
    ) {
        self.metrics(set).record_success(base_url, key, usage);
        self.url_health.mark_success(&channel.name, base_url);
    }

    pub fn on_upstream_failure(
        &self,
        set: ChannelSet,
        channel: &ChannelConfig,
        base_url: &str,
        key: &str,
        mark_cooldown: bool,
    ) {
        self.metrics(set).record_failure(base_url, key);
        self.url_health.mark_failure(&channel.name, base_url);
        if mark_cooldown {
            self.cooldown.mark_failed(key);
        }
    }

    /// Purge caches invalidated by a config swap.
    pub fn apply_swap_diff(&self, diff: &SwapDiff) {
        self.cooldown.purge_keys(&diff.removed_keys);
        for channel_name in &diff.changed_channels {
            self.url_health.invalidate(channel_name);
        }
    }

    /// Spawn the 1-minute cooldown sweeper, joined on the store's close.
    pub fn spawn_cooldown_sweeper(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        let mut shutdown_rx = self.store.shutdown_signal();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        scheduler.cooldown.sweep();
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        self.store.add_worker(handle);
    }
}

fn weighted_pick<'a>(group: &[(usize, &'a ChannelConfig)]) -> (usize, &'a ChannelConfig) {
    let weight_of = |c: &ChannelConfig| -> u64 {
        if c.weight <= 0 { 1 } else { c.weight as u64 }
    };
    let total = group
        .iter()
        .fold(0u64, |acc, (_, c)| acc.saturating_add(weight_of(c)));
    let mut draw = rand::rng().random_range(0..total.max(1));
    for &(idx, channel) in group {
        let w = weight_of(channel);
        if draw < w {
            return (idx, channel);
        }
        draw -= w;
    }
    group[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelStatus, ProxyConfig, LoadBalance};
    use chrono::Duration as ChronoDuration;

    fn channel(name: &str, priority: u32, keys: &[&str]) -> ChannelConfig {
        ChannelConfig {
            name: name.to_string(),
            priority,
            base_urls: vec![format!("https://{name}.example.com")],
            api_keys: keys.iter().map(ToString::to_string).collect(),
            ..Default::default()
        }
    }

    fn scheduler_with(cfg: ProxyConfig) -> ChannelScheduler {
        let store = Arc::new(ConfigStore::new(cfg));
        ChannelScheduler::new(store, &BasicConfig::default())
    }

    fn no_failed() -> HashSet<usize> {
        HashSet::new()
    }

    /// Drive a channel's only (url, key) bucket to the given window shape.
    fn record_window(
        sched: &ChannelScheduler,
        set: ChannelSet,
        channel: &ChannelConfig,
        failures: usize,
        successes: usize,
    ) {
        let url = &channel.base_urls[0];
        let key = &channel.api_keys[0];
        for _ in 0..failures {
            sched.metrics(set).record_failure(url, key);
        }
        for _ in 0..successes {
            sched.metrics(set).record_success(url, key, None);
        }
    }

    #[test]
    fn empty_or_inactive_sets_yield_no_channel() {
        let sched = scheduler_with(ProxyConfig::default());
        let err = sched
            .select_channel("", &no_failed(), ChannelSet::Messages)
            .unwrap_err();
        assert!(matches!(err, ProxyError::NoChannelAvailable));

        let mut disabled = channel("dead", 1, &["k"]);
        disabled.status = ChannelStatus::Disabled;
        let mut suspended = channel("paused", 1, &["k"]);
        suspended.status = ChannelStatus::Suspended;
        let sched = scheduler_with(ProxyConfig {
            upstream: vec![disabled, suspended],
            ..Default::default()
        });
        assert!(matches!(
            sched.select_channel("", &no_failed(), ChannelSet::Messages),
            Err(ProxyError::NoChannelAvailable)
        ));
    }

    #[test]
    fn priority_order_picks_smallest_priority_then_index() {
        let sched = scheduler_with(ProxyConfig {
            upstream: vec![
                channel("second", 2, &["k"]),
                channel("first", 1, &["k"]),
                channel("also-second", 2, &["k"]),
            ],
            ..Default::default()
        });
        let selected = sched
            .select_channel("", &no_failed(), ChannelSet::Messages)
            .expect("select");
        assert_eq!(selected.channel.name, "first");
        assert_eq!(selected.reason, SelectionReason::PriorityOrder);
    }

    #[test]
    fn failed_channels_are_skipped() {
        let sched = scheduler_with(ProxyConfig {
            upstream: vec![channel("a", 1, &["k"]), channel("b", 2, &["k"])],
            ..Default::default()
        });
        let failed: HashSet<usize> = [0].into_iter().collect();
        let selected = sched
            .select_channel("", &failed, ChannelSet::Messages)
            .expect("select");
        assert_eq!(selected.index, 1);
        assert_eq!(selected.channel.name, "b");
    }

    #[test]
    fn promotion_overrides_ranking_within_failure_budget() {
        let mut promoted = channel("promoted", 2, &["pk"]);
        promoted.promotion_until = Some(Utc::now() + ChronoDuration::minutes(5));
        let cfg = ProxyConfig {
            upstream: vec![channel("normal", 1, &["nk"]), promoted],
            ..Default::default()
        };
        let sched = scheduler_with(cfg);

        // Aggregate failure rate 0.6 < 0.9 ceiling.
        let promoted_cfg = sched.store.snapshot().upstream[1].clone();
        record_window(&sched, ChannelSet::Messages, &promoted_cfg, 3, 2);

        let selected = sched
            .select_channel("", &no_failed(), ChannelSet::Messages)
            .expect("select");
        assert_eq!(selected.channel.name, "promoted");
        assert_eq!(selected.reason, SelectionReason::PromotionPriority);
    }

    #[test]
    fn promotion_skipped_when_too_unhealthy() {
        let mut promoted = channel("promoted", 2, &["pk"]);
        promoted.promotion_until = Some(Utc::now() + ChronoDuration::minutes(5));
        let cfg = ProxyConfig {
            upstream: vec![channel("normal", 1, &["nk"]), promoted],
            ..Default::default()
        };
        let sched = scheduler_with(cfg);

        let promoted_cfg = sched.store.snapshot().upstream[1].clone();
        record_window(&sched, ChannelSet::Messages, &promoted_cfg, 10, 0);

        let selected = sched
            .select_channel("", &no_failed(), ChannelSet::Messages)
            .expect("select");
        assert_eq!(selected.channel.name, "normal");
        assert_eq!(selected.reason, SelectionReason::PriorityOrder);
    }

    #[test]
    fn affinity_pins_conversations_to_healthy_channels() {
        let sched = scheduler_with(ProxyConfig {
            upstream: vec![channel("a", 1, &["ka"]), channel("b", 2, &["kb"])],
            ..Default::default()
        });

        sched.affinity().set_preferred_channel("conv-1", 1);
        let selected = sched
            .select_channel("conv-1", &no_failed(), ChannelSet::Messages)
            .expect("select");
        assert_eq!(selected.channel.name, "b");
        assert_eq!(selected.reason, SelectionReason::TraceAffinity);

        // Unknown conversation falls back to priority order.
        let selected = sched
            .select_channel("conv-2", &no_failed(), ChannelSet::Messages)
            .expect("select");
        assert_eq!(selected.channel.name, "a");
    }

    #[test]
    fn same_priority_affinity_releases_lower_tier_pins() {
        let mut cfg = ProxyConfig {
            upstream: vec![channel("a", 1, &["ka"]), channel("b", 2, &["kb"])],
            ..Default::default()
        };
        cfg.scheduler.affinity.only_within_same_priority = true;
        let sched = scheduler_with(cfg);

        // Pinned to the lower-priority channel while "a" is healthy again:
        // the pin must not hold.
        sched.affinity().set_preferred_channel("conv-1", 1);
        let selected = sched
            .select_channel("conv-1", &no_failed(), ChannelSet::Messages)
            .expect("select");
        assert_eq!(selected.channel.name, "a");
        assert_eq!(selected.reason, SelectionReason::PriorityOrder);
    }

    #[test]
    fn round_robin_cursor_walks_the_priority_group() {
        let mut cfg = ProxyConfig {
            upstream: vec![
                channel("a", 1, &["ka"]),
                channel("b", 1, &["kb"]),
                channel("c", 1, &["kc"]),
            ],
            load_balance: LoadBalance::RoundRobin,
            ..Default::default()
        };
        // Weights make the deprecated knob value take effect.
        for ch in &mut cfg.upstream {
            ch.weight = 1;
        }
        let sched = scheduler_with(cfg);

        let picks: Vec<String> = (0..6)
            .map(|_| {
                sched
                    .select_channel("", &no_failed(), ChannelSet::Messages)
                    .expect("select")
                    .channel
                    .name
            })
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn deprecated_round_robin_without_weights_degrades_to_priority() {
        let cfg = ProxyConfig {
            upstream: vec![channel("a", 1, &["ka"]), channel("b", 1, &["kb"])],
            load_balance: LoadBalance::RoundRobin,
            ..Default::default()
        };
        let sched = scheduler_with(cfg);
        for _ in 0..4 {
            let selected = sched
                .select_channel("", &no_failed(), ChannelSet::Messages)
                .expect("select");
            assert_eq!(selected.channel.name, "a");
            assert_eq!(selected.reason, SelectionReason::PriorityOrder);
        }
    }

    #[test]
    fn weighted_random_tolerates_zero_and_negative_weights() {
        let mut cfg = ProxyConfig {
            upstream: vec![channel("a", 1, &["ka"]), channel("b", 1, &["kb"])],
            load_balance: LoadBalance::Random,
            ..Default::default()
        };
        cfg.upstream[0].weight = -3;
        cfg.upstream[1].weight = 5;
        let sched = scheduler_with(cfg);

        let mut seen = HashSet::new();
        for _ in 0..50 {
            let selected = sched
                .select_channel("", &no_failed(), ChannelSet::Messages)
                .expect("select");
            assert_eq!(selected.reason, SelectionReason::WeightedRandom);
            seen.insert(selected.channel.name.clone());
        }
        // Weight 5 vs effective 1: both should appear over 50 draws.
        assert!(seen.contains("b"));
    }

    #[test]
    fn fallback_returns_least_bad_unfailed_channel() {
        let sched = scheduler_with(ProxyConfig {
            upstream: vec![channel("a", 1, &["ka"]), channel("b", 1, &["kb"])],
            ..Default::default()
        });
        let snapshot = sched.store.snapshot();
        record_window(&sched, ChannelSet::Messages, &snapshot.upstream[0], 10, 0);
        record_window(&sched, ChannelSet::Messages, &snapshot.upstream[1], 10, 0);

        let selected = sched
            .select_channel("", &no_failed(), ChannelSet::Messages)
            .expect("fallback still selects");
        assert_eq!(selected.reason, SelectionReason::Fallback);
        assert_eq!(selected.channel.name, "a");

        // With "a" already failed this request, fallback moves on.
        let failed: HashSet<usize> = [0].into_iter().collect();
        let selected = sched
            .select_channel("", &failed, ChannelSet::Messages)
            .expect("select");
        assert_eq!(selected.channel.name, "b");
    }

    #[test]
    fn fallback_without_priority_first_orders_by_failure_rate() {
        let mut cfg = ProxyConfig {
            upstream: vec![channel("worse", 1, &["kw"]), channel("better", 2, &["kb"])],
            ..Default::default()
        };
        cfg.scheduler.fallback.priority_first = false;
        let sched = scheduler_with(cfg);
        let snapshot = sched.store.snapshot();
        record_window(&sched, ChannelSet::Messages, &snapshot.upstream[0], 10, 0);
        record_window(&sched, ChannelSet::Messages, &snapshot.upstream[1], 6, 4);

        let selected = sched
            .select_channel("", &no_failed(), ChannelSet::Messages)
            .expect("select");
        assert_eq!(selected.channel.name, "better");
        assert_eq!(selected.reason, SelectionReason::Fallback);
    }

    #[test]
    fn sets_do_not_share_metrics_or_cursors() {
        let cfg = ProxyConfig {
            upstream: vec![channel("m", 1, &["shared-key"])],
            gemini_upstream: vec![channel("g", 1, &["shared-key"])],
            ..Default::default()
        };
        let sched = scheduler_with(cfg);
        let snapshot = sched.store.snapshot();
        record_window(&sched, ChannelSet::Messages, &snapshot.upstream[0], 10, 0);

        // The same key string is fine on the Gemini set.
        assert!(
            sched
                .metrics(ChannelSet::Gemini)
                .is_channel_healthy(&snapshot.gemini_upstream[0])
        );
        let selected = sched
            .select_channel("", &no_failed(), ChannelSet::Gemini)
            .expect("select");
        assert_eq!(selected.channel.name, "g");
        assert_eq!(selected.reason, SelectionReason::PriorityOrder);
    }

    #[test]
    fn next_api_key_skips_failed_cooldown_and_gated_keys() {
        let ch = channel("c", 1, &["k1", "k2", "k3"]);
        let sched = scheduler_with(ProxyConfig {
            upstream: vec![ch.clone()],
            ..Default::default()
        });
        let url = &ch.base_urls[0];

        let mut failed = HashSet::new();
        failed.insert("k1".to_string());
        let pick = sched
            .next_api_key(ChannelSet::Messages, &ch, url, &failed, true)
            .expect("pick");
        assert_eq!(pick.key, "k2");
        assert!(!pick.via_force_probe);

        sched.cooldown().mark_failed("k2");
        let pick = sched
            .next_api_key(ChannelSet::Messages, &ch, url, &failed, true)
            .expect("pick");
        assert_eq!(pick.key, "k3");
    }

    #[test]
    fn force_probe_admits_exactly_one_gated_key() {
        let ch = channel("c", 1, &["k1", "k2", "k3"]);
        let sched = scheduler_with(ProxyConfig {
            upstream: vec![ch.clone()],
            ..Default::default()
        });
        let url = &ch.base_urls[0];
        for key in &ch.api_keys {
            for _ in 0..10 {
                sched.metrics(ChannelSet::Messages).record_failure(url, key);
            }
        }

        // Without the escape hatch the channel is black-holed.
        assert!(
            sched
                .next_api_key(ChannelSet::Messages, &ch, url, &HashSet::new(), false)
                .is_none()
        );

        let mut failed = HashSet::new();
        let pick = sched
            .next_api_key(ChannelSet::Messages, &ch, url, &failed, true)
            .expect("probe admitted");
        assert_eq!(pick.key, "k1");
        assert!(pick.via_force_probe);

        // The probe failed; with force-probe spent, nothing else passes.
        failed.insert(pick.key.clone());
        assert!(
            sched
                .next_api_key(ChannelSet::Messages, &ch, url, &failed, false)
                .is_none()
        );
    }

    #[test]
    fn swap_diff_purges_cooldown_and_url_state() {
        let sched = scheduler_with(ProxyConfig {
            upstream: vec![channel("a", 1, &["k1"])],
            ..Default::default()
        });
        sched.cooldown().mark_failed("k1");
        assert!(sched.cooldown().is_failed("k1"));

        let diff = SwapDiff {
            removed_keys: vec!["k1".to_string()],
            changed_channels: vec!["a".to_string()],
        };
        sched.apply_swap_diff(&diff);
        assert!(!sched.cooldown().is_failed("k1"));
    }
}
