use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// The three wire dialects the proxy serves. Each set owns its channels,
/// its load-balance knob, its metrics manager and its round-robin cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelSet {
    Messages,
    Responses,
    Gemini,
}

impl ChannelSet {
    pub const ALL: [ChannelSet; 3] = [
        ChannelSet::Messages,
        ChannelSet::Responses,
        ChannelSet::Gemini,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelSet::Messages => "messages",
            ChannelSet::Responses => "responses",
            ChannelSet::Gemini => "gemini",
        }
    }
}

/// Upstream wire protocol; determines conversion and key-injection scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    #[default]
    Claude,
    Openai,
    Gemini,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    #[default]
    Active,
    Suspended,
    Disabled,
}

/// Load-balance knob as written in the config file. `round-robin` and
/// `random` are accepted for backward compatibility but degrade to failover
/// semantics unless at least one channel in the set carries an explicit
/// positive weight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalance {
    #[default]
    Failover,
    RoundRobin,
    Random,
}

/// The strategy the scheduler actually runs after degradation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategy {
    Priority,
    WeightedRandom,
    RoundRobin,
}

/// One configured upstream provider.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub service_type: ServiceType,

    /// Primary base URL; merged in front of `baseUrls` on ingestion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default)]
    pub base_urls: Vec<String>,

    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Request-model → upstream-model rewrite. Exact match first, then
    /// longest-source substring.
    #[serde(default)]
    pub model_mapping: BTreeMap<String, String>,

    /// Smaller is higher; zero means "use the array index".
    #[serde(default)]
    pub priority: u32,

    /// Weighted-random weight; zero or negative draws as 1.
    #[serde(default)]
    pub weight: i64,

    #[serde(default)]
    pub status: ChannelStatus,

    /// Promotion deadline; while in the future this channel overrides the
    /// normal ranking. At most one per set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promotion_until: Option<DateTime<Utc>>,

    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Upstream known to emit placeholder usage; patch aggressively.
    #[serde(default)]
    pub low_quality: bool,
}

impl ChannelConfig {
    /// Ingestion-time cleanup: merge `baseUrl` into `baseUrls`, normalize,
    /// drop unparseable URLs, deduplicate URLs and keys.
    pub fn normalize(&mut self) {
        let name = self.name.clone();
        let mut urls: Vec<String> = Vec::new();
        let mut push_unique = |raw: &str, urls: &mut Vec<String>| {
            let normalized = normalize_base_url(raw);
            if normalized.is_empty() || urls.contains(&normalized) {
                return;
            }
            if url::Url::parse(&normalized).is_err() {
                warn!(channel = %name, url = %normalized, "dropping unparseable base URL");
                return;
            }
            urls.push(normalized);
        };
        if let Some(primary) = self.base_url.take() {
            push_unique(&primary, &mut urls);
        }
        for raw in &self.base_urls {
            push_unique(raw, &mut urls);
        }
        self.base_urls = urls;

        let mut seen_keys: Vec<String> = Vec::new();
        for key in &self.api_keys {
            let trimmed = key.trim();
            if !trimmed.is_empty() && !seen_keys.iter().any(|k| k == trimmed) {
                seen_keys.push(trimmed.to_string());
            }
        }
        self.api_keys = seen_keys;
    }

    pub fn effective_priority(&self, index: usize) -> u32 {
        if self.priority == 0 {
            index as u32
        } else {
            self.priority
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ChannelStatus::Active
    }

    pub fn promotion_active(&self, now: DateTime<Utc>) -> bool {
        self.promotion_until.is_some_and(|until| until > now)
    }

    /// Apply the model mapping: exact match wins, then the longest mapping
    /// source that appears as a substring of the requested model.
    pub fn map_model(&self, model: &str) -> Option<&str> {
        if let Some(mapped) = self.model_mapping.get(model) {
            return Some(mapped.as_str());
        }
        self.model_mapping
            .iter()
            .filter(|(source, _)| model.contains(source.as_str()))
            .max_by_key(|(source, _)| source.len())
            .map(|(_, target)| target.as_str())
    }
}

/// Base URLs are compared after trimming trailing `/` and `#`.
fn normalize_base_url(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(['/', '#'])
        .to_string()
}

/// Scheduler knobs. Every value is validated on read and silently reset to
/// its default when out of range.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    #[serde(default)]
    pub promotion: PromotionConfig,

    #[serde(default)]
    pub affinity: AffinityConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub fallback: FallbackConfig,
}

impl SchedulerConfig {
    pub fn validated(mut self) -> Self {
        if !(self.promotion.max_failure_rate > 0.0 && self.promotion.max_failure_rate <= 1.0) {
            self.promotion.max_failure_rate = default_max_failure_rate();
        }
        self.affinity.ttl_seconds = self.affinity.ttl_seconds.clamp(60, 86_400);
        if !(self.circuit_breaker.threshold > 0.0 && self.circuit_breaker.threshold <= 1.0) {
            self.circuit_breaker.threshold = default_breaker_threshold();
        }
        self.circuit_breaker.min_requests = self.circuit_breaker.min_requests.clamp(1, 1_000);
        self.circuit_breaker.open_timeout_seconds =
            self.circuit_breaker.open_timeout_seconds.clamp(1, 86_400);
        self.circuit_breaker.recovery_threshold =
            self.circuit_breaker.recovery_threshold.clamp(1, 10);
        self.fallback.max_retries = self.fallback.max_retries.min(10);
        self
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub bypass_health_check: bool,

    /// Aggregate failure-rate ceiling for selecting a promoted channel.
    #[serde(default = "default_max_failure_rate")]
    pub max_failure_rate: f64,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bypass_health_check: false,
            max_failure_rate: default_max_failure_rate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AffinityConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Keep affinity only while the pinned channel shares the best healthy
    /// priority; prevents pinning to a lower tier after recovery.
    #[serde(default)]
    pub only_within_same_priority: bool,

    #[serde(default = "default_affinity_ttl", alias = "ttl")]
    pub ttl_seconds: u64,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            only_within_same_priority: false,
            ttl_seconds: default_affinity_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_breaker_threshold")]
    pub threshold: f64,

    #[serde(default = "default_min_requests")]
    pub min_requests: usize,

    #[serde(default = "default_open_timeout", alias = "openTimeout")]
    pub open_timeout_seconds: u64,

    /// Consecutive half-open successes required to close the breaker.
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_breaker_threshold(),
            min_requests: default_min_requests(),
            open_timeout_seconds: default_open_timeout(),
            recovery_threshold: default_recovery_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackConfig {
    /// Order unhealthy fallback candidates by (priority, failure rate)
    /// instead of (failure rate, priority).
    #[serde(default = "default_true")]
    pub priority_first: bool,

    /// Additional channels a single request may fail over to.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            priority_first: true,
            max_retries: default_max_retries(),
        }
    }
}

/// Canonical proxy configuration: the hot-reloaded JSON file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    #[serde(default)]
    pub upstream: Vec<ChannelConfig>,

    #[serde(default)]
    pub responses_upstream: Vec<ChannelConfig>,

    #[serde(default)]
    pub gemini_upstream: Vec<ChannelConfig>,

    #[serde(default)]
    pub load_balance: LoadBalance,

    #[serde(default)]
    pub responses_load_balance: LoadBalance,

    #[serde(default)]
    pub gemini_load_balance: LoadBalance,

    /// Permissive classifier mode: any non-2xx fails over.
    #[serde(default)]
    pub fuzzy_mode_enabled: bool,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl ProxyConfig {
    pub fn channels(&self, set: ChannelSet) -> &[ChannelConfig] {
        match set {
            ChannelSet::Messages => &self.upstream,
            ChannelSet::Responses => &self.responses_upstream,
            ChannelSet::Gemini => &self.gemini_upstream,
        }
    }

    pub fn channels_mut(&mut self, set: ChannelSet) -> &mut Vec<ChannelConfig> {
        match set {
            ChannelSet::Messages => &mut self.upstream,
            ChannelSet::Responses => &mut self.responses_upstream,
            ChannelSet::Gemini => &mut self.gemini_upstream,
        }
    }

    pub fn load_balance(&self, set: ChannelSet) -> LoadBalance {
        match set {
            ChannelSet::Messages => self.load_balance,
            ChannelSet::Responses => self.responses_load_balance,
            ChannelSet::Gemini => self.gemini_load_balance,
        }
    }

    /// Resolve the strategy the scheduler runs for a set, applying the
    /// accept-but-degrade rule for the deprecated knob values.
    pub fn strategy(&self, set: ChannelSet) -> LoadStrategy {
        let has_weights = self.channels(set).iter().any(|c| c.weight > 0);
        match self.load_balance(set) {
            LoadBalance::Failover => LoadStrategy::Priority,
            LoadBalance::RoundRobin if has_weights => LoadStrategy::RoundRobin,
            LoadBalance::Random if has_weights => LoadStrategy::WeightedRandom,
            LoadBalance::RoundRobin | LoadBalance::Random => LoadStrategy::Priority,
        }
    }

    /// Ingestion-time invariants, applied on every load and swap:
    /// URL/key dedup, auto-suspension of keyless channels, promotion
    /// exclusivity (last writer wins), scheduler knob validation.
    pub fn normalize(&mut self) {
        for set in ChannelSet::ALL {
            let channels = self.channels_mut(set);
            for channel in channels.iter_mut() {
                channel.normalize();
                if channel.is_active()
                    && (channel.api_keys.is_empty() || channel.base_urls.is_empty())
                {
                    warn!(
                        channel = %channel.name,
                        set = set.as_str(),
                        "active channel has no usable keys or base URLs, suspending"
                    );
                    channel.status = ChannelStatus::Suspended;
                }
            }

            let now = Utc::now();
            let last_promoted = channels
                .iter()
                .rposition(|c| c.promotion_active(now));
            if let Some(keep) = last_promoted {
                for (idx, channel) in channels.iter_mut().enumerate() {
                    if idx != keep && channel.promotion_active(now) {
                        warn!(
                            channel = %channel.name,
                            set = set.as_str(),
                            "clearing competing promotion window"
                        );
                        channel.promotion_until = None;
                    }
                }
            }
        }
        self.scheduler = self.scheduler.clone().validated();
    }
}

fn default_true() -> bool {
    true
}

fn default_max_failure_rate() -> f64 {
    0.9
}

fn default_affinity_ttl() -> u64 {
    1_800
}

fn default_breaker_threshold() -> f64 {
    0.5
}

fn default_min_requests() -> usize {
    10
}

fn default_open_timeout() -> u64 {
    900
}

fn default_recovery_threshold() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    3
}
