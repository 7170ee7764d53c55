//! Sliding-window outcome metrics and the per-key circuit breaker.
//!
//! One manager per channel set: a quota hit on a key used as a Messages
//! credential must not pollute that key's record as a Responses credential.

use crate::config::{BasicConfig, ChannelConfig, SchedulerConfig};
use ahash::AHashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Tokens, model and cost observed on a successful call. Feeds
/// observability accumulators, never scheduling decisions.
#[derive(Debug, Clone, Default)]
pub struct UsageObservation {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_cents: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsSettings {
    pub window_size: usize,
    pub threshold: f64,
    pub min_requests: usize,
    pub open_timeout: Duration,
    pub recovery_threshold: u32,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            window_size: 10,
            threshold: 0.5,
            min_requests: 10,
            open_timeout: Duration::from_secs(15 * 60),
            recovery_threshold: 1,
        }
    }
}

impl MetricsSettings {
    /// Merge the environment knobs (window size, failure threshold) with
    /// the config file's circuitBreaker section. A file value that was
    /// left at its default defers to the environment.
    pub fn resolve(basic: &BasicConfig, sched: &SchedulerConfig) -> Self {
        let defaults = Self::default();
        let breaker = &sched.circuit_breaker;

        let threshold = if (breaker.threshold - defaults.threshold).abs() > f64::EPSILON {
            breaker.threshold
        } else {
            basic.metrics_failure_threshold
        };
        let min_requests = if breaker.min_requests != defaults.min_requests {
            breaker.min_requests
        } else {
            basic.metrics_window_size
        };

        Self {
            window_size: basic.metrics_window_size,
            threshold,
            min_requests,
            open_timeout: Duration::from_secs(breaker.open_timeout_seconds),
            recovery_threshold: breaker.recovery_threshold,
        }
    }
}

#[derive(Debug, Default)]
struct KeyMetric {
    /// Most recent outcomes, true = success. Capped at `window_size`.
    window: VecDeque<bool>,
    total_success: u64,
    total_failure: u64,
    total_input_tokens: u64,
    total_output_tokens: u64,
    total_cost_cents: f64,
    last_model: Option<String>,
    last_success_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    circuit_broken_at: Option<Instant>,
    half_open_successes: u32,
}

impl KeyMetric {
    fn push_outcome(&mut self, success: bool, window_size: usize) {
        if self.window.len() >= window_size {
            self.window.pop_front();
        }
        self.window.push_back(success);
    }

    fn window_failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64
    }

    fn window_condition(&self, settings: &MetricsSettings) -> bool {
        self.window.len() >= settings.min_requests
            && self.window_failure_rate() >= settings.threshold
    }
}

/// Per-(baseURL, key) metrics for one channel set.
pub struct MetricsManager {
    inner: Mutex<AHashMap<(String, String), KeyMetric>>,
    settings: MetricsSettings,
}

impl MetricsManager {
    pub fn new(settings: MetricsSettings) -> Self {
        Self {
            inner: Mutex::new(AHashMap::new()),
            settings,
        }
    }

    pub fn settings(&self) -> &MetricsSettings {
        &self.settings
    }

    pub fn record_success(&self, url: &str, key: &str, usage: Option<&UsageObservation>) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        let metric = guard.entry(bucket(url, key)).or_default();

        metric.total_success += 1;
        metric.last_success_at = Some(Instant::now());
        if let Some(usage) = usage {
            metric.total_input_tokens += usage.input_tokens;
            metric.total_output_tokens += usage.output_tokens;
            metric.total_cost_cents += usage.cost_cents;
            if !usage.model.is_empty() {
                metric.last_model = Some(usage.model.clone());
            }
        }

        if metric.circuit_broken_at.is_some() {
            // A success while the breaker is armed is a recovery probe,
            // whether it was admitted half-open or via force-probe.
            metric.half_open_successes += 1;
            if metric.half_open_successes >= self.settings.recovery_threshold {
                debug!(url, "circuit closed after successful probe");
                metric.circuit_broken_at = None;
                metric.half_open_successes = 0;
                metric.window.clear();
            }
        }
        metric.push_outcome(true, self.settings.window_size);
    }

    /// Fold stream-completion usage into the bucket without touching the
    /// outcome window; the window entry was recorded when the 2xx arrived.
    pub fn record_usage(&self, url: &str, key: &str, usage: &UsageObservation) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        let metric = guard.entry(bucket(url, key)).or_default();
        metric.total_input_tokens += usage.input_tokens;
        metric.total_output_tokens += usage.output_tokens;
        metric.total_cost_cents += usage.cost_cents;
        if !usage.model.is_empty() {
            metric.last_model = Some(usage.model.clone());
        }
    }

    pub fn record_failure(&self, url: &str, key: &str) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        let metric = guard.entry(bucket(url, key)).or_default();

        metric.total_failure += 1;
        metric.last_failure_at = Some(Instant::now());
        metric.half_open_successes = 0;
        metric.push_outcome(false, self.settings.window_size);

        if metric.window_condition(&self.settings) {
            match metric.circuit_broken_at {
                None => {
                    warn!(url, "circuit opened for key bucket");
                    metric.circuit_broken_at = Some(Instant::now());
                }
                // A failed probe past the open deadline re-arms the timer.
                Some(broken_at) if broken_at.elapsed() >= self.settings.open_timeout => {
                    debug!(url, "probe failed, circuit re-armed");
                    metric.circuit_broken_at = Some(Instant::now());
                }
                Some(_) => {}
            }
        }
    }

    /// Window condition only: total ≥ minRequests and failure rate ≥
    /// threshold. Ignores the open-timeout clock.
    pub fn should_suspend_key(&self, url: &str, key: &str) -> bool {
        let guard = self.inner.lock().expect("metrics lock poisoned");
        guard
            .get(&bucket(url, key))
            .is_some_and(|m| m.window_condition(&self.settings))
    }

    /// The scheduling gate: suspended while the window condition holds and
    /// the breaker is inside its open window. Past the deadline the next
    /// call is admitted half-open.
    pub fn is_suspended(&self, url: &str, key: &str) -> bool {
        let guard = self.inner.lock().expect("metrics lock poisoned");
        let Some(metric) = guard.get(&bucket(url, key)) else {
            return false;
        };
        if !metric.window_condition(&self.settings) {
            return false;
        }
        match metric.circuit_broken_at {
            Some(broken_at) => broken_at.elapsed() < self.settings.open_timeout,
            None => false,
        }
    }

    /// Mean window failure rate over the channel's (url, key) buckets with
    /// at least one recorded outcome. Used only for fallback ordering.
    pub fn channel_failure_rate(&self, channel: &ChannelConfig) -> f64 {
        let guard = self.inner.lock().expect("metrics lock poisoned");
        let mut sum = 0.0;
        let mut counted = 0usize;
        for url in &channel.base_urls {
            for key in &channel.api_keys {
                if let Some(metric) = guard.get(&bucket(url, key))
                    && !metric.window.is_empty()
                {
                    sum += metric.window_failure_rate();
                    counted += 1;
                }
            }
        }
        if counted == 0 { 0.0 } else { sum / counted as f64 }
    }

    /// A channel is healthy iff at least one of its key buckets is not
    /// suspended under the breaker.
    pub fn is_channel_healthy(&self, channel: &ChannelConfig) -> bool {
        if channel.api_keys.is_empty() || channel.base_urls.is_empty() {
            return false;
        }
        let guard = self.inner.lock().expect("metrics lock poisoned");
        for url in &channel.base_urls {
            for key in &channel.api_keys {
                let suspended = guard.get(&bucket(url, key)).is_some_and(|m| {
                    m.window_condition(&self.settings)
                        && m.circuit_broken_at
                            .is_some_and(|at| at.elapsed() < self.settings.open_timeout)
                });
                if !suspended {
                    return true;
                }
            }
        }
        false
    }
}

fn bucket(url: &str, key: &str) -> (String, String) {
    (url.to_string(), key.to_string())
}
