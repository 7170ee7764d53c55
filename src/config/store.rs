use super::upstream::{ChannelConfig, ChannelSet, LoadStrategy, ProxyConfig, SchedulerConfig};
use crate::error::ProxyError;
use figment::{
    Figment,
    providers::{Format, Json, Serialized},
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a config swap invalidated, for scheduler-side cache purges.
#[derive(Debug, Default)]
pub struct SwapDiff {
    /// API keys present before the swap and gone after it.
    pub removed_keys: Vec<String>,
    /// Channel names whose base-URL list changed or that disappeared.
    pub changed_channels: Vec<String>,
}

pub type SwapHook = Arc<dyn Fn(SwapDiff) + Send + Sync>;

/// Exclusive owner of the canonical proxy configuration.
///
/// Every read hands out a deep copy so callers never race a hot reload;
/// writers replace whole structures instead of mutating live slices.
pub struct ConfigStore {
    inner: RwLock<ProxyConfig>,
    path: Option<PathBuf>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ConfigStore {
    pub fn new(mut config: ProxyConfig) -> Self {
        config.normalize();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: RwLock::new(config),
            path: None,
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Load from the JSON config file (defaults merged underneath).
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ProxyError> {
        let path = path.into();
        let config = load_file(&path)?;
        let mut store = Self::new(config);
        store.path = Some(path);
        Ok(store)
    }

    pub fn snapshot(&self) -> ProxyConfig {
        self.inner.read().expect("config lock poisoned").clone()
    }

    pub fn channels(&self, set: ChannelSet) -> Vec<ChannelConfig> {
        self.inner.read().expect("config lock poisoned").channels(set).to_vec()
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        self.inner
            .read()
            .expect("config lock poisoned")
            .scheduler
            .clone()
            .validated()
    }

    pub fn strategy(&self, set: ChannelSet) -> LoadStrategy {
        self.inner.read().expect("config lock poisoned").strategy(set)
    }

    pub fn fuzzy_mode(&self) -> bool {
        self.inner.read().expect("config lock poisoned").fuzzy_mode_enabled
    }

    /// Persistent tail-move for a quota-flagged key. The per-request
    /// failed-keys set composes with this: transient failures rotate within
    /// a request, chronic quota keys sink across requests.
    pub fn deprioritize_api_key(&self, set: ChannelSet, channel_name: &str, key: &str) -> bool {
        let mut guard = self.inner.write().expect("config lock poisoned");
        let Some(channel) = guard
            .channels_mut(set)
            .iter_mut()
            .find(|c| c.name == channel_name)
        else {
            return false;
        };
        let Some(pos) = channel.api_keys.iter().position(|k| k == key) else {
            return false;
        };
        if pos + 1 == channel.api_keys.len() {
            return false;
        }
        let moved = channel.api_keys.remove(pos);
        channel.api_keys.push(moved);
        info!(
            channel = channel_name,
            set = set.as_str(),
            "quota-flagged key moved to tail of rotation"
        );
        drop(guard);
        self.persist_best_effort();
        true
    }

    /// Set (or clear) a promotion window. Competing future windows in the
    /// same set are cleared; at most one survives.
    pub fn set_promotion(
        &self,
        set: ChannelSet,
        channel_name: &str,
        until: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<(), ProxyError> {
        let mut guard = self.inner.write().expect("config lock poisoned");
        let channels = guard.channels_mut(set);
        if !channels.iter().any(|c| c.name == channel_name) {
            return Err(ProxyError::Config(format!(
                "unknown channel {channel_name:?} in {} set",
                set.as_str()
            )));
        }
        for channel in channels.iter_mut() {
            if channel.name == channel_name {
                channel.promotion_until = until;
            } else if channel.promotion_until.is_some() {
                channel.promotion_until = None;
            }
        }
        Ok(())
    }

    /// Replace the canonical config (hot reload). Returns the diff of
    /// invalidated state so callers can purge caches keyed on the old one.
    pub fn swap(&self, mut next: ProxyConfig) -> SwapDiff {
        next.normalize();
        let mut guard = self.inner.write().expect("config lock poisoned");
        let diff = diff_configs(&guard, &next);
        *guard = next;
        diff
    }

    /// Spawn the file watcher (2 s mtime poll). No-op without a file path.
    pub fn spawn_reload_watcher(self: &Arc<Self>, hook: SwapHook) {
        let Some(path) = self.path.clone() else {
            return;
        };
        let store = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut last_modified = file_mtime(&path).await;
            let mut tick = tokio::time::interval(Duration::from_secs(2));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                let modified = file_mtime(&path).await;
                if modified == last_modified {
                    continue;
                }
                last_modified = modified;
                match load_file(&path) {
                    Ok(next) => {
                        let diff = store.swap(next);
                        info!(
                            removed_keys = diff.removed_keys.len(),
                            changed_channels = diff.changed_channels.len(),
                            "configuration reloaded"
                        );
                        hook(diff);
                    }
                    Err(err) => {
                        warn!("configuration reload failed, keeping previous: {err}");
                    }
                }
            }
            debug!("config reload watcher stopped");
        });
        self.add_worker(handle);
    }

    /// Attach a background worker to this store's lifecycle; joined on
    /// `close`.
    pub fn add_worker(&self, handle: JoinHandle<()>) {
        self.workers.lock().expect("worker list poisoned").push(handle);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Idempotent: the first call signals and joins all background workers,
    /// later calls return immediately.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.workers.lock().expect("worker list poisoned"));
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn persist_best_effort(&self) {
        let Some(path) = self.path.clone() else {
            return;
        };
        let snapshot = self.snapshot();
        tokio::spawn(async move {
            match serde_json::to_vec_pretty(&snapshot) {
                Ok(bytes) => {
                    if let Err(err) = tokio::fs::write(&path, bytes).await {
                        warn!("failed to persist config to {}: {err}", path.display());
                    }
                }
                Err(err) => warn!("failed to serialize config: {err}"),
            }
        });
    }
}

fn load_file(path: &Path) -> Result<ProxyConfig, ProxyError> {
    let mut config: ProxyConfig = Figment::new()
        .merge(Serialized::defaults(ProxyConfig::default()))
        .merge(Json::file(path))
        .extract()
        .map_err(|err| ProxyError::Config(format!("failed to load {}: {err}", path.display())))?;
    config.normalize();
    Ok(config)
}

async fn file_mtime(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

fn diff_configs(old: &ProxyConfig, new: &ProxyConfig) -> SwapDiff {
    let mut old_keys: HashSet<&str> = HashSet::new();
    let mut new_keys: HashSet<&str> = HashSet::new();
    let mut changed_channels = Vec::new();

    for set in ChannelSet::ALL {
        for channel in old.channels(set) {
            old_keys.extend(channel.api_keys.iter().map(String::as_str));
            let counterpart = new.channels(set).iter().find(|c| c.name == channel.name);
            let changed = match counterpart {
                Some(next) => next.base_urls != channel.base_urls,
                None => true,
            };
            if changed && !changed_channels.contains(&channel.name) {
                changed_channels.push(channel.name.clone());
            }
        }
        for channel in new.channels(set) {
            new_keys.extend(channel.api_keys.iter().map(String::as_str));
        }
    }

    let removed_keys = old_keys
        .difference(&new_keys)
        .map(|k| (*k).to_string())
        .collect();

    SwapDiff {
        removed_keys,
        changed_channels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::upstream::ChannelStatus;
    use std::sync::atomic::AtomicUsize;

    fn channel(name: &str, keys: &[&str]) -> ChannelConfig {
        ChannelConfig {
            name: name.to_string(),
            base_urls: vec![format!("https://{name}.example.com")],
            api_keys: keys.iter().map(ToString::to_string).collect(),
            ..Default::default()
        }
    }

    fn store_with(channels: Vec<ChannelConfig>) -> ConfigStore {
        ConfigStore::new(ProxyConfig {
            upstream: channels,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn close_joins_workers_exactly_once() {
        let store = Arc::new(store_with(vec![channel("a", &["k1"])]));
        let exits = Arc::new(AtomicUsize::new(0));

        let mut shutdown_rx = store.shutdown_signal();
        let exits_in_task = Arc::clone(&exits);
        store.add_worker(tokio::spawn(async move {
            let _ = shutdown_rx.changed().await;
            exits_in_task.fetch_add(1, Ordering::SeqCst);
        }));

        store.close().await;
        store.close().await;
        store.close().await;
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn snapshots_are_deep_copies() {
        let store = store_with(vec![channel("a", &["k1", "k2"])]);
        let mut snapshot = store.snapshot();
        snapshot.upstream[0].api_keys.clear();
        snapshot.upstream[0].status = ChannelStatus::Disabled;

        let fresh = store.snapshot();
        assert_eq!(fresh.upstream[0].api_keys, vec!["k1", "k2"]);
        assert_eq!(fresh.upstream[0].status, ChannelStatus::Active);
    }

    #[tokio::test]
    async fn deprioritize_moves_key_to_tail() {
        let store = store_with(vec![channel("a", &["k1", "k2", "k3"])]);

        assert!(store.deprioritize_api_key(ChannelSet::Messages, "a", "k1"));
        assert_eq!(
            store.snapshot().upstream[0].api_keys,
            vec!["k2", "k3", "k1"]
        );

        // Already at the tail: nothing to do.
        assert!(!store.deprioritize_api_key(ChannelSet::Messages, "a", "k1"));
        // Unknown key or channel: no-op.
        assert!(!store.deprioritize_api_key(ChannelSet::Messages, "a", "nope"));
        assert!(!store.deprioritize_api_key(ChannelSet::Messages, "missing", "k1"));
    }

    #[tokio::test]
    async fn set_promotion_clears_competitors() {
        let store = store_with(vec![channel("a", &["k1"]), channel("b", &["k2"])]);
        let until = chrono::Utc::now() + chrono::Duration::minutes(5);

        store
            .set_promotion(ChannelSet::Messages, "a", Some(until))
            .expect("promote a");
        store
            .set_promotion(ChannelSet::Messages, "b", Some(until))
            .expect("promote b");

        let snapshot = store.snapshot();
        assert!(snapshot.upstream[0].promotion_until.is_none());
        assert!(snapshot.upstream[1].promotion_until.is_some());

        assert!(
            store
                .set_promotion(ChannelSet::Messages, "missing", Some(until))
                .is_err()
        );
    }

    #[tokio::test]
    async fn swap_reports_removed_keys_and_changed_channels() {
        let store = store_with(vec![channel("a", &["k1", "k2"]), channel("b", &["k3"])]);

        let mut next = ProxyConfig {
            upstream: vec![channel("a", &["k1"])],
            ..Default::default()
        };
        next.upstream[0].base_urls = vec!["https://moved.example.com".to_string()];

        let diff = store.swap(next);
        let mut removed = diff.removed_keys;
        removed.sort();
        assert_eq!(removed, vec!["k2", "k3"]);
        assert!(diff.changed_channels.contains(&"a".to_string()));
        assert!(diff.changed_channels.contains(&"b".to_string()));
    }
}
