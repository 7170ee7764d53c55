//! The request pipeline: drives scheduling, within-channel key rotation,
//! the upstream call, and failover bookkeeping.

use super::headers::upstream_headers;
use crate::classify;
use crate::config::{BasicConfig, ChannelConfig, ChannelSet, ConfigStore};
use crate::error::ProxyError;
use crate::sched::{ChannelScheduler, Selected, SelectionReason};
use axum::http::StatusCode;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything the pipeline needs to know about one inbound request.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub set: ChannelSet,
    /// Requested model; rewritten per channel by the model mapping.
    pub model: String,
    pub stream: bool,
    pub body: Value,
    pub conversation_id: String,
    /// Gemini RPC verb from the inbound path.
    pub gemini_rpc: Option<String>,
    /// The Responses "compact" endpoint variant.
    pub responses_compact: bool,
}

impl DispatchPlan {
    pub fn new(set: ChannelSet, body: Value) -> Self {
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
        Self {
            set,
            model,
            stream,
            body,
            conversation_id: String::new(),
            gemini_rpc: None,
            responses_compact: false,
        }
    }
}

/// A live 2xx upstream response plus the attempt identity needed to finish
/// metrics accounting once the body/stream has been consumed.
#[derive(Debug)]
pub struct DispatchSuccess {
    pub response: reqwest::Response,
    pub selected: Selected,
    pub base_url: String,
    pub api_key: String,
    pub effective_model: String,
}

pub struct ProxyEngine {
    scheduler: Arc<ChannelScheduler>,
    store: Arc<ConfigStore>,
    basic: Arc<BasicConfig>,
    standard_client: reqwest::Client,
    insecure_client: reqwest::Client,
}

impl ProxyEngine {
    pub fn new(
        store: Arc<ConfigStore>,
        scheduler: Arc<ChannelScheduler>,
        basic: Arc<BasicConfig>,
    ) -> Self {
        let build = |insecure: bool| {
            let mut builder = reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .connect_timeout(Duration::from_secs(10))
                .timeout(basic.request_timeout_duration());
            if insecure {
                builder = builder.danger_accept_invalid_certs(true);
            }
            builder.build().expect("failed to build reqwest client")
        };
        Self {
            scheduler,
            store,
            standard_client: build(false),
            insecure_client: build(true),
            basic,
        }
    }

    pub fn scheduler(&self) -> &Arc<ChannelScheduler> {
        &self.scheduler
    }

    pub fn basic(&self) -> &BasicConfig {
        &self.basic
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Drive the full failover cascade for one request.
    ///
    /// Returns the first 2xx upstream response. Non-failover upstream
    /// statuses surface immediately and verbatim; total failure surfaces
    /// the last failover body (precise mode) or a generic envelope.
    pub async fn dispatch(&self, plan: &DispatchPlan) -> Result<DispatchSuccess, ProxyError> {
        let fuzzy = self.store.fuzzy_mode();
        let sched_cfg = self.store.scheduler();
        let channels = self.store.channels(plan.set);
        let active: Vec<usize> = channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_active())
            .map(|(idx, _)| idx)
            .collect();

        let single_channel = active.len() == 1;
        let max_channels = sched_cfg.fallback.max_retries as usize + 1;
        let mut failed_channels: HashSet<usize> = HashSet::new();
        let mut last_failover: Option<(StatusCode, Vec<u8>)> = None;
        let mut quota_tags: Vec<(String, String)> = Vec::new();

        for _ in 0..max_channels {
            let selected = if single_channel {
                // One active channel: skip the scheduler but keep the full
                // base-URL / key iteration.
                let index = active[0];
                if failed_channels.contains(&index) {
                    break;
                }
                Selected {
                    index,
                    channel: channels[index].clone(),
                    reason: SelectionReason::PriorityOrder,
                }
            } else {
                match self.scheduler.select_channel(
                    &plan.conversation_id,
                    &failed_channels,
                    plan.set,
                ) {
                    Ok(selected) => selected,
                    Err(ProxyError::NoChannelAvailable) => break,
                    Err(other) => return Err(other),
                }
            };

            debug!(
                set = plan.set.as_str(),
                channel = %selected.channel.name,
                reason = selected.reason.as_str(),
                "channel selected"
            );

            match self
                .try_channel(plan, &selected, fuzzy, &mut last_failover, &mut quota_tags)
                .await?
            {
                Some(success) => {
                    if !plan.conversation_id.is_empty() {
                        self.scheduler
                            .affinity()
                            .set_preferred_channel(&plan.conversation_id, selected.index);
                    }
                    self.flush_quota_tags(plan.set, &quota_tags);
                    return Ok(success);
                }
                None => {
                    failed_channels.insert(selected.index);
                }
            }
        }

        self.flush_quota_tags(plan.set, &quota_tags);
        match last_failover {
            Some((status, body)) if !fuzzy => Err(ProxyError::UpstreamFailover { status, body }),
            _ if single_channel => Err(ProxyError::NoKeysAvailable),
            _ => Err(ProxyError::NoChannelAvailable),
        }
    }

    /// Iterate (base URL × key) combinations of one channel.
    /// `Ok(None)` means the channel is exhausted and the cascade moves on.
    async fn try_channel(
        &self,
        plan: &DispatchPlan,
        selected: &Selected,
        fuzzy: bool,
        last_failover: &mut Option<(StatusCode, Vec<u8>)>,
        quota_tags: &mut Vec<(String, String)>,
    ) -> Result<Option<DispatchSuccess>, ProxyError> {
        let channel = &selected.channel;
        let (payload, effective_model) = prepare_payload(plan, channel)?;
        let path = request_path(plan, &effective_model);
        let urls = self.scheduler.url_health().ordered_urls(channel);
        let client = if channel.insecure_skip_verify {
            &self.insecure_client
        } else {
            &self.standard_client
        };

        let mut failed_keys: HashSet<String> = HashSet::new();

        for base_url in &urls {
            // Breaker state is per (base URL, key), so each URL gets its
            // own single probe when all of its key buckets are open.
            let mut allow_force_probe = true;
            for _ in 0..channel.api_keys.len() {
                let Some(pick) = self.scheduler.next_api_key(
                    plan.set,
                    channel,
                    base_url,
                    &failed_keys,
                    allow_force_probe,
                ) else {
                    break;
                };
                if pick.via_force_probe {
                    allow_force_probe = false;
                }

                let url = format!("{base_url}{path}");
                let request = client
                    .post(&url)
                    .headers(upstream_headers(channel.service_type, &pick.key, plan.stream))
                    .body(payload.clone());

                let sent = tokio::time::timeout(
                    self.basic.response_header_timeout_duration(),
                    request.send(),
                )
                .await;
                let response = match sent {
                    Ok(Ok(response)) => response,
                    Ok(Err(err)) => {
                        warn!(
                            channel = %channel.name,
                            url = %url,
                            "upstream transport error: {err}"
                        );
                        failed_keys.insert(pick.key.clone());
                        self.scheduler
                            .on_upstream_failure(plan.set, channel, base_url, &pick.key, true);
                        continue;
                    }
                    Err(_) => {
                        warn!(
                            channel = %channel.name,
                            url = %url,
                            "upstream response headers timed out"
                        );
                        failed_keys.insert(pick.key.clone());
                        self.scheduler
                            .on_upstream_failure(plan.set, channel, base_url, &pick.key, true);
                        continue;
                    }
                };

                let status = response.status();
                if status.is_success() {
                    info!(
                        set = plan.set.as_str(),
                        channel = %channel.name,
                        reason = selected.reason.as_str(),
                        model = %effective_model,
                        stream = plan.stream,
                        "upstream accepted request"
                    );
                    self.scheduler
                        .on_upstream_success(plan.set, channel, base_url, &pick.key, None);
                    return Ok(Some(DispatchSuccess {
                        response,
                        selected: selected.clone(),
                        base_url: base_url.clone(),
                        api_key: pick.key,
                        effective_model,
                    }));
                }

                // reqwest transparently inflates gzip'd error bodies.
                let body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
                let verdict = classify::should_failover(status.as_u16(), &body, fuzzy);
                if verdict.failover {
                    warn!(
                        channel = %channel.name,
                        url = %url,
                        status = status.as_u16(),
                        quota = verdict.quota,
                        "upstream failure, rotating"
                    );
                    failed_keys.insert(pick.key.clone());
                    self.scheduler
                        .on_upstream_failure(plan.set, channel, base_url, &pick.key, true);
                    if verdict.quota {
                        quota_tags.push((channel.name.clone(), pick.key.clone()));
                    }
                    *last_failover = Some((status, body));
                    continue;
                }

                // Hard invariant: a genuine client error surfaces verbatim
                // without rotation.
                self.scheduler
                    .on_upstream_failure(plan.set, channel, base_url, &pick.key, false);
                return Err(ProxyError::UpstreamFailover { status, body });
            }
        }
        Ok(None)
    }

    /// Forward `GET /v1/models` to the Messages set's best channel.
    pub async fn forward_models(&self) -> Result<reqwest::Response, ProxyError> {
        let selected =
            self.scheduler
                .select_channel("", &HashSet::new(), ChannelSet::Messages)?;
        let channel = &selected.channel;
        let urls = self.scheduler.url_health().ordered_urls(channel);
        let mut failed_keys: HashSet<String> = HashSet::new();

        for base_url in &urls {
            for _ in 0..channel.api_keys.len() {
                let Some(pick) = self.scheduler.next_api_key(
                    ChannelSet::Messages,
                    channel,
                    base_url,
                    &failed_keys,
                    true,
                ) else {
                    break;
                };
                let request = self
                    .standard_client
                    .get(format!("{base_url}/v1/models"))
                    .headers(upstream_headers(channel.service_type, &pick.key, false));
                match tokio::time::timeout(
                    self.basic.response_header_timeout_duration(),
                    request.send(),
                )
                .await
                {
                    Ok(Ok(response)) if response.status().is_success() => return Ok(response),
                    _ => {
                        failed_keys.insert(pick.key.clone());
                    }
                }
            }
        }
        Err(ProxyError::NoChannelAvailable)
    }

    fn flush_quota_tags(&self, set: ChannelSet, quota_tags: &[(String, String)]) {
        for (channel_name, key) in quota_tags {
            self.store.deprioritize_api_key(set, channel_name, key);
        }
    }
}

/// Serialize the request body for one channel, with the model mapping
/// applied. Returns the bytes and the effective model name.
fn prepare_payload(
    plan: &DispatchPlan,
    channel: &ChannelConfig,
) -> Result<(Vec<u8>, String), ProxyError> {
    let effective_model = channel
        .map_model(&plan.model)
        .map_or_else(|| plan.model.clone(), str::to_string);

    let mut body = plan.body.clone();
    if effective_model != plan.model
        && let Some(slot) = body.get_mut("model")
    {
        *slot = Value::String(effective_model.clone());
    }
    Ok((serde_json::to_vec(&body)?, effective_model))
}

fn request_path(plan: &DispatchPlan, effective_model: &str) -> String {
    match plan.set {
        ChannelSet::Messages => "/v1/messages".to_string(),
        ChannelSet::Responses => if plan.responses_compact {
            "/v1/responses/compact"
        } else {
            "/v1/responses"
        }
        .to_string(),
        ChannelSet::Gemini => {
            let rpc = plan.gemini_rpc.as_deref().unwrap_or("generateContent");
            let suffix = if plan.stream { "?alt=sse" } else { "" };
            format!("/v1beta/models/{effective_model}:{rpc}{suffix}")
        }
    }
}
