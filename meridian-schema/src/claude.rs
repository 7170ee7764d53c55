//! Claude Messages API usage and stream-event shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// SSE event names emitted by the Messages API.
pub mod events {
    pub const MESSAGE_START: &str = "message_start";
    pub const MESSAGE_DELTA: &str = "message_delta";
    pub const MESSAGE_STOP: &str = "message_stop";
    pub const CONTENT_BLOCK_START: &str = "content_block_start";
    pub const CONTENT_BLOCK_DELTA: &str = "content_block_delta";
    pub const CONTENT_BLOCK_STOP: &str = "content_block_stop";
    pub const PING: &str = "ping";
    pub const ERROR: &str = "error";
}

/// Usage block carried by `message_start` and `message_delta` events.
///
/// Upstreams disagree on which fields they populate, so everything is
/// optional and unknown fields are preserved through `extra`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClaudeUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,

    /// Per-TTL cache-creation split (`ephemeral_5m_input_tokens` /
    /// `ephemeral_1h_input_tokens`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation: Option<ClaudeCacheCreation>,

    #[serde(flatten)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClaudeCacheCreation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ephemeral_5m_input_tokens: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ephemeral_1h_input_tokens: Option<u64>,

    #[serde(flatten)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl ClaudeUsage {
    /// True when any cache accounting field carries a nonzero value.
    pub fn has_cache_tokens(&self) -> bool {
        let nonzero = |v: &Option<u64>| v.is_some_and(|n| n > 0);
        nonzero(&self.cache_creation_input_tokens)
            || nonzero(&self.cache_read_input_tokens)
            || self.cache_creation.as_ref().is_some_and(|c| {
                nonzero(&c.ephemeral_5m_input_tokens) || nonzero(&c.ephemeral_1h_input_tokens)
            })
    }

    /// TTL tag for the cache-creation split: "5m", "1h", or "mixed".
    pub fn cache_ttl_tag(&self) -> Option<&'static str> {
        let split = self.cache_creation.as_ref()?;
        let m5 = split.ephemeral_5m_input_tokens.unwrap_or(0);
        let h1 = split.ephemeral_1h_input_tokens.unwrap_or(0);
        match (m5 > 0, h1 > 0) {
            (true, true) => Some("mixed"),
            (true, false) => Some("5m"),
            (false, true) => Some("1h"),
            (false, false) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn usage_round_trips_and_preserves_unknown_fields() {
        let raw = json!({
            "input_tokens": 12,
            "output_tokens": 34,
            "server_tool_use": { "web_search_requests": 1 }
        });

        let usage: ClaudeUsage = serde_json::from_value(raw.clone()).expect("parse usage");
        assert_eq!(usage.input_tokens, Some(12));
        assert_eq!(usage.output_tokens, Some(34));
        assert!(usage.extra.contains_key("server_tool_use"));

        let out = serde_json::to_value(&usage).expect("serialize usage");
        assert_eq!(out, raw);
    }

    #[test]
    fn cache_ttl_tag_reflects_split() {
        let only_5m: ClaudeUsage = serde_json::from_value(json!({
            "cache_creation": { "ephemeral_5m_input_tokens": 100 }
        }))
        .expect("parse");
        assert_eq!(only_5m.cache_ttl_tag(), Some("5m"));

        let mixed: ClaudeUsage = serde_json::from_value(json!({
            "cache_creation": {
                "ephemeral_5m_input_tokens": 100,
                "ephemeral_1h_input_tokens": 50
            }
        }))
        .expect("parse");
        assert_eq!(mixed.cache_ttl_tag(), Some("mixed"));

        let none = ClaudeUsage::default();
        assert_eq!(none.cache_ttl_tag(), None);
    }

    #[test]
    fn has_cache_tokens_ignores_zero_values() {
        let zeroed: ClaudeUsage = serde_json::from_value(json!({
            "cache_creation_input_tokens": 0,
            "cache_read_input_tokens": 0
        }))
        .expect("parse");
        assert!(!zeroed.has_cache_tokens());

        let read_hit: ClaudeUsage = serde_json::from_value(json!({
            "cache_read_input_tokens": 2048
        }))
        .expect("parse");
        assert!(read_hit.has_cache_tokens());
    }
}
