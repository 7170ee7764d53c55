//! Extraction of usage objects from live stream events.

use meridian_schema::ClaudeUsage;
use serde_json::Value;

/// A usage object observed in a stream event, with a verdict on whether the
/// values look like real accounting or an upstream placeholder.
#[derive(Debug)]
pub struct UsageSnapshot {
    pub usage: ClaudeUsage,
    pub fake: bool,
}

impl UsageSnapshot {
    /// Look for a usage object at `usage` or `message.usage` of an event
    /// payload. Returns `None` when the event carries no usage.
    pub fn from_event(data: &Value) -> Option<Self> {
        let raw = data
            .get("usage")
            .filter(|v| v.is_object())
            .or_else(|| data.get("message")?.get("usage").filter(|v| v.is_object()))?;

        let usage: ClaudeUsage = serde_json::from_value(raw.clone()).ok()?;
        let fake = looks_fake(&usage);
        Some(Self { usage, fake })
    }
}

/// Placeholder heuristic: some upstreams emit 0 or 1 for every counter when
/// they never measured anything. Cache accounting is never fabricated, so
/// its presence marks the object authoritative.
fn looks_fake(usage: &ClaudeUsage) -> bool {
    if usage.has_cache_tokens() {
        return false;
    }
    usage.input_tokens.unwrap_or(0) <= 1 && usage.output_tokens.unwrap_or(0) <= 1
}
