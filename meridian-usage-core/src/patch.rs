//! In-place rewriting of usage objects.

use meridian_schema::{ClaudeUsage, ResponsesUsage};
use serde_json::Value;

/// Estimated token counts to substitute for placeholder accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageEstimate {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Rewrite a Claude usage object in place.
///
/// Cache accounting (`cache_creation_input_tokens`, `cache_read_input_tokens`
/// and the 5m/1h split) is always preserved and, when present, keeps
/// `input_tokens` authoritative even under `force`. A `cache_ttl` tag is
/// derived from the split. Returns true when the object was modified.
pub fn patch_claude_usage(slot: &mut Value, estimate: &UsageEstimate, force: bool) -> bool {
    let Ok(mut usage) = serde_json::from_value::<ClaudeUsage>(slot.clone()) else {
        return false;
    };

    let has_cache = usage.has_cache_tokens();
    let mut changed = false;

    let input_placeholder = usage.input_tokens.unwrap_or(0) <= 1;
    if !has_cache && (input_placeholder || force) && usage.input_tokens != Some(estimate.input_tokens)
    {
        usage.input_tokens = Some(estimate.input_tokens);
        changed = true;
    }

    let output_placeholder = usage.output_tokens.unwrap_or(0) <= 1;
    if (output_placeholder || force) && usage.output_tokens != Some(estimate.output_tokens) {
        usage.output_tokens = Some(estimate.output_tokens);
        changed = true;
    }

    if let Some(tag) = usage.cache_ttl_tag()
        && usage.extra.get("cache_ttl").and_then(Value::as_str) != Some(tag)
    {
        usage
            .extra
            .insert("cache_ttl".to_string(), Value::String(tag.to_string()));
        changed = true;
    }

    if changed && let Ok(rewritten) = serde_json::to_value(&usage) {
        *slot = rewritten;
    }
    changed
}

/// Rewrite a Responses usage object in place.
///
/// `has_claude_cache` tracks native Claude cache fields seen earlier in the
/// stream; only those make `input_tokens` authoritative. OpenAI's
/// `input_tokens_details.cached_tokens` does not.
pub fn patch_responses_usage(
    slot: &mut Value,
    estimate: &UsageEstimate,
    force: bool,
    has_claude_cache: bool,
) -> bool {
    let Ok(mut usage) = serde_json::from_value::<ResponsesUsage>(slot.clone()) else {
        return false;
    };

    let mut changed = false;

    let input_placeholder = usage.input_tokens.unwrap_or(0) <= 1;
    if !has_claude_cache
        && (input_placeholder || force)
        && usage.input_tokens != Some(estimate.input_tokens)
    {
        usage.input_tokens = Some(estimate.input_tokens);
        changed = true;
    }

    let output_placeholder = usage.output_tokens.unwrap_or(0) <= 1;
    if (output_placeholder || force) && usage.output_tokens != Some(estimate.output_tokens) {
        usage.output_tokens = Some(estimate.output_tokens);
        changed = true;
    }

    if changed {
        usage.total_tokens = Some(
            usage.input_tokens.unwrap_or(0) + usage.output_tokens.unwrap_or(0),
        );
        if let Ok(rewritten) = serde_json::to_value(&usage) {
            *slot = rewritten;
        }
    }
    changed
}
