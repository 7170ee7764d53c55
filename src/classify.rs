//! Upstream error classification: (status, body, mode) → failover decision.
//!
//! Pure and deterministic. The pipeline consults this on every non-2xx
//! upstream response to decide whether to rotate (next key / next channel)
//! and whether the offending key should be deprioritized as quota-exhausted.

use meridian_schema::UpstreamErrorBody;

/// Classification result: should the request fail over, and is the error
/// quota-related (key-deprioritization candidate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub failover: bool,
    pub quota: bool,
}

impl Verdict {
    const fn new(failover: bool, quota: bool) -> Self {
        Self { failover, quota }
    }
}

/// Quota / balance exhaustion markers, including the CJK phrasings used by
/// aggregator gateways.
const QUOTA_KEYWORDS: &[&str] = &[
    "insufficient",
    "quota",
    "rate limit",
    "rate_limit",
    "billing",
    "credit",
    "balance",
    "额度",
    "预扣费",
    "余额不足",
    "欠费",
];

const AUTH_KEYWORDS: &[&str] = &[
    "invalid api key",
    "invalid x-api-key",
    "unauthorized",
    "authentication",
    "expired",
    "密钥无效",
    "无效的令牌",
];

const TRANSIENT_KEYWORDS: &[&str] = &[
    "timeout",
    "timed out",
    "overloaded",
    "unavailable",
    "try again",
    "internal server error",
    "超时",
];

/// Classify an upstream failure.
///
/// Precise mode follows the status table first; the body is inspected to
/// settle 400s and to upgrade the quota flag on statuses that already fail
/// over. Fuzzy mode treats any non-2xx as failover-worthy, but still scans
/// the body for quota markers: upstreams embed quota errors inside 403s,
/// and status alone cannot decide key deprioritization.
pub fn should_failover(status: u16, body: &[u8], fuzzy: bool) -> Verdict {
    if fuzzy {
        let failover = !(200..300).contains(&status);
        let quota = matches!(status, 402 | 429) || inspect_body(body).quota;
        return Verdict::new(failover, quota);
    }

    match status {
        401 | 403 | 408 => Verdict::new(true, inspect_body(body).quota),
        402 | 429 => Verdict::new(true, true),
        400 => inspect_body(body),
        s if s >= 500 => Verdict::new(true, inspect_body(body).quota),
        _ => Verdict::new(false, false),
    }
}

/// Keyword scan over the error body. Invalid JSON or a missing body yields
/// (false, false).
fn inspect_body(body: &[u8]) -> Verdict {
    if body.is_empty() {
        return Verdict::new(false, false);
    }
    let Ok(parsed) = serde_json::from_slice::<UpstreamErrorBody>(body) else {
        return Verdict::new(false, false);
    };

    for text in parsed.searchable_texts() {
        let lowered = text.to_lowercase();
        if QUOTA_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
            return Verdict::new(true, true);
        }
        if AUTH_KEYWORDS.iter().any(|kw| lowered.contains(kw))
            || TRANSIENT_KEYWORDS.iter().any(|kw| lowered.contains(kw))
        {
            return Verdict::new(true, false);
        }
    }
    Verdict::new(false, false)
}
