//! Per-request identity extraction.

use axum::http::HeaderMap;
use serde_json::Value;

/// Derive the conversation identifier that drives trace affinity.
///
/// Sources, in order: `Conversation_id` header, `Session_id` header, the
/// body's `prompt_cache_key`, then `metadata.user_id`. Empty means affinity
/// is disabled for this request.
pub fn conversation_id(headers: &HeaderMap, body: &Value) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    header_value("conversation_id")
        .or_else(|| header_value("session_id"))
        .or_else(|| {
            body.get("prompt_cache_key")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .or_else(|| {
            body.get("metadata")?
                .get("user_id")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    #[test]
    fn header_sources_win_over_body_sources() {
        let mut headers = HeaderMap::new();
        headers.insert("conversation_id", HeaderValue::from_static("conv-h"));
        headers.insert("session_id", HeaderValue::from_static("sess-h"));
        let body = json!({ "prompt_cache_key": "pck", "metadata": { "user_id": "u1" } });

        assert_eq!(conversation_id(&headers, &body), "conv-h");

        headers.remove("conversation_id");
        assert_eq!(conversation_id(&headers, &body), "sess-h");
    }

    #[test]
    fn body_fallbacks_in_documented_order() {
        let headers = HeaderMap::new();
        let body = json!({ "prompt_cache_key": "pck", "metadata": { "user_id": "u1" } });
        assert_eq!(conversation_id(&headers, &body), "pck");

        let body = json!({ "metadata": { "user_id": "u1" } });
        assert_eq!(conversation_id(&headers, &body), "u1");

        let body = json!({ "messages": [] });
        assert_eq!(conversation_id(&headers, &body), "");
    }
}
