pub mod gemini;
pub mod messages;
pub mod models;
pub mod responses;

use crate::config::ChannelSet;
use crate::error::{ApiErrorBody, ProxyError};
use crate::proxy::DispatchSuccess;
use crate::sched::UsageObservation;
use crate::server::router::AppState;
use axum::Json;
use axum::body::Bytes;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tracing::debug;

/// Parse the inbound body, enforcing the size cap and returning the
/// Claude-dialect invalid-request envelope on malformed JSON.
pub(super) fn parse_json_body(state: &AppState, bytes: &Bytes) -> Result<Value, Response> {
    if bytes.len() > state.engine.basic().max_body_bytes() {
        return Err(ProxyError::BodyTooLarge.into_response());
    }
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) if value.is_object() => Ok(value),
        _ => Err((
            StatusCode::BAD_REQUEST,
            Json(ApiErrorBody::new(
                "invalid_request_error",
                "Request body must be a JSON object.",
            )),
        )
            .into_response()),
    }
}

/// Pretty-print a request/response body at debug level when the matching
/// env knob is on.
pub(super) fn debug_log_body(enabled: bool, label: &str, body: &Value) {
    if !enabled || !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    match serde_json::to_string_pretty(body) {
        Ok(pretty) => debug!("{label}:\n{pretty}"),
        Err(err) => debug!("{label}: <serialize failed: {err}>"),
    }
}

/// Buffer a non-streaming upstream response, fold its usage into metrics,
/// and relay status + body verbatim.
pub(super) async fn buffered_response(
    state: &AppState,
    set: ChannelSet,
    success: DispatchSuccess,
) -> Result<Response, ProxyError> {
    let status = success.response.status();
    let bytes = success.response.bytes().await?;

    if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
        debug_log_body(
            state.engine.basic().enable_response_logs,
            "upstream response",
            &value,
        );
        if let Some(usage) = extract_usage(&value) {
            state
                .engine
                .scheduler()
                .metrics(set)
                .record_usage(&success.base_url, &success.api_key, &usage);
        }
    }

    Ok((
        status,
        [(header::CONTENT_TYPE, "application/json")],
        bytes,
    )
        .into_response())
}

/// Usage from a buffered body: `usage` (Messages), `response.usage`
/// (Responses) or `usageMetadata` (Gemini).
fn extract_usage(body: &Value) -> Option<UsageObservation> {
    if let Some(usage) = body
        .get("usage")
        .or_else(|| body.get("response")?.get("usage"))
    {
        return Some(UsageObservation {
            model: body
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            input_tokens: usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
            output_tokens: usage
                .get("output_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            cost_cents: 0.0,
        });
    }
    let metadata = body.get("usageMetadata")?;
    Some(UsageObservation {
        model: String::new(),
        input_tokens: metadata
            .get("promptTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        output_tokens: metadata
            .get("candidatesTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        cost_cents: 0.0,
    })
}
