use crate::config::ChannelSet;
use crate::error::ProxyError;
use crate::proxy::{DispatchPlan, conversation_id};
use crate::relay::{ResponsesMediator, SseDebug, StreamRecorder, relay_stream};
use crate::server::router::AppState;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use std::sync::Arc;
use tracing::debug;

pub(crate) async fn responses_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    respond(state, headers, body, false).await
}

pub(crate) async fn responses_compact_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    respond(state, headers, body, true).await
}

async fn respond(
    state: AppState,
    headers: HeaderMap,
    body: Bytes,
    compact: bool,
) -> Result<Response, ProxyError> {
    let parsed = match super::parse_json_body(&state, &body) {
        Ok(value) => value,
        Err(rejection) => return Ok(rejection),
    };
    super::debug_log_body(
        state.engine.basic().enable_request_logs,
        "responses request",
        &parsed,
    );

    let mut plan = DispatchPlan::new(ChannelSet::Responses, parsed);
    plan.responses_compact = compact;
    plan.conversation_id = conversation_id(&headers, &plan.body);

    debug!(
        model = %plan.model,
        stream = plan.stream,
        compact,
        conversation = %plan.conversation_id,
        "incoming Responses request"
    );

    let success = state.engine.dispatch(&plan).await?;
    if plan.stream {
        let basic = state.engine.basic();
        let mediator = ResponsesMediator::new(
            &success.effective_model,
            success.selected.channel.low_quality,
            &plan.body,
        );
        let recorder = StreamRecorder::new(
            Arc::clone(state.engine.scheduler()),
            ChannelSet::Responses,
            success.base_url.clone(),
            success.api_key.clone(),
        );
        let sse_debug = SseDebug::from_level(basic.sse_debug_summary(), basic.sse_debug_full());
        Ok(relay_stream(
            success.response,
            Box::new(mediator),
            recorder,
            sse_debug,
        ))
    } else {
        super::buffered_response(&state, ChannelSet::Responses, success).await
    }
}
