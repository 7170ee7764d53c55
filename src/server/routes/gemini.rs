use crate::config::ChannelSet;
use crate::error::{ApiErrorBody, ProxyError};
use crate::proxy::{DispatchPlan, conversation_id};
use crate::relay::{PassthroughMediator, SseDebug, StreamRecorder, relay_stream};
use crate::server::router::AppState;
use axum::{
    Json, RequestExt,
    extract::{FromRequest, Path, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct GeminiContext {
    pub model: String,
    pub rpc: String,
    pub stream: bool,
}

/// Parses the `{model}:{rpc}` path target and the JSON body.
pub struct GeminiPreprocess(pub Value, pub GeminiContext);

impl FromRequest<AppState> for GeminiPreprocess {
    type Rejection = Response;

    async fn from_request(mut req: Request, _state: &AppState) -> Result<Self, Self::Rejection> {
        let Path(target) = match req.extract_parts::<Path<String>>().await {
            Ok(path) => path,
            Err(rejection) => return Err(rejection.into_response()),
        };

        let Some((model, rpc)) = target.split_once(':') else {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(ApiErrorBody::new(
                    "invalid_request_error",
                    "Expected path of the form {model}:{rpc}.",
                )),
            )
                .into_response());
        };
        if !matches!(rpc, "generateContent" | "streamGenerateContent") {
            return Err((
                StatusCode::NOT_FOUND,
                Json(ApiErrorBody::new(
                    "not_found_error",
                    "Unsupported Gemini RPC.",
                )),
            )
                .into_response());
        }

        let ctx = GeminiContext {
            model: model.to_string(),
            rpc: rpc.to_string(),
            stream: rpc == "streamGenerateContent",
        };

        let Json(body) = match Json::<Value>::from_request(req, &()).await {
            Ok(json) => json,
            Err(rejection) => return Err(rejection.into_response()),
        };
        Ok(GeminiPreprocess(body, ctx))
    }
}

pub(crate) async fn generate_content_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    GeminiPreprocess(body, ctx): GeminiPreprocess,
) -> Result<Response, ProxyError> {
    super::debug_log_body(
        state.engine.basic().enable_request_logs,
        "gemini request",
        &body,
    );

    let mut plan = DispatchPlan::new(ChannelSet::Gemini, body);
    plan.model = ctx.model.clone();
    plan.stream = ctx.stream;
    plan.gemini_rpc = Some(ctx.rpc.clone());
    plan.conversation_id = conversation_id(&headers, &plan.body);

    debug!(
        model = %ctx.model,
        rpc = %ctx.rpc,
        stream = ctx.stream,
        "incoming Gemini request"
    );

    let success = state.engine.dispatch(&plan).await?;
    if plan.stream {
        let basic = state.engine.basic();
        let mediator = PassthroughMediator::new(&success.effective_model, &plan.body);
        let recorder = StreamRecorder::new(
            Arc::clone(state.engine.scheduler()),
            ChannelSet::Gemini,
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
        super::buffered_response(&state, ChannelSet::Gemini, success).await
    }
}
