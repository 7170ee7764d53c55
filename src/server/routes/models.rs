use crate::error::ProxyError;
use crate::server::router::AppState;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};

/// Forward the model list from the Messages set's best channel.
pub(crate) async fn models_handler(State(state): State<AppState>) -> Result<Response, ProxyError> {
    let upstream = state.engine.forward_models().await?;
    let status = upstream.status();
    let bytes = upstream.bytes().await?;
    Ok((
        status,
        [(header::CONTENT_TYPE, "application/json")],
        bytes,
    )
        .into_response())
}
