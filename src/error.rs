use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use std::io;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum ProxyError {
    /// Invalid index, unknown status value, unknown strategy. Surfaced to
    /// management callers, never to the data path.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No upstream channel available")]
    NoChannelAvailable,

    #[error("No API key available for the active channel")]
    NoKeysAvailable,

    /// Carrier for the last failover-eligible upstream response; surfaced
    /// only after every key, base URL and channel has been exhausted.
    #[error("Upstream error with status {status}")]
    UpstreamFailover { status: StatusCode, body: Vec<u8> },

    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Stream protocol error: {0}")]
    StreamProtocol(String),

    #[error("Request body exceeds the configured limit")]
    BodyTooLarge,

    /// Not an error for metrics purposes; never surfaced to the client.
    #[error("Client disconnected")]
    ClientDisconnect,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::UpstreamFailover { status, body } => {
                (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
            }

            ProxyError::NoChannelAvailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiErrorBody::service_unavailable()),
            )
                .into_response(),

            ProxyError::NoKeysAvailable => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiErrorBody::new(
                    "api_error",
                    "All API keys for the active channel failed.",
                )),
            )
                .into_response(),

            ProxyError::BodyTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(ApiErrorBody::new(
                    "request_too_large",
                    "Request body exceeds the configured limit.",
                )),
            )
                .into_response(),

            ProxyError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiErrorBody::new(
                    "api_error",
                    "An internal configuration error occurred.",
                )),
            )
                .into_response(),

            ProxyError::Reqwest(_)
            | ProxyError::Json(_)
            | ProxyError::Io(_)
            | ProxyError::StreamProtocol(_)
            | ProxyError::ClientDisconnect => (
                StatusCode::BAD_GATEWAY,
                Json(ApiErrorBody::new(
                    "upstream_error",
                    "Upstream service error.",
                )),
            )
                .into_response(),
        }
    }
}

/// Claude-dialect error envelope: `{"type":"error","error":{...}}`.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub r#type: &'static str,
    pub error: ApiErrorObject,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorObject {
    pub r#type: String,
    pub message: String,
}

impl ApiErrorBody {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            r#type: "error",
            error: ApiErrorObject {
                r#type: kind.into(),
                message: message.into(),
            },
        }
    }

    pub fn service_unavailable() -> Self {
        Self::new(
            "service_unavailable",
            "All upstream channels are currently unavailable",
        )
    }
}

/// Broken pipe / connection reset anywhere in the source chain means the
/// client went away mid-stream.
pub fn is_client_disconnect(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>()
            && matches!(
                io_err.kind(),
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
            )
        {
            return true;
        }
        current = e.source();
    }
    false
}
