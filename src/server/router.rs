use crate::proxy::ProxyEngine;
use crate::server::guards::auth::RequireKeyAuth;
use crate::server::routes;
use axum::{
    Router,
    extract::{DefaultBodyLimit, Request},
    http::{HeaderName, HeaderValue, Method, StatusCode, header::USER_AGENT},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use base64::Engine as _;
use rand::RngCore;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const MAX_REQUEST_ID_LEN: usize = 128;
const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

fn generate_request_id() -> String {
    // 96 bits => 16 chars base64url (no padding).
    let mut bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ProxyEngine>,
    pub access_key: Arc<str>,
    pub quiet_polling_logs: bool,
}

impl AppState {
    pub fn new(engine: Arc<ProxyEngine>) -> Self {
        let basic = engine.basic();
        let access_key: Arc<str> = Arc::from(basic.proxy_access_key.clone());
        let quiet_polling_logs = basic.quiet_polling_logs;
        Self {
            engine,
            access_key,
            quiet_polling_logs,
        }
    }
}

async fn not_found_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn access_log(
    axum::extract::State(state): axum::extract::State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    // Capture request metadata before moving `req` into the handler stack.
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let request_id = req
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);

    let user_agent = req
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let quiet = state.quiet_polling_logs;

    let start = Instant::now();
    let mut resp = next.run(req).await;

    // Always reflect `x-request-id` for correlation, even if the client
    // didn't send one.
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert(X_REQUEST_ID, value);
    }

    let status = resp.status();
    let latency_ms = start.elapsed().as_millis() as u64;

    // Polling endpoints drown the log at info level.
    if quiet && path == "/v1/models" && status.is_success() {
        return resp;
    }

    // Note: for SSE responses `latency_ms` is time-to-first-byte, not the
    // full stream duration.
    if status.is_server_error() {
        error!(
            "| {:>3} | {} | {:^7} | {} | {}ms | {}",
            status.as_u16(),
            request_id,
            method.as_str(),
            path,
            latency_ms,
            user_agent
        );
    } else if status.is_client_error() {
        warn!(
            "| {:>3} | {} | {:^7} | {} | {}ms | {}",
            status.as_u16(),
            request_id,
            method.as_str(),
            path,
            latency_ms,
            user_agent
        );
    } else {
        info!(
            "| {:>3} | {} | {:^7} | {} | {}ms | {}",
            status.as_u16(),
            request_id,
            method.as_str(),
            path,
            latency_ms,
            user_agent
        );
    }

    resp
}

fn cors_layer(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    if origin == "*" {
        layer.allow_origin(Any)
    } else {
        match origin.parse::<HeaderValue>() {
            Ok(value) => layer.allow_origin(value),
            Err(_) => {
                warn!("invalid CORS_ORIGIN {origin:?}, allowing any origin");
                layer.allow_origin(Any)
            }
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let basic = state.engine.basic();
    let body_cap = basic.max_body_bytes();
    let enable_cors = basic.enable_cors;
    let cors_origin = basic.cors_origin.clone();

    let data = Router::new()
        .route("/v1/messages", post(routes::messages::messages_handler))
        .route("/v1/responses", post(routes::responses::responses_handler))
        .route(
            "/v1/responses/compact",
            post(routes::responses::responses_compact_handler),
        )
        .route(
            "/v1beta/models/{target}",
            post(routes::gemini::generate_content_handler),
        )
        .route("/v1/models", get(routes::models::models_handler))
        .layer(middleware::from_extractor_with_state::<RequireKeyAuth, _>(
            state.clone(),
        ))
        .layer(DefaultBodyLimit::max(body_cap));

    let mut app = Router::new()
        .merge(data)
        .fallback(not_found_handler)
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, access_log));

    if enable_cors {
        app = app.layer(cors_layer(&cors_origin));
    }
    app
}
