use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    routing::post,
};
use meridian::config::{BasicConfig, ChannelConfig, ConfigStore, ProxyConfig};
use meridian::proxy::ProxyEngine;
use meridian::server::router::{AppState, app_router};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

/// Upstream emitting a Messages stream with no usage anywhere.
async fn spawn_sse_upstream() -> String {
    let app = Router::new().route(
        "/v1/messages",
        post(|| async {
            let body = concat!(
                "event: message_start\n",
                "data: {\"type\":\"message_start\",\"message\":{\"id\":\"\",\"role\":\"assistant\",\"model\":\"vendor-model\"}}\n\n",
                "event: content_block_delta\n",
                "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hello\"}}\n\n",
                "event: message_stop\n",
                "data: {\"type\":\"message_stop\"}\n\n",
            );
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                body,
            )
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("upstream serve");
    });
    format!("http://{addr}")
}

fn proxy_app(base_url: &str) -> Router {
    let cfg = ProxyConfig {
        upstream: vec![ChannelConfig {
            name: "primary".to_string(),
            base_urls: vec![base_url.to_string()],
            api_keys: vec!["sk-test".to_string()],
            ..Default::default()
        }],
        ..Default::default()
    };
    let store = Arc::new(ConfigStore::new(cfg));
    let basic = Arc::new(BasicConfig {
        proxy_access_key: "pwd".to_string(),
        ..Default::default()
    });
    let scheduler = Arc::new(meridian::ChannelScheduler::new(Arc::clone(&store), &basic));
    let engine = Arc::new(ProxyEngine::new(store, scheduler, basic));
    app_router(AppState::new(engine))
}

#[tokio::test]
async fn missing_usage_stream_gets_exactly_one_injected_delta() {
    let base = spawn_sse_upstream().await;
    let app = proxy_app(&base);

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/messages")
                .header("content-type", "application/json")
                .header("x-api-key", "pwd")
                .body(Body::from(
                    r#"{"model":"claude-sonnet-4","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
                ))
                .expect("request"),
        )
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    assert_eq!(
        resp.headers()
            .get("x-accel-buffering")
            .and_then(|v| v.to_str().ok()),
        Some("no")
    );

    let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
    let text = String::from_utf8(body.to_vec()).expect("utf8");

    assert_eq!(text.matches("event: message_delta").count(), 1);
    let stop_pos = text.find("event: message_stop").expect("stop forwarded");
    let delta_pos = text
        .find("event: message_delta")
        .expect("injected delta present");
    assert!(delta_pos < stop_pos, "injection precedes the stop event");

    // The injected delta carries non-zero estimated usage.
    let delta_data = text[delta_pos..]
        .lines()
        .find(|l| l.starts_with("data:"))
        .expect("delta data line");
    let parsed: Value =
        serde_json::from_str(delta_data.trim_start_matches("data:").trim()).expect("delta json");
    assert!(parsed["usage"]["input_tokens"].as_u64().unwrap() > 0);
    assert!(parsed["usage"]["output_tokens"].as_u64().unwrap() > 0);

    // message_start was patched: non-empty id, requested model restored.
    let start_pos = text.find("event: message_start").expect("start forwarded");
    let start_data = text[start_pos..]
        .lines()
        .find(|l| l.starts_with("data:"))
        .expect("start data line");
    let parsed: Value =
        serde_json::from_str(start_data.trim_start_matches("data:").trim()).expect("start json");
    let id = parsed["message"]["id"].as_str().unwrap();
    assert!(id.starts_with("msg_") && id.len() > 4);
    assert_eq!(parsed["message"]["model"], "claude-sonnet-4");
}
