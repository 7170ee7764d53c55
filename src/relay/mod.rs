//! Stream mediation: relay upstream SSE to the client while patching and
//! injecting token usage.
//!
//! A spawned relay task owns the upstream body and feeds a bounded channel;
//! the client response is built from the receiver. When the client
//! disconnects the relay keeps draining upstream so the final usage and
//! failure accounting stay truthful.

mod claude;
mod responses;

pub use claude::MessagesMediator;
pub use responses::ResponsesMediator;

use crate::config::ChannelSet;
use crate::sched::{ChannelScheduler, UsageObservation};
use axum::http::header::{CACHE_CONTROL, CONNECTION, HeaderName, HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// One outbound SSE frame produced by a mediator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutFrame {
    pub event: Option<String>,
    pub data: String,
}

impl OutFrame {
    pub fn new(event: Option<&str>, data: impl Into<String>) -> Self {
        Self {
            event: event.map(str::to_string),
            data: data.into(),
        }
    }

    pub fn json(event: Option<&str>, data: &Value) -> Self {
        Self::new(event, data.to_string())
    }

    fn into_sse(self) -> Event {
        let mut out = Event::default();
        if let Some(name) = self.event {
            out = out.event(name);
        }
        out.data(self.data)
    }
}

/// Synthetic mid-stream failure frame surfaced to clients.
pub fn error_frame(message: &str) -> OutFrame {
    OutFrame::json(
        Some("error"),
        &serde_json::json!({
            "type": "error",
            "error": {
                "type": "stream_error",
                "message": format!("Stream processing error: {message}"),
            }
        }),
    )
}

/// Wire-dialect-specific event handling.
pub trait EventMediator: Send + 'static {
    /// Transform one upstream event into zero or more outbound frames.
    fn on_event(&mut self, event: &eventsource_stream::Event) -> Vec<OutFrame>;

    /// Final token accounting once the upstream stream ends.
    fn final_usage(&self) -> UsageObservation;
}

/// Forwards frames untouched; used for dialects without usage mediation.
/// Final accounting falls back to the request-side estimate.
pub struct PassthroughMediator {
    effective_model: String,
    input_estimate: u64,
}

impl PassthroughMediator {
    pub fn new(effective_model: &str, request_body: &Value) -> Self {
        Self {
            effective_model: effective_model.to_string(),
            input_estimate: meridian_usage_core::estimate_request_tokens(request_body),
        }
    }
}

impl EventMediator for PassthroughMediator {
    fn on_event(&mut self, event: &eventsource_stream::Event) -> Vec<OutFrame> {
        if event.data.is_empty() {
            return Vec::new();
        }
        // Leave the default event name implicit so the wire bytes match.
        let name = (event.event != "message").then_some(event.event.as_str());
        vec![OutFrame::new(name, event.data.clone())]
    }

    fn final_usage(&self) -> UsageObservation {
        UsageObservation {
            model: self.effective_model.clone(),
            input_tokens: self.input_estimate,
            output_tokens: 0,
            cost_cents: 0.0,
        }
    }
}

/// Attempt identity needed to finish metrics once the stream settles.
pub struct StreamRecorder {
    scheduler: Arc<ChannelScheduler>,
    set: ChannelSet,
    base_url: String,
    api_key: String,
}

impl StreamRecorder {
    pub fn new(
        scheduler: Arc<ChannelScheduler>,
        set: ChannelSet,
        base_url: String,
        api_key: String,
    ) -> Self {
        Self {
            scheduler,
            set,
            base_url,
            api_key,
        }
    }

    pub fn record_usage(&self, usage: &UsageObservation) {
        self.scheduler
            .metrics(self.set)
            .record_usage(&self.base_url, &self.api_key, usage);
    }

    /// A failure after the 2xx was admitted: the stream broke mid-flight.
    pub fn record_stream_failure(&self) {
        self.scheduler
            .metrics(self.set)
            .record_failure(&self.base_url, &self.api_key);
    }
}

/// Debug verbosity for per-event logging, from `SSE_DEBUG_LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseDebug {
    Off,
    Summary,
    Full,
}

impl SseDebug {
    pub fn from_level(summary: bool, full: bool) -> Self {
        if full {
            SseDebug::Full
        } else if summary {
            SseDebug::Summary
        } else {
            SseDebug::Off
        }
    }
}

/// Spawn the relay task and build the client-facing SSE response.
pub fn relay_stream(
    upstream: reqwest::Response,
    mut mediator: Box<dyn EventMediator>,
    recorder: StreamRecorder,
    sse_debug: SseDebug,
) -> Response {
    let (tx, rx) = mpsc::channel::<Event>(64);

    tokio::spawn(async move {
        let stream = upstream.bytes_stream().eventsource();
        tokio::pin!(stream);
        let mut client_gone = false;

        loop {
            let next = tokio::time::timeout(SSE_IDLE_TIMEOUT, stream.next()).await;
            let event = match next {
                Err(_) => {
                    warn!("upstream SSE stream idle past {SSE_IDLE_TIMEOUT:?}");
                    if !client_gone {
                        let _ = tx.send(error_frame("stream idle timeout").into_sse()).await;
                    }
                    recorder.record_stream_failure();
                    return;
                }
                Ok(None) => break,
                Ok(Some(Err(err))) => {
                    warn!("upstream SSE stream failed: {err}");
                    if !client_gone {
                        let _ = tx.send(error_frame(&err.to_string()).into_sse()).await;
                    }
                    recorder.record_stream_failure();
                    return;
                }
                Ok(Some(Ok(event))) => event,
            };

            match sse_debug {
                SseDebug::Off => {}
                SseDebug::Summary => debug!(event = %event.event, "sse event"),
                SseDebug::Full => {
                    debug!(event = %event.event, data = %event.data, "sse event");
                }
            }

            for frame in mediator.on_event(&event) {
                if client_gone {
                    continue;
                }
                if tx.send(frame.into_sse()).await.is_err() {
                    // Keep consuming upstream so usage accounting finishes.
                    info!("client disconnected mid-stream, draining upstream");
                    client_gone = true;
                }
            }
        }

        let usage = mediator.final_usage();
        recorder.record_usage(&usage);
    });

    let body = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut response = Sse::new(body).keep_alive(KeepAlive::default()).into_response();
    let headers = response.headers_mut();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
    response
}
