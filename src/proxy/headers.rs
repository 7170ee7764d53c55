//! Upstream request-header preparation.
//!
//! Inbound auth never crosses the proxy: headers are built fresh and the
//! chosen key is injected with the scheme its service type requires.

use crate::config::ServiceType;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};

const ANTHROPIC_VERSION: HeaderName = HeaderName::from_static("anthropic-version");
const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");
const X_GOOG_API_KEY: HeaderName = HeaderName::from_static("x-goog-api-key");

pub fn upstream_headers(service_type: ServiceType, api_key: &str, stream: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if stream {
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    }

    let key_value =
        HeaderValue::from_str(api_key).unwrap_or_else(|_| HeaderValue::from_static(""));
    match service_type {
        ServiceType::Claude => {
            headers.insert(X_API_KEY, key_value);
            headers.insert(ANTHROPIC_VERSION, HeaderValue::from_static("2023-06-01"));
        }
        ServiceType::Openai => {
            let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
                .unwrap_or_else(|_| HeaderValue::from_static(""));
            headers.insert(reqwest::header::AUTHORIZATION, bearer);
        }
        ServiceType::Gemini => {
            headers.insert(X_GOOG_API_KEY, key_value);
        }
    }
    headers
}
