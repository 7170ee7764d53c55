//! Upstream error-body schema shared by all three wire dialects.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Error envelope as returned by Claude-, OpenAI- and Gemini-compatible
/// upstreams, plus the aggregator dialects that wrap them.
#[derive(Debug, Deserialize, Serialize)]
pub struct UpstreamErrorBody {
    #[serde(rename = "error")]
    #[serde(default)]
    pub inner: UpstreamErrorObject,

    #[serde(flatten)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct UpstreamErrorObject {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Named `r#type` because `type` is a Rust keyword.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,

    /// Aggregators (new-api and friends) nest the original provider error
    /// here, either as a plain string or as an object with a `message`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_error: Option<UpstreamNestedError>,

    /// Some gateways report a `detail` string instead of `message`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,

    #[serde(flatten)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum UpstreamNestedError {
    Text(String),
    Object {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,

        #[serde(flatten)]
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        extra: BTreeMap<String, Value>,
    },
}

impl UpstreamErrorBody {
    /// Every human-readable fragment worth keyword-scanning, in the order
    /// `error.message`, `error.upstream_error`, `error.detail`, `error.type`.
    pub fn searchable_texts(&self) -> Vec<&str> {
        let mut texts = Vec::new();
        if let Some(message) = self.inner.message.as_deref() {
            texts.push(message);
        }
        match &self.inner.upstream_error {
            Some(UpstreamNestedError::Text(text)) => texts.push(text),
            Some(UpstreamNestedError::Object { message, .. }) => {
                if let Some(message) = message.as_deref() {
                    texts.push(message);
                }
            }
            None => {}
        }
        if let Some(detail) = self.inner.detail.as_ref().and_then(Value::as_str) {
            texts.push(detail);
        }
        if let Some(kind) = self.inner.r#type.as_deref() {
            texts.push(kind);
        }
        texts
    }
}
