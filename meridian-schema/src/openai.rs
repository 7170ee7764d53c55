//! OpenAI Responses API usage and stream-event shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// SSE event types emitted by the Responses API.
pub mod events {
    pub const RESPONSE_CREATED: &str = "response.created";
    pub const RESPONSE_COMPLETED: &str = "response.completed";
    pub const OUTPUT_TEXT_DELTA: &str = "response.output_text.delta";
    pub const FUNCTION_CALL_ARGUMENTS_DELTA: &str = "response.function_call_arguments.delta";
    pub const REASONING_SUMMARY_TEXT_DELTA: &str = "response.reasoning_summary_text.delta";
    pub const OUTPUT_JSON_DELTA: &str = "response.output_json.delta";
    pub const AUDIO_TRANSCRIPT_DELTA: &str = "response.audio.transcript.delta";
    pub const ERROR: &str = "error";
}

/// Usage block carried by `response.completed`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ResponsesUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens_details: Option<ResponsesInputTokensDetails>,

    #[serde(flatten)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ResponsesInputTokensDetails {
    /// OpenAI prompt-cache hits. Distinct from Claude cache fields: a
    /// nonzero value here does not make the usage authoritative.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,

    #[serde(flatten)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl ResponsesUsage {
    pub fn cached_tokens(&self) -> u64 {
        self.input_tokens_details
            .as_ref()
            .and_then(|d| d.cached_tokens)
            .unwrap_or(0)
    }
}
