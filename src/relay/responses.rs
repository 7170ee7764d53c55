//! Responses-dialect stream mediation.

use super::{EventMediator, OutFrame};
use crate::sched::UsageObservation;
use meridian_schema::ClaudeUsage;
use meridian_schema::openai::events;
use meridian_usage_core::{
    OutputAccumulator, UsageEstimate, estimate_request_tokens, patch_responses_usage,
};
use serde_json::Value;

/// Text-bearing delta event types whose payloads feed token estimation.
const DELTA_EVENT_TYPES: &[&str] = &[
    events::OUTPUT_TEXT_DELTA,
    events::FUNCTION_CALL_ARGUMENTS_DELTA,
    events::REASONING_SUMMARY_TEXT_DELTA,
    events::OUTPUT_JSON_DELTA,
    events::AUDIO_TRANSCRIPT_DELTA,
];

pub struct ResponsesMediator {
    effective_model: String,
    low_quality: bool,
    input_estimate: u64,
    output: OutputAccumulator,
    /// Native Claude cache fields seen anywhere in the stream. Only these
    /// make input counters authoritative; OpenAI's
    /// `input_tokens_details.cached_tokens` does not.
    has_claude_cache: bool,
    usage_seen: bool,
    observed_input: u64,
    observed_output: u64,
}

impl ResponsesMediator {
    pub fn new(effective_model: &str, low_quality: bool, request_body: &Value) -> Self {
        Self {
            effective_model: effective_model.to_string(),
            low_quality,
            input_estimate: estimate_request_tokens(request_body),
            output: OutputAccumulator::new(),
            has_claude_cache: false,
            usage_seen: false,
            observed_input: 0,
            observed_output: 0,
        }
    }

    fn estimate(&self) -> UsageEstimate {
        UsageEstimate {
            input_tokens: self.input_estimate.max(1),
            output_tokens: self.output.estimated_tokens().max(1),
        }
    }

    fn note_claude_cache(&mut self, usage: &Value) {
        if let Ok(parsed) = serde_json::from_value::<ClaudeUsage>(usage.clone())
            && parsed.has_cache_tokens()
        {
            self.has_claude_cache = true;
        }
    }

    fn patch_completed_usage(&mut self, slot: &mut Value) {
        self.note_claude_cache(slot);
        self.usage_seen = true;

        let estimate = self.estimate();
        patch_responses_usage(slot, &estimate, self.low_quality, self.has_claude_cache);

        if let Some(input) = slot.get("input_tokens").and_then(Value::as_u64) {
            self.observed_input = input;
        }
        if let Some(output) = slot.get("output_tokens").and_then(Value::as_u64) {
            self.observed_output = output;
        }
    }
}

impl EventMediator for ResponsesMediator {
    fn on_event(&mut self, event: &eventsource_stream::Event) -> Vec<OutFrame> {
        if event.data.is_empty() {
            return Vec::new();
        }
        if event.data == "[DONE]" {
            return vec![OutFrame::new(Some(event.event.as_str()), "[DONE]")];
        }
        let Ok(mut data) = serde_json::from_str::<Value>(&event.data) else {
            return vec![OutFrame::new(Some(event.event.as_str()), event.data.clone())];
        };

        let kind = data
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(event.event.as_str())
            .to_string();

        if DELTA_EVENT_TYPES.contains(&kind.as_str()) {
            if let Some(delta) = data.get("delta").and_then(Value::as_str) {
                self.output.push(delta);
            }
            return vec![OutFrame::json(Some(&kind), &data)];
        }

        if kind == events::RESPONSE_COMPLETED {
            if let Some(slot) = data
                .get_mut("response")
                .and_then(|r| r.get_mut("usage"))
                .filter(|v| v.is_object())
            {
                self.patch_completed_usage(slot);
            }
            return vec![OutFrame::json(Some(&kind), &data)];
        }

        // Track Claude cache markers on any other usage-bearing event.
        let usage = data
            .get("usage")
            .or_else(|| data.get("response").and_then(|r| r.get("usage")))
            .filter(|v| v.is_object())
            .cloned();
        if let Some(usage) = usage {
            self.note_claude_cache(&usage);
        }
        vec![OutFrame::json(Some(&kind), &data)]
    }

    fn final_usage(&self) -> UsageObservation {
        let estimate = self.estimate();
        let (input_tokens, output_tokens) = if self.usage_seen {
            (self.observed_input, self.observed_output)
        } else {
            (estimate.input_tokens, estimate.output_tokens)
        };
        UsageObservation {
            model: self.effective_model.clone(),
            input_tokens,
            output_tokens,
            cost_cents: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(name: &str, data: String) -> eventsource_stream::Event {
        eventsource_stream::Event {
            event: name.to_string(),
            data,
            id: String::new(),
            retry: None,
        }
    }

    fn mediator(low_quality: bool) -> ResponsesMediator {
        ResponsesMediator::new("gpt-5", low_quality, &json!({ "input": "hello there" }))
    }

    fn data_of(frame: &OutFrame) -> Value {
        serde_json::from_str(&frame.data).expect("frame json")
    }

    #[test]
    fn placeholder_completed_usage_is_patched_from_collected_text() {
        let mut m = mediator(false);
        m.on_event(&event(
            "response.output_text.delta",
            json!({ "type": "response.output_text.delta", "delta": "twelve chars" }).to_string(),
        ));

        let frames = m.on_event(&event(
            "response.completed",
            json!({ "type": "response.completed",
                    "response": { "usage": { "input_tokens": 0, "output_tokens": 0 } } })
            .to_string(),
        ));
        let out = data_of(&frames[0]);
        let usage = &out["response"]["usage"];
        assert!(usage["input_tokens"].as_u64().unwrap() > 0);
        assert_eq!(usage["output_tokens"], 3, "12 chars -> 3 tokens");
        assert_eq!(
            usage["total_tokens"].as_u64().unwrap(),
            usage["input_tokens"].as_u64().unwrap() + 3
        );
    }

    #[test]
    fn openai_cached_tokens_do_not_block_patching() {
        let mut m = mediator(false);
        let frames = m.on_event(&event(
            "response.completed",
            json!({ "type": "response.completed",
                    "response": { "usage": {
                        "input_tokens": 1, "output_tokens": 0,
                        "input_tokens_details": { "cached_tokens": 900 } } } })
            .to_string(),
        ));
        let usage = data_of(&frames[0])["response"]["usage"].clone();
        assert!(usage["input_tokens"].as_u64().unwrap() > 1);
    }

    #[test]
    fn claude_cache_fields_pin_input_tokens() {
        let mut m = mediator(false);
        let frames = m.on_event(&event(
            "response.completed",
            json!({ "type": "response.completed",
                    "response": { "usage": {
                        "input_tokens": 1, "output_tokens": 0,
                        "cache_read_input_tokens": 2048 } } })
            .to_string(),
        ));
        let usage = data_of(&frames[0])["response"]["usage"].clone();
        assert_eq!(usage["input_tokens"], 1, "claude cache pins input");
        assert!(usage["output_tokens"].as_u64().unwrap() > 0);
    }

    #[test]
    fn plausible_usage_survives_unless_low_quality() {
        let completed = json!({ "type": "response.completed",
                "response": { "usage": { "input_tokens": 640, "output_tokens": 52 } } });

        let mut m = mediator(false);
        let frames = m.on_event(&event("response.completed", completed.to_string()));
        let usage = data_of(&frames[0])["response"]["usage"].clone();
        assert_eq!(usage["input_tokens"], 640);
        assert_eq!(usage["output_tokens"], 52);

        let mut m = mediator(true);
        m.on_event(&event(
            "response.output_text.delta",
            json!({ "type": "response.output_text.delta", "delta": "abcd" }).to_string(),
        ));
        let frames = m.on_event(&event("response.completed", completed.to_string()));
        let usage = data_of(&frames[0])["response"]["usage"].clone();
        assert_eq!(usage["output_tokens"], 1, "low quality patches anyway");
    }

    #[test]
    fn done_marker_relays_verbatim() {
        let mut m = mediator(false);
        let frames = m.on_event(&event("message", "[DONE]".to_string()));
        assert_eq!(frames[0].data, "[DONE]");
    }
}
