//! Messages-dialect stream mediation.

use super::{EventMediator, OutFrame};
use crate::sched::UsageObservation;
use meridian_schema::claude::events;
use meridian_usage_core::{
    OutputAccumulator, UsageEstimate, UsageSnapshot, estimate_request_tokens, patch_claude_usage,
};
use serde_json::Value;
use uuid::Uuid;

pub struct MessagesMediator {
    effective_model: String,
    low_quality: bool,
    input_estimate: u64,
    output: OutputAccumulator,
    usage_seen: bool,
    usage_fake: bool,
    observed_input: u64,
    observed_output: u64,
}

impl MessagesMediator {
    pub fn new(effective_model: &str, low_quality: bool, request_body: &Value) -> Self {
        Self {
            effective_model: effective_model.to_string(),
            low_quality,
            input_estimate: estimate_request_tokens(request_body),
            output: OutputAccumulator::new(),
            usage_seen: false,
            usage_fake: false,
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

    fn observe_usage(&mut self, data: &Value) {
        if let Some(snapshot) = UsageSnapshot::from_event(data) {
            // The fake verdict is settled at first observation (normally
            // message_start): later deltas carry partial usage objects and
            // must not re-flag a stream whose opening counters were real.
            if !self.usage_seen {
                self.usage_fake = snapshot.fake;
            } else if snapshot.usage.has_cache_tokens() {
                self.usage_fake = false;
            }
            self.usage_seen = true;
            if let Some(input) = snapshot.usage.input_tokens {
                self.observed_input = input;
            }
            if let Some(output) = snapshot.usage.output_tokens {
                self.observed_output = output;
            }
        }
    }

    /// Rewrite the usage object at `slot` when the observed values are
    /// placeholders (or unconditionally on low-quality channels).
    fn patch_usage_slot(&mut self, slot: &mut Value) {
        let force = self.low_quality;
        if !(self.usage_fake || force) {
            return;
        }
        let estimate = self.estimate();
        if patch_claude_usage(slot, &estimate, force) {
            self.usage_fake = false;
            if let Some(input) = slot.get("input_tokens").and_then(Value::as_u64) {
                self.observed_input = input;
            }
            if let Some(output) = slot.get("output_tokens").and_then(Value::as_u64) {
                self.observed_output = output;
            }
        }
    }

    fn patch_message_start(&self, data: &mut Value) {
        let Some(message) = data.get_mut("message") else {
            return;
        };
        let id_missing = message
            .get("id")
            .and_then(Value::as_str)
            .is_none_or(str::is_empty);
        if id_missing {
            message["id"] = Value::String(format!("msg_{}", Uuid::new_v4().simple()));
        }
        if !self.effective_model.is_empty() {
            message["model"] = Value::String(self.effective_model.clone());
        }
    }

    fn collect_delta_text(&mut self, data: &Value) {
        let Some(delta) = data.get("delta") else {
            return;
        };
        if let Some(text) = delta.get("text").and_then(Value::as_str) {
            self.output.push(text);
        }
        if let Some(partial) = delta.get("partial_json").and_then(Value::as_str) {
            self.output.push(partial);
        }
    }
}

impl EventMediator for MessagesMediator {
    fn on_event(&mut self, event: &eventsource_stream::Event) -> Vec<OutFrame> {
        if event.data.is_empty() {
            return Vec::new();
        }
        let Ok(mut data) = serde_json::from_str::<Value>(&event.data) else {
            // Unparseable payloads relay untouched.
            return vec![OutFrame::new(Some(event.event.as_str()), event.data.clone())];
        };

        let kind = data
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(event.event.as_str())
            .to_string();

        match kind.as_str() {
            events::MESSAGE_START => {
                self.patch_message_start(&mut data);
                self.observe_usage(&data);
                if let Some(slot) = data
                    .get_mut("message")
                    .and_then(|m| m.get_mut("usage"))
                    .filter(|v| v.is_object())
                    && self.low_quality
                {
                    // Low-quality upstreams get their opening counters
                    // rewritten too; a later delta will carry the final ones.
                    let estimate = self.estimate();
                    patch_claude_usage(slot, &estimate, true);
                }
                vec![OutFrame::json(Some(&kind), &data)]
            }

            events::CONTENT_BLOCK_DELTA => {
                self.collect_delta_text(&data);
                vec![OutFrame::json(Some(&kind), &data)]
            }

            events::MESSAGE_DELTA => {
                self.observe_usage(&data);
                if let Some(slot) = data.get_mut("usage").filter(|v| v.is_object()) {
                    self.patch_usage_slot(slot);
                }
                vec![OutFrame::json(Some(&kind), &data)]
            }

            events::MESSAGE_STOP => {
                let mut frames = Vec::new();
                if !self.usage_seen {
                    // No usage anywhere in the stream: synthesize one
                    // before the stop so clients still get accounting.
                    let estimate = self.estimate();
                    self.observed_input = estimate.input_tokens;
                    self.observed_output = estimate.output_tokens;
                    self.usage_seen = true;
                    let injected = serde_json::json!({
                        "type": "message_delta",
                        "delta": {},
                        "usage": {
                            "input_tokens": estimate.input_tokens,
                            "output_tokens": estimate.output_tokens,
                        }
                    });
                    frames.push(OutFrame::json(Some(events::MESSAGE_DELTA), &injected));
                } else {
                    self.observe_usage(&data);
                    if let Some(slot) = data.get_mut("usage").filter(|v| v.is_object()) {
                        self.patch_usage_slot(slot);
                    }
                }
                frames.push(OutFrame::json(Some(&kind), &data));
                frames
            }

            _ => vec![OutFrame::json(Some(&kind), &data)],
        }
    }

    fn final_usage(&self) -> UsageObservation {
        let estimate = self.estimate();
        let (input_tokens, output_tokens) = if self.usage_seen && !self.usage_fake {
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

    fn event(name: &str, data: &Value) -> eventsource_stream::Event {
        eventsource_stream::Event {
            event: name.to_string(),
            data: data.to_string(),
            id: String::new(),
            retry: None,
        }
    }

    fn mediator() -> MessagesMediator {
        MessagesMediator::new(
            "claude-sonnet-4",
            false,
            &json!({ "model": "claude-sonnet-4", "messages": [{ "role": "user", "content": "hi" }] }),
        )
    }

    fn data_of(frame: &OutFrame) -> Value {
        serde_json::from_str(&frame.data).expect("frame json")
    }

    #[test]
    fn missing_usage_injects_one_message_delta_before_stop() {
        let mut m = mediator();

        let start = m.on_event(&event(
            "message_start",
            &json!({ "type": "message_start", "message": { "id": "msg_up", "role": "assistant" } }),
        ));
        assert_eq!(start.len(), 1);

        let delta = m.on_event(&event(
            "content_block_delta",
            &json!({ "type": "content_block_delta", "index": 0,
                     "delta": { "type": "text_delta", "text": "hello" } }),
        ));
        assert_eq!(delta.len(), 1);

        let stop = m.on_event(&event("message_stop", &json!({ "type": "message_stop" })));
        assert_eq!(stop.len(), 2, "injected delta plus the stop");
        assert_eq!(stop[0].event.as_deref(), Some("message_delta"));
        let injected = data_of(&stop[0]);
        assert!(injected["usage"]["input_tokens"].as_u64().unwrap() > 0);
        assert!(injected["usage"]["output_tokens"].as_u64().unwrap() > 0);
        assert_eq!(stop[1].event.as_deref(), Some("message_stop"));

        let usage = m.final_usage();
        assert!(usage.input_tokens > 0);
        assert!(usage.output_tokens > 0);
    }

    #[test]
    fn fake_usage_is_rewritten_on_the_next_usage_bearing_event() {
        let mut m = mediator();

        m.on_event(&event(
            "message_start",
            &json!({ "type": "message_start",
                     "message": { "id": "msg_1", "usage": { "input_tokens": 0, "output_tokens": 0 } } }),
        ));
        m.on_event(&event(
            "content_block_delta",
            &json!({ "type": "content_block_delta",
                     "delta": { "type": "text_delta", "text": "some longer output text here" } }),
        ));

        let frames = m.on_event(&event(
            "message_delta",
            &json!({ "type": "message_delta", "delta": { "stop_reason": "end_turn" },
                     "usage": { "output_tokens": 1 } }),
        ));
        let patched = data_of(&frames[0]);
        assert!(patched["usage"]["output_tokens"].as_u64().unwrap() > 1);

        // No injection on stop: usage was observed.
        let stop = m.on_event(&event("message_stop", &json!({ "type": "message_stop" })));
        assert_eq!(stop.len(), 1);
    }

    #[test]
    fn plausible_usage_flows_through_untouched() {
        let mut m = mediator();
        m.on_event(&event(
            "message_start",
            &json!({ "type": "message_start",
                     "message": { "id": "msg_1", "usage": { "input_tokens": 1200, "output_tokens": 1 } } }),
        ));
        let frames = m.on_event(&event(
            "message_delta",
            &json!({ "type": "message_delta", "delta": {}, "usage": { "output_tokens": 87 } }),
        ));
        let out = data_of(&frames[0]);
        assert_eq!(out["usage"]["output_tokens"], 87);

        let usage = m.final_usage();
        assert_eq!(usage.input_tokens, 1200);
        assert_eq!(usage.output_tokens, 87);
    }

    #[test]
    fn low_quality_channels_patch_even_plausible_values() {
        let mut m = MessagesMediator::new("claude-sonnet-4", true, &json!({ "messages": [] }));
        m.on_event(&event(
            "content_block_delta",
            &json!({ "type": "content_block_delta", "delta": { "text": "abcdefgh" } }),
        ));
        let frames = m.on_event(&event(
            "message_delta",
            &json!({ "type": "message_delta", "delta": {}, "usage": { "input_tokens": 500, "output_tokens": 300 } }),
        ));
        let out = data_of(&frames[0]);
        assert_eq!(out["usage"]["output_tokens"], 2, "8 chars -> 2 tokens");
        assert_ne!(out["usage"]["input_tokens"], 500);
    }

    #[test]
    fn message_start_gets_id_and_model_patched() {
        let mut m = mediator();
        let frames = m.on_event(&event(
            "message_start",
            &json!({ "type": "message_start", "message": { "id": "", "model": "wrong-name" } }),
        ));
        let out = data_of(&frames[0]);
        let id = out["message"]["id"].as_str().unwrap();
        assert!(id.starts_with("msg_") && id.len() > 4);
        assert_eq!(out["message"]["model"], "claude-sonnet-4");
    }

    #[test]
    fn cache_bearing_usage_is_never_fake() {
        let mut m = mediator();
        m.on_event(&event(
            "message_start",
            &json!({ "type": "message_start",
                     "message": { "id": "m", "usage": {
                         "input_tokens": 1, "output_tokens": 1,
                         "cache_read_input_tokens": 4096 } } }),
        ));
        let frames = m.on_event(&event(
            "message_delta",
            &json!({ "type": "message_delta", "delta": {}, "usage": { "output_tokens": 1 } }),
        ));
        // Not treated as fake: flows through unchanged.
        let out = data_of(&frames[0]);
        assert_eq!(out["usage"]["output_tokens"], 1);
    }

    #[test]
    fn unparseable_payloads_relay_verbatim() {
        let mut m = mediator();
        let raw = eventsource_stream::Event {
            event: "message_delta".to_string(),
            data: "not json".to_string(),
            id: String::new(),
            retry: None,
        };
        let frames = m.on_event(&raw);
        assert_eq!(frames[0].data, "not json");
    }
}
