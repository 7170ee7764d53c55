//! Heuristic token estimation.
//!
//! Used only when an upstream omits (or fakes) usage accounting. The
//! estimates feed billing-adjacent observability, so they aim for the right
//! order of magnitude rather than tokenizer fidelity.

use serde_json::Value;

/// Rough chars-per-token divisor for mixed prose and code.
const CHARS_PER_TOKEN: u64 = 4;

/// Fixed per-message framing overhead (role markers, separators).
const PER_MESSAGE_OVERHEAD: u64 = 3;

/// Estimate the token count of a text fragment. Non-empty text always
/// counts as at least one token.
pub fn estimate_text_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    let chars = text.chars().count() as u64;
    chars.div_ceil(CHARS_PER_TOKEN).max(1)
}

/// Estimate the input tokens of a request body.
///
/// Walks the Messages-dialect fields (`system`, `messages[].content`
/// including tool_use inputs and tool_result payloads, `tools[]`) and the
/// Responses-dialect ones (`instructions`, `input`).
pub fn estimate_request_tokens(body: &Value) -> u64 {
    let mut total = 0u64;

    if let Some(system) = body.get("system") {
        total += estimate_content_tokens(system);
    }
    if let Some(instructions) = body.get("instructions") {
        total += estimate_content_tokens(instructions);
    }
    if let Some(input) = body.get("input") {
        total += estimate_content_tokens(input);
    }

    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        for message in messages {
            total += PER_MESSAGE_OVERHEAD;
            if let Some(content) = message.get("content") {
                total += estimate_content_tokens(content);
            }
        }
    }

    if let Some(contents) = body.get("contents").and_then(Value::as_array) {
        for content in contents {
            total += PER_MESSAGE_OVERHEAD;
            if let Some(parts) = content.get("parts") {
                total += estimate_content_tokens(parts);
            }
        }
    }
    if let Some(instruction) = body.get("systemInstruction")
        && let Some(parts) = instruction.get("parts")
    {
        total += estimate_content_tokens(parts);
    }

    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        for tool in tools {
            total += estimate_json_tokens(tool);
        }
    }

    total.max(1)
}

fn estimate_content_tokens(content: &Value) -> u64 {
    match content {
        Value::String(text) => estimate_text_tokens(text),
        Value::Array(blocks) => blocks.iter().map(estimate_block_tokens).sum(),
        other => estimate_json_tokens(other),
    }
}

fn estimate_block_tokens(block: &Value) -> u64 {
    if let Some(text) = block.get("text").and_then(Value::as_str) {
        return estimate_text_tokens(text);
    }
    if let Some(input) = block.get("input") {
        return estimate_json_tokens(input);
    }
    if let Some(content) = block.get("content") {
        return estimate_content_tokens(content);
    }
    estimate_json_tokens(block)
}

fn estimate_json_tokens(value: &Value) -> u64 {
    match serde_json::to_string(value) {
        Ok(serialized) => estimate_text_tokens(&serialized),
        Err(_) => 0,
    }
}
