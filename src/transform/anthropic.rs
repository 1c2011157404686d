use serde_json::{Map, Value, json};

use super::{Capabilities, Transformer};
use crate::context::RequestContext;
use crate::error::{RelayError, Result};

/// Anthropic Messages dialect <-> the unified (OpenAI-shaped) form.
///
/// Carries enough structure through both legs that a request surviving
/// dialect -> unified -> dialect keeps its messages, roles, tool calls, and
/// reasoning budget.
pub struct AnthropicTransformer;

impl Transformer for AnthropicTransformer {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            request_out: true,
            request_in: true,
            response_out: true,
            response_in: true,
            auth: false,
        }
    }

    fn request_out(&self, message: Value, _ctx: &RequestContext) -> Result<Value> {
        anthropic_request_to_unified(message)
    }

    fn request_in(&self, message: Value, _ctx: &RequestContext) -> Result<(Value, Option<Value>)> {
        Ok((unified_request_to_anthropic(message)?, None))
    }

    fn response_out(&self, message: Value, _ctx: &RequestContext) -> Result<Value> {
        anthropic_response_to_unified(message)
    }

    fn response_in(&self, message: Value, _ctx: &RequestContext) -> Result<Value> {
        unified_response_to_anthropic(message)
    }
}

fn object(value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(RelayError::InvalidRequest {
            reason: format!("expected a JSON object, got {other}"),
        }),
    }
}

fn anthropic_request_to_unified(message: Value) -> Result<Value> {
    let mut body = object(message)?;
    let mut out = Map::new();
    let mut messages: Vec<Value> = Vec::new();

    if let Some(system) = body.remove("system") {
        let text = match system {
            Value::String(text) => text,
            Value::Array(blocks) => blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        };
        if !text.is_empty() {
            messages.push(json!({"role": "system", "content": text}));
        }
    }

    for entry in body
        .remove("messages")
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default()
    {
        let role = entry
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or("user")
            .to_string();
        match entry.get("content") {
            Some(Value::String(text)) => {
                messages.push(json!({"role": role, "content": text}));
            }
            Some(Value::Array(blocks)) => {
                push_unified_from_blocks(&mut messages, &role, blocks);
            }
            _ => messages.push(json!({"role": role, "content": ""})),
        }
    }
    out.insert("messages".to_string(), Value::Array(messages));

    if let Some(model) = body.remove("model") {
        out.insert("model".to_string(), model);
    }
    if let Some(max_tokens) = body.remove("max_tokens") {
        out.insert("max_tokens".to_string(), max_tokens);
    }
    if let Some(stream) = body.remove("stream") {
        out.insert("stream".to_string(), stream);
    }
    if let Some(temperature) = body.remove("temperature") {
        out.insert("temperature".to_string(), temperature);
    }

    if let Some(tools) = body.remove("tools").and_then(|v| v.as_array().cloned()) {
        let mapped: Vec<Value> = tools
            .into_iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.get("name").cloned().unwrap_or(Value::Null),
                        "description": tool.get("description").cloned().unwrap_or(Value::Null),
                        "parameters": tool.get("input_schema").cloned().unwrap_or(Value::Null),
                    }
                })
            })
            .collect();
        out.insert("tools".to_string(), Value::Array(mapped));
    }

    if let Some(thinking) = body.remove("thinking") {
        if let Some(budget) = thinking.get("budget_tokens").and_then(Value::as_u64) {
            out.insert("reasoning_budget_tokens".to_string(), json!(budget));
            out.insert(
                "reasoning_effort".to_string(),
                json!(effort_for_budget(budget)),
            );
        }
    }

    Ok(Value::Object(out))
}

fn push_unified_from_blocks(messages: &mut Vec<Value>, role: &str, blocks: &[Value]) {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    text_parts.push(text);
                }
            }
            Some("tool_use") => {
                tool_calls.push(json!({
                    "id": block.get("id").cloned().unwrap_or(Value::Null),
                    "type": "function",
                    "function": {
                        "name": block.get("name").cloned().unwrap_or(Value::Null),
                        "arguments": block
                            .get("input")
                            .map(|input| input.to_string())
                            .unwrap_or_default(),
                    }
                }));
            }
            Some("tool_result") => {
                let content = block
                    .get("content")
                    .map(render_tool_result_content)
                    .unwrap_or_default();
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": block.get("tool_use_id").cloned().unwrap_or(Value::Null),
                    "content": content,
                }));
            }
            _ => {}
        }
    }

    if text_parts.is_empty() && tool_calls.is_empty() {
        return;
    }
    let mut entry = Map::new();
    entry.insert("role".to_string(), json!(role));
    entry.insert("content".to_string(), json!(text_parts.join("\n")));
    if !tool_calls.is_empty() {
        entry.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }
    messages.push(Value::Object(entry));
}

fn render_tool_result_content(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

fn unified_request_to_anthropic(message: Value) -> Result<Value> {
    let mut body = object(message)?;
    let mut out = Map::new();
    let mut messages: Vec<Value> = Vec::new();

    for entry in body
        .remove("messages")
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default()
    {
        let role = entry.get("role").and_then(Value::as_str).unwrap_or("user");
        match role {
            "system" => {
                let text = entry
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                out.insert("system".to_string(), json!(text));
            }
            "tool" => {
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": entry.get("tool_call_id").cloned().unwrap_or(Value::Null),
                        "content": entry.get("content").cloned().unwrap_or(Value::Null),
                    }]
                }));
            }
            _ => {
                let mut blocks: Vec<Value> = Vec::new();
                if let Some(text) = entry.get("content").and_then(Value::as_str) {
                    if !text.is_empty() {
                        blocks.push(json!({"type": "text", "text": text}));
                    }
                }
                for call in entry
                    .get("tool_calls")
                    .and_then(Value::as_array)
                    .map(|calls| calls.as_slice())
                    .unwrap_or(&[])
                {
                    let arguments = call
                        .pointer("/function/arguments")
                        .and_then(Value::as_str)
                        .unwrap_or("{}");
                    let input: Value =
                        serde_json::from_str(arguments).unwrap_or(Value::Object(Map::new()));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.get("id").cloned().unwrap_or(Value::Null),
                        "name": call.pointer("/function/name").cloned().unwrap_or(Value::Null),
                        "input": input,
                    }));
                }
                if blocks.is_empty() {
                    blocks.push(json!({"type": "text", "text": ""}));
                }
                messages.push(json!({"role": role, "content": blocks}));
            }
        }
    }
    out.insert("messages".to_string(), Value::Array(messages));

    for key in ["model", "max_tokens", "stream", "temperature"] {
        if let Some(value) = body.remove(key) {
            out.insert(key.to_string(), value);
        }
    }

    if let Some(tools) = body.remove("tools").and_then(|v| v.as_array().cloned()) {
        let mapped: Vec<Value> = tools
            .into_iter()
            .map(|tool| {
                json!({
                    "name": tool.pointer("/function/name").cloned().unwrap_or(Value::Null),
                    "description": tool
                        .pointer("/function/description")
                        .cloned()
                        .unwrap_or(Value::Null),
                    "input_schema": tool
                        .pointer("/function/parameters")
                        .cloned()
                        .unwrap_or(Value::Null),
                })
            })
            .collect();
        out.insert("tools".to_string(), Value::Array(mapped));
    }

    if let Some(budget) = body
        .remove("reasoning_budget_tokens")
        .and_then(|v| v.as_u64())
    {
        body.remove("reasoning_effort");
        out.insert(
            "thinking".to_string(),
            json!({"type": "enabled", "budget_tokens": budget}),
        );
    }

    Ok(Value::Object(out))
}

fn anthropic_response_to_unified(message: Value) -> Result<Value> {
    let body = object(message)?;
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for block in body
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| blocks.as_slice())
        .unwrap_or(&[])
    {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    text_parts.push(text);
                }
            }
            Some("tool_use") => tool_calls.push(json!({
                "id": block.get("id").cloned().unwrap_or(Value::Null),
                "type": "function",
                "function": {
                    "name": block.get("name").cloned().unwrap_or(Value::Null),
                    "arguments": block
                        .get("input")
                        .map(|input| input.to_string())
                        .unwrap_or_default(),
                }
            })),
            _ => {}
        }
    }

    let finish_reason = match body.get("stop_reason").and_then(Value::as_str) {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        _ => "stop",
    };

    let mut choice_message = Map::new();
    choice_message.insert("role".to_string(), json!("assistant"));
    choice_message.insert("content".to_string(), json!(text_parts.join("")));
    if !tool_calls.is_empty() {
        choice_message.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }

    Ok(json!({
        "id": body.get("id").cloned().unwrap_or(Value::Null),
        "object": "chat.completion",
        "model": body.get("model").cloned().unwrap_or(Value::Null),
        "choices": [{
            "index": 0,
            "message": Value::Object(choice_message),
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": body.get("usage").and_then(|v| v.get("input_tokens")).cloned().unwrap_or(json!(0)),
            "completion_tokens": body.get("usage").and_then(|v| v.get("output_tokens")).cloned().unwrap_or(json!(0)),
        }
    }))
}

fn unified_response_to_anthropic(message: Value) -> Result<Value> {
    let body = object(message)?;
    let choice = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .cloned()
        .unwrap_or(Value::Null);

    let mut content: Vec<Value> = Vec::new();
    if let Some(text) = choice.pointer("/message/content").and_then(Value::as_str) {
        if !text.is_empty() {
            content.push(json!({"type": "text", "text": text}));
        }
    }
    for call in choice
        .pointer("/message/tool_calls")
        .and_then(Value::as_array)
        .map(|calls| calls.as_slice())
        .unwrap_or(&[])
    {
        let arguments = call
            .pointer("/function/arguments")
            .and_then(Value::as_str)
            .unwrap_or("{}");
        let input: Value = serde_json::from_str(arguments).unwrap_or(Value::Object(Map::new()));
        content.push(json!({
            "type": "tool_use",
            "id": call.get("id").cloned().unwrap_or(Value::Null),
            "name": call.pointer("/function/name").cloned().unwrap_or(Value::Null),
            "input": input,
        }));
    }

    let stop_reason = match choice.get("finish_reason").and_then(Value::as_str) {
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        _ => "end_turn",
    };

    Ok(json!({
        "id": body.get("id").cloned().unwrap_or(Value::Null),
        "type": "message",
        "role": "assistant",
        "model": body.get("model").cloned().unwrap_or(Value::Null),
        "content": content,
        "stop_reason": stop_reason,
        "usage": {
            "input_tokens": body.get("usage").and_then(|v| v.get("prompt_tokens")).cloned().unwrap_or(json!(0)),
            "output_tokens": body.get("usage").and_then(|v| v.get("completion_tokens")).cloned().unwrap_or(json!(0)),
        }
    }))
}

fn effort_for_budget(budget: u64) -> &'static str {
    if budget < 1_024 {
        "low"
    } else if budget <= 16_384 {
        "medium"
    } else {
        "high"
    }
}
