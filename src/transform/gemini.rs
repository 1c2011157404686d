use serde_json::{Map, Value, json};

use super::{Capabilities, Transformer};
use crate::context::RequestContext;
use crate::error::Result;

/// Unified (OpenAI-shaped) form <-> the Gemini generateContent dialect.
/// Only the request-in / response-out legs matter: Gemini is never an
/// ingress dialect here, it is something providers speak.
pub struct GeminiTransformer;

impl Transformer for GeminiTransformer {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            request_out: false,
            request_in: true,
            response_out: true,
            response_in: false,
            auth: false,
        }
    }

    fn request_in(&self, message: Value, _ctx: &RequestContext) -> Result<(Value, Option<Value>)> {
        Ok((unified_request_to_gemini(message), None))
    }

    fn response_out(&self, message: Value, _ctx: &RequestContext) -> Result<Value> {
        Ok(gemini_response_to_unified(message))
    }
}

fn unified_request_to_gemini(message: Value) -> Value {
    let Value::Object(mut body) = message else {
        return message;
    };

    let mut contents: Vec<Value> = Vec::new();
    let mut system_parts: Vec<Value> = Vec::new();

    for entry in body
        .remove("messages")
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default()
    {
        let role = entry.get("role").and_then(Value::as_str).unwrap_or("user");
        let text = entry
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match role {
            "system" => {
                if !text.is_empty() {
                    system_parts.push(json!({ "text": text }));
                }
            }
            "assistant" => {
                let mut parts: Vec<Value> = Vec::new();
                if !text.is_empty() {
                    parts.push(json!({ "text": text }));
                }
                for call in entry
                    .get("tool_calls")
                    .and_then(Value::as_array)
                    .map(|calls| calls.as_slice())
                    .unwrap_or(&[])
                {
                    let name = call
                        .pointer("/function/name")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    if name.is_empty() {
                        continue;
                    }
                    let args_raw = call
                        .pointer("/function/arguments")
                        .and_then(Value::as_str)
                        .unwrap_or("{}");
                    let args =
                        serde_json::from_str::<Value>(args_raw).unwrap_or(Value::Object(Map::new()));
                    parts.push(json!({ "functionCall": { "name": name, "args": args } }));
                }
                contents.push(json!({ "role": "model", "parts": parts }));
            }
            "tool" => {
                contents.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "name": entry.get("tool_call_id").cloned().unwrap_or(Value::Null),
                            "response": { "content": text },
                        }
                    }]
                }));
            }
            _ => {
                contents.push(json!({ "role": "user", "parts": [{ "text": text }] }));
            }
        }
    }

    let mut out = Map::new();
    out.insert("contents".to_string(), Value::Array(contents));
    if !system_parts.is_empty() {
        out.insert(
            "systemInstruction".to_string(),
            json!({ "parts": system_parts }),
        );
    }

    let mut generation_config = Map::new();
    if let Some(max_tokens) = body.remove("max_tokens") {
        generation_config.insert("maxOutputTokens".to_string(), max_tokens);
    }
    if let Some(temperature) = body.remove("temperature") {
        generation_config.insert("temperature".to_string(), temperature);
    }
    if !generation_config.is_empty() {
        out.insert(
            "generationConfig".to_string(),
            Value::Object(generation_config),
        );
    }

    if let Some(tools) = body.remove("tools").and_then(|v| v.as_array().cloned()) {
        let declarations: Vec<Value> = tools
            .iter()
            .filter_map(|tool| tool.get("function"))
            .map(|function| {
                json!({
                    "name": function.get("name").cloned().unwrap_or(Value::Null),
                    "description": function.get("description").cloned().unwrap_or(Value::Null),
                    "parameters": function.get("parameters").cloned().unwrap_or(Value::Null),
                })
            })
            .collect();
        if !declarations.is_empty() {
            out.insert(
                "tools".to_string(),
                json!([{ "functionDeclarations": declarations }]),
            );
        }
    }

    Value::Object(out)
}

fn gemini_finish_reason_to_unified(reason: Option<&str>) -> &'static str {
    match reason {
        Some("MAX_TOKENS") => "length",
        Some("SAFETY") => "content_filter",
        _ => "stop",
    }
}

fn gemini_response_to_unified(message: Value) -> Value {
    let candidate = message
        .pointer("/candidates/0")
        .cloned()
        .unwrap_or(Value::Null);

    let mut text = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    for part in candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(|parts| parts.as_slice())
        .unwrap_or(&[])
    {
        if let Some(fragment) = part.get("text").and_then(Value::as_str) {
            text.push_str(fragment);
        }
        if let Some(call) = part.get("functionCall") {
            tool_calls.push(json!({
                "id": format!("call_{}", tool_calls.len()),
                "type": "function",
                "function": {
                    "name": call.get("name").cloned().unwrap_or(Value::Null),
                    "arguments": call
                        .get("args")
                        .map(|args| args.to_string())
                        .unwrap_or_else(|| "{}".to_string()),
                }
            }));
        }
    }

    let finish_reason = if tool_calls.is_empty() {
        gemini_finish_reason_to_unified(candidate.get("finishReason").and_then(Value::as_str))
    } else {
        "tool_calls"
    };

    let mut choice_message = Map::new();
    choice_message.insert("role".to_string(), json!("assistant"));
    choice_message.insert("content".to_string(), json!(text));
    if !tool_calls.is_empty() {
        choice_message.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }

    json!({
        "object": "chat.completion",
        "model": message.get("modelVersion").cloned().unwrap_or(Value::Null),
        "choices": [{
            "index": 0,
            "message": Value::Object(choice_message),
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": message
                .pointer("/usageMetadata/promptTokenCount")
                .cloned()
                .unwrap_or(json!(0)),
            "completion_tokens": message
                .pointer("/usageMetadata/candidatesTokenCount")
                .cloned()
                .unwrap_or(json!(0)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_maps_system_tools_and_generation_config() {
        let unified = json!({
            "model": "gemini-2.5-pro",
            "max_tokens": 64,
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"}
            ],
            "tools": [{
                "type": "function",
                "function": {"name": "ls", "description": "list", "parameters": {"type": "object"}}
            }]
        });
        let out = unified_request_to_gemini(unified);
        assert_eq!(out["systemInstruction"]["parts"][0]["text"], "be terse");
        assert_eq!(out["contents"][0]["role"], "user");
        assert_eq!(out["generationConfig"]["maxOutputTokens"], 64);
        assert_eq!(out["tools"][0]["functionDeclarations"][0]["name"], "ls");
    }

    #[test]
    fn response_maps_function_calls_to_tool_calls() {
        let gemini = json!({
            "candidates": [{
                "index": 0,
                "finishReason": "STOP",
                "content": {"role": "model", "parts": [
                    {"text": "running"},
                    {"functionCall": {"name": "grep", "args": {"q": "x"}}}
                ]}
            }],
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 3, "totalTokenCount": 10}
        });
        let out = gemini_response_to_unified(gemini);
        assert_eq!(out["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(
            out["choices"][0]["message"]["tool_calls"][0]["function"]["name"],
            "grep"
        );
        assert_eq!(out["usage"]["prompt_tokens"], 7);
    }

    #[test]
    fn max_tokens_finish_reason_maps_to_length() {
        let gemini = json!({
            "candidates": [{
                "finishReason": "MAX_TOKENS",
                "content": {"role": "model", "parts": [{"text": "cut"}]}
            }]
        });
        let out = gemini_response_to_unified(gemini);
        assert_eq!(out["choices"][0]["finish_reason"], "length");
    }
}
