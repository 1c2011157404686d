//! Request handlers for the ingress and admin endpoints.

use std::collections::HashMap;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use super::{RelayState, next_request_id};
use crate::context::{RequestContext, priority_from_tag};
use crate::dispatch::DispatchOutcome;
use crate::error::RelayError;
use crate::providers::{DialectFamily, ProviderConfig};
use crate::scenario::CUSTOM_MODEL;

fn error_response(err: &RelayError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = json!({ "error": err.to_string() });
    if let Some(code) = err.code() {
        body["code"] = json!(code);
    }
    (status, Json(body)).into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| headers.get(*name).and_then(|value| value.to_str().ok()))
}

fn build_context(headers: &HeaderMap, payload: &Value, dialect: DialectFamily) -> RequestContext {
    let request_id = header_str(headers, &["x-request-id"])
        .map(str::to_string)
        .unwrap_or_else(next_request_id);
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0);
    let mut ctx = RequestContext::new(request_id, dialect, now);
    ctx.priority = priority_from_tag(header_str(headers, &["x-ccr-priority"]));
    ctx.session_id = header_str(headers, &["x-session-id", "session-id"]).map(str::to_string);
    ctx.conversation_id =
        header_str(headers, &["x-conversation-id", "conversation-id"]).map(str::to_string);
    ctx.stream = payload
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    ctx
}

async fn ingress(
    state: RelayState,
    headers: HeaderMap,
    payload: Value,
    dialect: DialectFamily,
) -> Response {
    let Some(model) = payload.get("model").and_then(Value::as_str).map(str::to_string) else {
        return error_response(&RelayError::InvalidRequest {
            reason: "missing required field `model`".to_string(),
        });
    };

    let ctx = build_context(&headers, &payload, dialect);
    match state.dispatcher.handle(ctx, &model, payload).await {
        Ok(DispatchOutcome::Json(value)) => Json(value).into_response(),
        Ok(DispatchOutcome::Stream(body)) => {
            let mut response = Response::new(Body::from_stream(body));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("text/event-stream"),
            );
            response.headers_mut().insert(
                header::CACHE_CONTROL,
                header::HeaderValue::from_static("no-cache"),
            );
            response
        }
        Err(err) => error_response(&err),
    }
}

pub(super) async fn messages(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    ingress(state, headers, payload, DialectFamily::Anthropic).await
}

pub(super) async fn chat_completions(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    ingress(state, headers, payload, DialectFamily::Openai).await
}

pub(super) async fn models(State(state): State<RelayState>) -> Json<Value> {
    let mut data: Vec<Value> = vec![json!({
        "id": CUSTOM_MODEL,
        "object": "model",
        "owned_by": "relay",
    })];
    for (provider, model) in state.registry.all_models() {
        data.push(json!({
            "id": format!("{provider},{model}"),
            "object": "model",
            "owned_by": provider,
        }));
    }
    Json(json!({ "object": "list", "data": data }))
}

pub(super) async fn health() -> Json<Value> {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0);
    Json(json!({ "status": "ok", "timestamp": timestamp }))
}

pub(super) async fn metrics(
    State(state): State<RelayState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let window_ms = params
        .get("timeWindow")
        .and_then(|value| value.parse::<u64>().ok());
    let provider = params.get("provider").map(String::as_str);
    let summary = state.tracker.aggregate(window_ms, provider);
    Json(serde_json::to_value(summary).unwrap_or_else(|_| json!({})))
}

pub(super) async fn metrics_recent(
    State(state): State<RelayState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let limit = params
        .get("limit")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(50);
    let records = state.tracker.recent(limit);
    Json(serde_json::to_value(records).unwrap_or_else(|_| json!([])))
}

pub(super) async fn pool_status(State(state): State<RelayState>) -> Json<Value> {
    Json(serde_json::to_value(state.pool.snapshot()).unwrap_or_else(|_| json!([])))
}

pub(super) async fn pool_queue(State(state): State<RelayState>) -> Json<Value> {
    Json(serde_json::to_value(state.pool.queue_snapshot()).unwrap_or_else(|_| json!([])))
}

pub(super) async fn pool_config(State(state): State<RelayState>) -> Json<Value> {
    Json(serde_json::to_value(&state.settings.model_pool).unwrap_or_else(|_| json!({})))
}

pub(super) async fn pool_reset_circuit_breakers(State(state): State<RelayState>) -> Json<Value> {
    let reset = state.pool.reset_circuit_breakers();
    Json(json!({ "reset": reset }))
}

pub(super) async fn pool_clear_queue(State(state): State<RelayState>) -> Json<Value> {
    let cleared = state.pool.clear_queues();
    Json(json!({ "cleared": cleared }))
}

pub(super) async fn endpoint_status(State(state): State<RelayState>) -> Json<Value> {
    Json(serde_json::to_value(state.endpoints.snapshot()).unwrap_or_else(|_| json!([])))
}

pub(super) async fn endpoint_reset_circuit_breakers(
    State(state): State<RelayState>,
) -> Json<Value> {
    let reset = state.endpoints.reset_circuit_breakers();
    Json(json!({ "reset": reset }))
}

fn redact_keys(mut provider: ProviderConfig) -> ProviderConfig {
    for key in provider.api_keys.iter_mut() {
        *key = "redacted".to_string();
    }
    provider
}

pub(super) async fn list_providers(State(state): State<RelayState>) -> Json<Vec<ProviderConfig>> {
    Json(state.registry.list().into_iter().map(redact_keys).collect())
}

pub(super) async fn get_provider(
    State(state): State<RelayState>,
    Path(id): Path<String>,
) -> Response {
    match state.registry.get(&id) {
        Ok(provider) => Json(redact_keys(provider)).into_response(),
        Err(err) => error_response(&err),
    }
}

pub(super) async fn upsert_provider(
    State(state): State<RelayState>,
    Json(provider): Json<ProviderConfig>,
) -> Response {
    let replaced = state.registry.upsert(provider);
    let status = if replaced {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    (status, Json(json!({ "ok": true }))).into_response()
}

pub(super) async fn delete_provider(
    State(state): State<RelayState>,
    Path(id): Path<String>,
) -> Response {
    if state.registry.remove(&id) {
        Json(json!({ "ok": true })).into_response()
    } else {
        error_response(&RelayError::ProviderNotFound { name: id })
    }
}

pub(super) async fn toggle_provider(
    State(state): State<RelayState>,
    Path(id): Path<String>,
) -> Response {
    match state.registry.toggle(&id) {
        Ok(enabled) => Json(json!({ "enabled": enabled })).into_response(),
        Err(err) => error_response(&err),
    }
}
