use crate::app::AppState;
use crate::auth::authenticate;
use crate::config::ConfigSnapshot;
use crate::error::{AppError, AppResult};
use crate::inject::{ChatCompletionBody, PreparedRequest, RequestContext, prepare_request};
use crate::parser::{
    DetectorEvent, ENVELOPE_CAP_BYTES, ExtractOutcome, StreamingDetector, extract_tool_calls,
    new_call_id,
};
use crate::routing::{ChannelRoute, resolve_channels};
use crate::upstream::{self, UpstreamCallError};
use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use metrics::counter;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

/// Service status summary. Mirrors what the admin surface reads; exposes
/// counts and flags, never keys.
pub async fn service_status(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.config.snapshot().await;
    let features = snapshot.features();
    Json(json!({
        "status": "toolgate is running",
        "config": {
            "upstream_services_count": snapshot.services().len(),
            "client_keys_count": snapshot.config.client_authentication.allowed_keys.len(),
            "models_count": snapshot.visible_models().len(),
            "features": {
                "function_calling": features.enable_function_calling,
                "convert_developer_to_system": features.convert_developer_to_system,
                "key_passthrough": features.key_passthrough,
                "model_passthrough": features.model_passthrough,
                "log_level": features.log_level,
            }
        }
    }))
}

pub async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let snapshot = state.config.snapshot().await;
    authenticate(&headers, &snapshot)?;
    let data: Vec<Value> = snapshot
        .visible_models()
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": 1677610602,
                "owned_by": "toolgate",
                "root": id,
                "parent": null
            })
        })
        .collect();
    Ok(Json(json!({ "object": "list", "data": data })).into_response())
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    counter!("toolgate_requests_total", "endpoint" => "chat_completions").increment(1);
    let snapshot = state.config.snapshot().await;
    let auth = authenticate(&headers, &snapshot)?;
    let prepared = prepare_request(&snapshot, &auth.client_key, body)?;
    let routes = resolve_channels(&snapshot, &prepared.context.requested_model)?;
    tracing::debug!(
        model = %prepared.context.requested_model,
        channels = routes.len(),
        stream = prepared.context.stream,
        fc_active = prepared.context.fc_active,
        "routing resolved"
    );

    if prepared.context.stream {
        forward_stream(state, snapshot, prepared, routes).await
    } else {
        forward_nonstream(state, snapshot, prepared, routes).await
    }
}

fn upstream_auth_key<'a>(
    snapshot: &ConfigSnapshot,
    context: &'a RequestContext,
    route: &'a ChannelRoute,
) -> &'a str {
    if snapshot.features().key_passthrough {
        &context.client_key
    } else {
        &route.service.api_key
    }
}

fn body_payload(body: &ChatCompletionBody) -> AppResult<Value> {
    serde_json::to_value(body).map_err(|err| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "request_encode_failed",
            err.to_string(),
        )
        .with_type("server_error")
    })
}

/// Terminal client errors are returned to the caller exactly as the upstream
/// produced them.
fn verbatim_upstream_response(err: UpstreamCallError) -> Response {
    let status = err.status.unwrap_or(StatusCode::BAD_GATEWAY);
    let body = match err.body {
        Some(body) if !body.is_empty() => body,
        _ => json!({
            "error": {
                "message": err.message,
                "type": "upstream_error",
                "code": "upstream_error"
            }
        })
        .to_string(),
    };
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

async fn forward_nonstream(
    state: AppState,
    snapshot: Arc<ConfigSnapshot>,
    prepared: PreparedRequest,
    routes: Vec<ChannelRoute>,
) -> AppResult<Response> {
    let PreparedRequest { mut body, context } = prepared;
    let timeout_ms = snapshot.config.server.timeout_ms();
    let total = routes.len();
    let mut last_error: Option<UpstreamCallError> = None;

    for (attempt, route) in routes.into_iter().enumerate() {
        body.model = route.upstream_model.clone();
        let payload = body_payload(&body)?;
        let auth_key = upstream_auth_key(&snapshot, &context, &route);
        tracing::info!(
            channel = %route.service.name,
            service_type = route.service.service_type.as_str(),
            priority = route.service.priority,
            attempt = attempt + 1,
            total,
            model = %route.upstream_model,
            "attempting upstream channel"
        );
        counter!("toolgate_upstream_attempts_total", "channel" => route.service.name.clone())
            .increment(1);

        match upstream::call_chat_completions(
            &state.http,
            &route.service,
            auth_key,
            &payload,
            timeout_ms,
        )
        .await
        {
            Ok(value) => {
                let value = if context.fc_active {
                    convert_nonstream_response(value, &context)
                } else {
                    value
                };
                return Ok(Json(value).into_response());
            }
            Err(err) if err.is_terminal_client_error() => {
                tracing::warn!(
                    channel = %route.service.name,
                    status = ?err.status,
                    "terminal client error, not trying further channels"
                );
                return Ok(verbatim_upstream_response(err));
            }
            Err(err) if err.is_retryable() => {
                tracing::warn!(
                    channel = %route.service.name,
                    error = %err,
                    "retryable upstream failure, trying next channel"
                );
                counter!("toolgate_failovers_total").increment(1);
                last_error = Some(err);
            }
            Err(err) => {
                return Err(AppError::upstream_error(err.message));
            }
        }
    }

    match last_error {
        Some(err) => Err(err.into_app_error()),
        None => Err(AppError::no_upstream(&context.requested_model)),
    }
}

/// Rewrites a complete upstream response: pre-trigger prose becomes the
/// visible content, envelope calls become `tool_calls`. Texts without the
/// trigger (and garbled envelopes) pass through unchanged.
fn convert_nonstream_response(mut value: Value, context: &RequestContext) -> Value {
    let Some(content) = value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
    else {
        return value;
    };

    match extract_tool_calls(&content, &context.trigger_signal) {
        ExtractOutcome::NoTrigger => value,
        ExtractOutcome::Garbled => {
            tracing::warn!("trigger emitted without a parsable envelope, returning as prose");
            value
        }
        ExtractOutcome::ToolCalls { prose, calls } => {
            let tool_calls: Vec<Value> = calls
                .into_iter()
                .map(|call| {
                    json!({
                        "id": new_call_id(),
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": call.arguments
                        }
                    })
                })
                .collect();
            tracing::debug!(count = tool_calls.len(), "extracted tool calls from response");
            if let Some(choice) = value
                .get_mut("choices")
                .and_then(|c| c.get_mut(0))
            {
                choice["message"]["content"] = Value::String(prose);
                choice["message"]["tool_calls"] = Value::Array(tool_calls);
                choice["finish_reason"] = Value::String("tool_calls".to_string());
            }
            value
        }
    }
}

async fn forward_stream(
    state: AppState,
    snapshot: Arc<ConfigSnapshot>,
    prepared: PreparedRequest,
    routes: Vec<ChannelRoute>,
) -> AppResult<Response> {
    let PreparedRequest { mut body, context } = prepared;
    let timeout_ms = snapshot.config.server.timeout_ms();
    let mut last_error: Option<UpstreamCallError> = None;

    // Failover is only possible while nothing has been written downstream;
    // after a channel accepts the stream it is the only one used.
    for route in routes {
        body.model = route.upstream_model.clone();
        let payload = body_payload(&body)?;
        let auth_key = upstream_auth_key(&snapshot, &context, &route);
        tracing::info!(
            channel = %route.service.name,
            service_type = route.service.service_type.as_str(),
            priority = route.service.priority,
            model = %route.upstream_model,
            "streaming from upstream channel"
        );
        counter!("toolgate_upstream_attempts_total", "channel" => route.service.name.clone())
            .increment(1);

        match upstream::call_chat_completions_stream(
            &state.http,
            &route.service,
            auth_key,
            &payload,
            timeout_ms,
        )
        .await
        {
            Ok(upstream_resp) => {
                let (tx, rx) = mpsc::channel::<Event>(64);
                let relay_context = context.clone();
                tokio::spawn(async move {
                    let tx_done = tx.clone();
                    if let Err(err) = relay_stream(upstream_resp, relay_context, tx).await {
                        tracing::warn!(error = %err, "stream relay ended abnormally");
                        let _ = tx_done.send(Event::default().data("[DONE]")).await;
                    }
                });
                let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
                return Ok(Sse::new(stream).into_response());
            }
            Err(err) if err.is_terminal_client_error() => {
                return Ok(verbatim_upstream_response(err));
            }
            Err(err) if err.is_retryable() => {
                tracing::warn!(
                    channel = %route.service.name,
                    error = %err,
                    "retryable failure before first byte, trying next channel"
                );
                counter!("toolgate_failovers_total").increment(1);
                last_error = Some(err);
            }
            Err(err) => return Err(AppError::upstream_error(err.message)),
        }
    }

    match last_error {
        Some(err) => Err(err.into_app_error()),
        None => Err(AppError::no_upstream(&context.requested_model)),
    }
}

/// Stamps for synthesized chunks: one id/created pair per response, the
/// model as the client requested it.
struct ChunkStamp {
    id: String,
    model: String,
    created: i64,
}

impl ChunkStamp {
    fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
        }
    }

    fn base(&self) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
        })
    }

    fn content_chunk(&self, text: &str) -> Value {
        let mut chunk = self.base();
        chunk["choices"] = json!([{
            "index": 0,
            "delta": { "content": text },
            "finish_reason": null
        }]);
        chunk
    }

    fn tool_call_header_chunk(&self, index: usize, id: &str, name: &str) -> Value {
        let mut chunk = self.base();
        chunk["choices"] = json!([{
            "index": 0,
            "delta": {
                "tool_calls": [{
                    "index": index,
                    "id": id,
                    "type": "function",
                    "function": { "name": name, "arguments": "" }
                }]
            },
            "finish_reason": null
        }]);
        chunk
    }

    fn tool_call_arguments_chunk(&self, index: usize, arguments: &str) -> Value {
        let mut chunk = self.base();
        chunk["choices"] = json!([{
            "index": 0,
            "delta": {
                "tool_calls": [{
                    "index": index,
                    "function": { "arguments": arguments }
                }]
            },
            "finish_reason": null
        }]);
        chunk
    }

    fn finish_chunk(&self, reason: &str) -> Value {
        let mut chunk = self.base();
        chunk["choices"] = json!([{
            "index": 0,
            "delta": {},
            "finish_reason": reason
        }]);
        chunk
    }

    fn usage_chunk(&self, usage: Value) -> Value {
        let mut chunk = self.base();
        chunk["choices"] = json!([]);
        chunk["usage"] = usage;
        chunk
    }
}

async fn send_json(tx: &mpsc::Sender<Event>, chunk: Value) -> bool {
    tx.send(Event::default().data(chunk.to_string())).await.is_ok()
}

/// Pumps the upstream SSE body to the client. Without active function
/// calling every frame passes through verbatim; with it, content deltas run
/// through the detector and synthesized chunks replace the upstream framing.
async fn relay_stream(
    upstream_resp: reqwest::Response,
    context: RequestContext,
    tx: mpsc::Sender<Event>,
) -> Result<(), String> {
    let mut stream = upstream_resp.bytes_stream().eventsource();

    if !context.fc_active {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(frame) => {
                    if tx.send(Event::default().data(frame.data)).await.is_err() {
                        // Client went away; dropping the stream cancels the
                        // upstream request.
                        return Ok(());
                    }
                }
                Err(err) => return Err(err.to_string()),
            }
        }
        return Ok(());
    }

    let stamp = ChunkStamp::new(&context.requested_model);
    let mut detector = StreamingDetector::new(&context.trigger_signal, ENVELOPE_CAP_BYTES);
    let mut usage_chunk: Option<Value> = None;
    let mut finished = false;
    let mut relay_error: Option<String> = None;

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                relay_error = Some(err.to_string());
                break;
            }
        };
        let data = frame.data.trim().to_string();
        if data == "[DONE]" {
            break;
        }
        if data.is_empty() {
            continue;
        }
        let Ok(chunk) = serde_json::from_str::<Value>(&data) else {
            continue;
        };
        if let Some(usage) = chunk.get("usage") {
            if !usage.is_null() {
                usage_chunk = Some(usage.clone());
            }
        }
        let delta_content = chunk
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if !delta_content.is_empty() {
            for event in detector.feed(delta_content) {
                if !emit_detector_event(&tx, &stamp, event, &mut finished).await {
                    return Ok(());
                }
            }
        }
        if finished {
            // Envelope closed: nothing further from this upstream matters.
            break;
        }
    }

    if !finished {
        for event in detector.finish() {
            if !emit_detector_event(&tx, &stamp, event, &mut finished).await {
                return Ok(());
            }
        }
    }
    if let Some(usage) = usage_chunk {
        if !send_json(&tx, stamp.usage_chunk(usage)).await {
            return Ok(());
        }
    }
    let _ = tx.send(Event::default().data("[DONE]")).await;
    match relay_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn emit_detector_event(
    tx: &mpsc::Sender<Event>,
    stamp: &ChunkStamp,
    event: DetectorEvent,
    finished: &mut bool,
) -> bool {
    match event {
        DetectorEvent::Content(text) => send_json(tx, stamp.content_chunk(&text)).await,
        DetectorEvent::ToolCall {
            index,
            id,
            name,
            arguments,
        } => {
            if !send_json(tx, stamp.tool_call_header_chunk(index, &id, &name)).await {
                return false;
            }
            send_json(tx, stamp.tool_call_arguments_chunk(index, &arguments)).await
        }
        DetectorEvent::Finish(reason) => {
            *finished = true;
            send_json(tx, stamp.finish_chunk(reason.as_str())).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::convert_nonstream_response;
    use crate::inject::RequestContext;
    use serde_json::json;

    fn context(trigger: &str) -> RequestContext {
        RequestContext {
            client_key: "sk-client".to_string(),
            requested_model: "gpt-4".to_string(),
            stream: false,
            fc_active: true,
            trigger_signal: trigger.to_string(),
            tools: Vec::new(),
        }
    }

    fn upstream_response(content: &str) -> serde_json::Value {
        json!({
            "id": "chatcmpl-x",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop"
            }]
        })
    }

    #[test]
    fn converts_envelope_to_tool_calls() {
        let trigger = "@@T@@";
        let content = format!(
            "Sure.{trigger}<tool_calls><tool_call><name>get_weather</name><arguments>{{\"city\":\"Paris\"}}</arguments></tool_call></tool_calls>"
        );
        let value = convert_nonstream_response(upstream_response(&content), &context(trigger));
        let choice = &value["choices"][0];
        assert_eq!(choice["message"]["content"], json!("Sure."));
        assert_eq!(choice["finish_reason"], json!("tool_calls"));
        let calls = choice["message"]["tool_calls"].as_array().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["function"]["name"], json!("get_weather"));
        assert_eq!(
            calls[0]["function"]["arguments"],
            json!("{\"city\":\"Paris\"}")
        );
        assert!(calls[0]["id"].as_str().unwrap().starts_with("call_"));
    }

    #[test]
    fn prose_response_is_untouched() {
        let original = upstream_response("just words");
        let value = convert_nonstream_response(original.clone(), &context("@@T@@"));
        assert_eq!(value, original);
    }

    #[test]
    fn garbled_envelope_is_returned_as_prose() {
        let content = "text @@T@@ but no xml here";
        let original = upstream_response(content);
        let value = convert_nonstream_response(original.clone(), &context("@@T@@"));
        assert_eq!(value, original);
    }

    #[test]
    fn null_content_is_untouched() {
        let original = json!({
            "choices": [{ "message": { "role": "assistant", "content": null } }]
        });
        let value = convert_nonstream_response(original.clone(), &context("@@T@@"));
        assert_eq!(value, original);
    }
}
