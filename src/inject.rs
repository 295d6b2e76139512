use crate::config::{ConfigSnapshot, DEFAULT_PROMPT_TEMPLATE};
use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolFunctionSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunctionSpec,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    fn text(role: &str, content: String) -> Self {
        Self {
            role: role.to_string(),
            content: Some(Value::String(content)),
            tool_calls: None,
            tool_call_id: None,
            extra: Map::new(),
        }
    }
}

/// The chat-completions body with the fields the proxy acts on typed out and
/// everything else carried through untouched in `extra`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionBody {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-request record produced here and consumed by the router and the
/// response parser. Immutable once built.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client_key: String,
    pub requested_model: String,
    pub stream: bool,
    pub fc_active: bool,
    pub trigger_signal: String,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug)]
pub struct PreparedRequest {
    pub body: ChatCompletionBody,
    pub context: RequestContext,
}

/// Parses and rewrites an incoming request body.
///
/// When function calling applies, the teaching prompt becomes the first
/// system message and `tools`/`tool_choice` are stripped; prior tool-role
/// turns and assistant `tool_calls` turns are re-rendered as plain text so
/// the upstream model sees its own call history in the taught format.
pub fn prepare_request(
    snapshot: &ConfigSnapshot,
    client_key: &str,
    raw: Value,
) -> AppResult<PreparedRequest> {
    let mut body: ChatCompletionBody = serde_json::from_value(raw)
        .map_err(|err| AppError::invalid_request(format!("invalid chat completion body: {err}")))?;
    if body.model.trim().is_empty() {
        return Err(AppError::invalid_request("model must not be empty").with_param("model"));
    }
    if body.messages.is_empty() {
        return Err(AppError::invalid_request("messages must not be empty").with_param("messages"));
    }

    let features = snapshot.features();
    let trigger = snapshot.trigger_signal.as_str();

    if features.convert_developer_to_system {
        for message in &mut body.messages {
            if message.role == "developer" {
                message.role = "system".to_string();
            }
        }
    }

    represent_tool_history(&mut body.messages, trigger);

    let tools = body.tools.clone().unwrap_or_default();
    let fc_active = features.enable_function_calling && !tools.is_empty();

    if fc_active {
        let template = features
            .prompt_template
            .as_deref()
            .unwrap_or(DEFAULT_PROMPT_TEMPLATE);
        let mut prompt = render_prompt(template, &tools, trigger);
        prompt.push_str(&tool_choice_clause(body.tool_choice.as_ref()));
        body.messages.insert(0, ChatMessage::text("system", prompt));
    }

    // The upstream has no native tool support either way.
    if body.tools.is_some() && !fc_active {
        tracing::info!("function calling disabled, dropping tools from request");
    }
    body.tools = None;
    body.tool_choice = None;

    let context = RequestContext {
        client_key: client_key.to_string(),
        requested_model: body.model.clone(),
        stream: body.stream.unwrap_or(false),
        fc_active,
        trigger_signal: trigger.to_string(),
        tools,
    };

    Ok(PreparedRequest { body, context })
}

fn render_prompt(template: &str, tools: &[ToolSpec], trigger: &str) -> String {
    template
        .replace("{tools_list}", &render_tools_list(tools))
        .replace("{trigger_signal}", trigger)
}

fn render_tools_list(tools: &[ToolSpec]) -> String {
    let mut out = String::new();
    for tool in tools {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!("## {}\n", tool.function.name));
        if let Some(description) = &tool.function.description {
            if !description.trim().is_empty() {
                out.push_str(description.trim());
                out.push('\n');
            }
        }
        let parameters = tool
            .function
            .parameters
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "{}".to_string());
        out.push_str(&format!("Parameters (JSON Schema): {parameters}\n"));
    }
    out
}

fn tool_choice_clause(tool_choice: Option<&Value>) -> String {
    match tool_choice {
        Some(Value::String(s)) if s == "none" => {
            "\n\n**IMPORTANT:** You are prohibited from using any tools in this round. Respond directly without the trigger signal.".to_string()
        }
        Some(Value::Object(obj)) => {
            let name = obj
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str());
            match name {
                Some(name) => format!(
                    "\n\n**IMPORTANT:** In this round you must use only the tool named `{name}`. Produce its arguments and invoke it in the specified format."
                ),
                None => String::new(),
            }
        }
        // "auto" and "required" need no extra instruction.
        _ => String::new(),
    }
}

/// Rewrites tool-role results and assistant `tool_calls` turns into plain
/// text. Tool results are correlated by looking back for the assistant turn
/// whose `tool_calls[*].id` matches; with no match the result content is
/// left untouched.
fn represent_tool_history(messages: &mut Vec<ChatMessage>, trigger: &str) {
    let mut call_index: HashMap<String, (String, String)> = HashMap::new();
    for message in messages.iter() {
        if message.role != "assistant" {
            continue;
        }
        for call in message.tool_calls.iter().flatten() {
            let id = call.get("id").and_then(|v| v.as_str());
            let name = call
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|v| v.as_str());
            if let (Some(id), Some(name)) = (id, name) {
                let arguments = call
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("{}");
                call_index.insert(id.to_string(), (name.to_string(), arguments.to_string()));
            }
        }
    }

    for message in messages.iter_mut() {
        if message.role == "tool" {
            let looked_up = message
                .tool_call_id
                .as_deref()
                .and_then(|id| call_index.get(id));
            let rewritten = match (looked_up, text_content(message.content.as_ref())) {
                (Some((name, arguments)), Some(content)) => Some(format!(
                    "Tool execution result:\n- Tool name: {name}\n- Arguments: {arguments}\n- Execution result:\n<tool_result>\n{content}\n</tool_result>"
                )),
                _ => None,
            };
            if let Some(text) = rewritten {
                message.content = Some(Value::String(text));
            }
            message.role = "user".to_string();
            message.tool_call_id = None;
        } else if message.role == "assistant" {
            let Some(calls) = message.tool_calls.take() else {
                continue;
            };
            if calls.is_empty() {
                continue;
            }
            let rendered = render_call_history(&calls, trigger);
            let combined = match text_content(message.content.as_ref()) {
                Some(existing) if !existing.trim().is_empty() => {
                    format!("{}\n{}", existing.trim_end(), rendered)
                }
                _ => rendered,
            };
            message.content = Some(Value::String(combined));
        }
    }
}

fn render_call_history(calls: &[Value], trigger: &str) -> String {
    let mut blocks = String::new();
    for call in calls {
        let name = call
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let arguments = call
            .get("function")
            .and_then(|f| f.get("arguments"))
            .and_then(|v| v.as_str())
            .unwrap_or("{}");
        blocks.push_str(&format!(
            "<tool_call>\n<name>{name}</name>\n<arguments>{arguments}</arguments>\n</tool_call>\n"
        ));
    }
    format!("{trigger}\n<tool_calls>\n{blocks}</tool_calls>")
}

fn text_content(content: Option<&Value>) -> Option<&str> {
    match content {
        Some(Value::String(s)) => Some(s.as_str()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, ClientAuthConfig, FeaturesConfig, ServerConfig};
    use serde_json::json;

    fn snapshot(features: FeaturesConfig) -> ConfigSnapshot {
        ConfigSnapshot::new(AppConfig {
            server: ServerConfig::default(),
            upstream_services: vec![crate::config::UpstreamService {
                name: "up".to_string(),
                base_url: "http://127.0.0.1:9".to_string(),
                api_key: "sk-upstream".to_string(),
                service_type: Default::default(),
                models: vec!["gpt-4".to_string()],
                priority: 0,
                is_default: true,
                description: String::new(),
            }],
            client_authentication: ClientAuthConfig {
                allowed_keys: vec!["sk-client".to_string()],
            },
            features,
        })
    }

    fn weather_request() -> Value {
        json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "weather?"}],
            "tools": [{
                "type": "function",
                "function": {
                    "name": "get_weather",
                    "description": "Get current weather",
                    "parameters": {"type": "object", "properties": {"city": {"type": "string"}}}
                }
            }]
        })
    }

    #[test]
    fn injects_teaching_prompt_as_first_system_message() {
        let snap = snapshot(FeaturesConfig::default());
        let prepared = prepare_request(&snap, "sk-client", weather_request()).unwrap();
        assert!(prepared.context.fc_active);
        let first = &prepared.body.messages[0];
        assert_eq!(first.role, "system");
        let prompt = first.content.as_ref().unwrap().as_str().unwrap();
        assert!(prompt.contains("get_weather"));
        assert!(prompt.contains(&snap.trigger_signal));
        assert!(prepared.body.tools.is_none());
        assert!(prepared.body.tool_choice.is_none());
    }

    #[test]
    fn pre_existing_system_messages_stay_after_injected_prompt() {
        let snap = snapshot(FeaturesConfig::default());
        let mut raw = weather_request();
        raw["messages"] = json!([
            {"role": "system", "content": "you are terse"},
            {"role": "user", "content": "weather?"}
        ]);
        let prepared = prepare_request(&snap, "sk-client", raw).unwrap();
        assert_eq!(prepared.body.messages[1].role, "system");
        assert_eq!(
            prepared.body.messages[1].content,
            Some(Value::String("you are terse".to_string()))
        );
    }

    #[test]
    fn no_tools_passes_through_without_injection() {
        let snap = snapshot(FeaturesConfig::default());
        let raw = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.5
        });
        let prepared = prepare_request(&snap, "sk-client", raw).unwrap();
        assert!(!prepared.context.fc_active);
        assert_eq!(prepared.body.messages.len(), 1);
        assert_eq!(
            prepared.body.extra.get("temperature"),
            Some(&json!(0.5))
        );
    }

    #[test]
    fn disabled_function_calling_strips_tools_without_injection() {
        let snap = snapshot(FeaturesConfig {
            enable_function_calling: false,
            ..FeaturesConfig::default()
        });
        let prepared = prepare_request(&snap, "sk-client", weather_request()).unwrap();
        assert!(!prepared.context.fc_active);
        assert_eq!(prepared.body.messages[0].role, "user");
        assert!(prepared.body.tools.is_none());
    }

    #[test]
    fn developer_role_is_remapped_when_enabled() {
        let snap = snapshot(FeaturesConfig::default());
        let raw = json!({
            "model": "gpt-4",
            "messages": [
                {"role": "developer", "content": "be brief"},
                {"role": "user", "content": "hi"}
            ]
        });
        let prepared = prepare_request(&snap, "sk-client", raw).unwrap();
        assert_eq!(prepared.body.messages[0].role, "system");
    }

    #[test]
    fn tool_result_is_correlated_with_prior_call() {
        let snap = snapshot(FeaturesConfig::default());
        let raw = json!({
            "model": "gpt-4",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": null, "tool_calls": [{
                    "id": "call_abc",
                    "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}
                }]},
                {"role": "tool", "tool_call_id": "call_abc", "content": "sunny, 21C"}
            ]
        });
        let prepared = prepare_request(&snap, "sk-client", raw).unwrap();
        let assistant = &prepared.body.messages[1];
        let text = assistant.content.as_ref().unwrap().as_str().unwrap();
        assert!(text.contains(&snap.trigger_signal));
        assert!(text.contains("<name>get_weather</name>"));
        assert!(text.contains("<arguments>{\"city\":\"Paris\"}</arguments>"));
        assert!(assistant.tool_calls.is_none());

        let result = &prepared.body.messages[2];
        assert_eq!(result.role, "user");
        let text = result.content.as_ref().unwrap().as_str().unwrap();
        assert!(text.contains("Tool name: get_weather"));
        assert!(text.contains("sunny, 21C"));
    }

    #[test]
    fn unmatched_tool_result_content_is_untouched() {
        let snap = snapshot(FeaturesConfig::default());
        let raw = json!({
            "model": "gpt-4",
            "messages": [
                {"role": "tool", "tool_call_id": "call_missing", "content": "orphan result"},
                {"role": "user", "content": "continue"}
            ]
        });
        let prepared = prepare_request(&snap, "sk-client", raw).unwrap();
        assert_eq!(prepared.body.messages[0].role, "user");
        assert_eq!(
            prepared.body.messages[0].content,
            Some(Value::String("orphan result".to_string()))
        );
    }

    #[test]
    fn tool_choice_none_adds_prohibition() {
        let snap = snapshot(FeaturesConfig::default());
        let mut raw = weather_request();
        raw["tool_choice"] = json!("none");
        let prepared = prepare_request(&snap, "sk-client", raw).unwrap();
        let prompt = prepared.body.messages[0]
            .content
            .as_ref()
            .unwrap()
            .as_str()
            .unwrap();
        assert!(prompt.contains("prohibited"));
    }

    #[test]
    fn tool_choice_required_is_accepted_and_ignored() {
        let snap = snapshot(FeaturesConfig::default());
        let mut raw = weather_request();
        raw["tool_choice"] = json!("required");
        let prepared = prepare_request(&snap, "sk-client", raw).unwrap();
        let prompt = prepared.body.messages[0]
            .content
            .as_ref()
            .unwrap()
            .as_str()
            .unwrap();
        assert!(!prompt.contains("IMPORTANT"));
    }

    #[test]
    fn injection_is_deterministic() {
        let snap = snapshot(FeaturesConfig::default());
        let a = prepare_request(&snap, "sk-client", weather_request()).unwrap();
        let b = prepare_request(&snap, "sk-client", weather_request()).unwrap();
        assert_eq!(
            serde_json::to_string(&a.body).unwrap(),
            serde_json::to_string(&b.body).unwrap()
        );
    }

    #[test]
    fn rejects_malformed_body() {
        let snap = snapshot(FeaturesConfig::default());
        let err = prepare_request(&snap, "sk-client", json!({"messages": "nope"})).unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
    }
}
