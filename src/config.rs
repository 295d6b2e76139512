use crate::error::{AppError, AppResult};
use axum::http::StatusCode;
use rand::distributions::{Alphanumeric, DistString};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// System prompt used when `features.prompt_template` is not configured.
/// Any override must carry the same two placeholders.
pub const DEFAULT_PROMPT_TEMPLATE: &str = r#"You have access to external tools in this session. The available tools are:

{tools_list}

To invoke one or more tools, finish your visible reply first, then output the trigger signal followed immediately by an invocation block, exactly in this shape:

{trigger_signal}
<tool_calls>
<tool_call>
<name>TOOL_NAME</name>
<arguments>{"parameter": "value"}</arguments>
</tool_call>
</tool_calls>

Rules:
1. The <arguments> tag must contain exactly one JSON object matching the tool's parameter schema.
2. To invoke several tools at once, repeat the <tool_call> element inside the same <tool_calls> block.
3. Output the trigger signal only when you are actually invoking tools, and never mention it otherwise.
4. After </tool_calls>, stop. Do not produce any further text in that reply.
5. When a tool result is returned to you, use it to answer the user normally."#;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream_services: Vec<UpstreamService>,
    #[serde(default)]
    pub client_authentication: ClientAuthConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-request upstream timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout: default_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout.saturating_mul(1000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Openai,
    Anthropic,
    Google,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
        }
    }
}

impl Default for ServiceType {
    fn default() -> Self {
        Self::Openai
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamService {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub service_type: ServiceType,
    /// Advertised models. An entry of the form `alias:real` routes requests
    /// for `alias` and rewrites the outgoing model field to `real`.
    #[serde(default)]
    pub models: Vec<String>,
    /// Larger value wins. Ties break on `is_default`, then config order.
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub description: String,
}

impl UpstreamService {
    /// A channel without credentials or without models is configuration
    /// scaffolding, never routed to.
    pub fn is_placeholder(&self) -> bool {
        self.api_key.trim().is_empty() || self.models.iter().all(|m| m.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientAuthConfig {
    #[serde(default)]
    pub allowed_keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeaturesConfig {
    #[serde(default = "default_true")]
    pub enable_function_calling: bool,
    #[serde(default = "default_true")]
    pub convert_developer_to_system: bool,
    #[serde(default)]
    pub key_passthrough: bool,
    #[serde(default)]
    pub model_passthrough: bool,
    /// Must contain `{tools_list}` and `{trigger_signal}`.
    #[serde(default)]
    pub prompt_template: Option<String>,
    /// Fixed trigger token. When unset a fresh high-entropy token is
    /// generated each time a snapshot is built.
    #[serde(default)]
    pub trigger_signal: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            enable_function_calling: true,
            convert_developer_to_system: true,
            key_passthrough: false,
            model_passthrough: false,
            prompt_template: None,
            trigger_signal: None,
            log_level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_timeout_secs() -> u64 {
    180
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Splits a `alias:real` models entry. Plain entries return `None`.
pub fn split_alias(entry: &str) -> Option<(&str, &str)> {
    let (alias, real) = entry.split_once(':')?;
    if alias.trim().is_empty() || real.trim().is_empty() {
        return None;
    }
    Some((alias, real))
}

pub fn load_config(path: &str) -> AppResult<AppConfig> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "config_read_failed",
            format!("failed to read config file {path}: {err}"),
        )
    })?;
    let config: AppConfig = serde_yaml::from_str(&raw).map_err(|err| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "config_parse_failed",
            format!("failed to parse config file {path}: {err}"),
        )
    })?;
    config.validate().map_err(|err| {
        AppError::new(StatusCode::BAD_REQUEST, "config_invalid", err)
    })?;
    Ok(config)
}

pub fn config_path_from_env() -> String {
    std::env::var("TOOLGATE_CONFIG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "config.yaml".to_string())
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.upstream_services.is_empty() {
            return Err("upstream_services must not be empty".to_string());
        }

        let defaults = self
            .upstream_services
            .iter()
            .filter(|s| s.is_default)
            .count();
        if defaults > 1 {
            return Err("only one upstream service can be marked is_default".to_string());
        }

        let mut plain_models: HashSet<&str> = HashSet::new();
        let mut aliases: HashSet<&str> = HashSet::new();
        for service in &self.upstream_services {
            if service.name.trim().is_empty() {
                return Err("upstream service name must not be empty".to_string());
            }
            if !service.base_url.starts_with("http://") && !service.base_url.starts_with("https://")
            {
                return Err(format!(
                    "service '{}': base_url must start with http:// or https://",
                    service.name
                ));
            }
            let mut seen: HashSet<&str> = HashSet::new();
            for entry in &service.models {
                if entry.trim().is_empty() {
                    return Err(format!(
                        "service '{}': model name must not be empty",
                        service.name
                    ));
                }
                if !seen.insert(entry.as_str()) {
                    return Err(format!(
                        "service '{}': duplicate model entry '{}'",
                        service.name, entry
                    ));
                }
                if entry.contains(':') {
                    match split_alias(entry) {
                        Some((alias, _)) => {
                            aliases.insert(alias);
                        }
                        None => {
                            return Err(format!(
                                "service '{}': invalid alias entry '{}', both sides of ':' must be non-empty",
                                service.name, entry
                            ));
                        }
                    }
                } else {
                    plain_models.insert(entry.as_str());
                }
            }
        }
        let conflicts: Vec<&str> = aliases.intersection(&plain_models).copied().collect();
        if !conflicts.is_empty() {
            return Err(format!(
                "alias names conflict with plain model names: {}",
                conflicts.join(", ")
            ));
        }

        if !self.features.key_passthrough {
            if self.client_authentication.allowed_keys.is_empty() {
                return Err(
                    "client_authentication.allowed_keys must not be empty unless key_passthrough is enabled"
                        .to_string(),
                );
            }
            if self
                .client_authentication
                .allowed_keys
                .iter()
                .any(|k| k.trim().is_empty())
            {
                return Err("client API key must not be empty".to_string());
            }
        }

        if let Some(template) = &self.features.prompt_template {
            if !template.contains("{tools_list}") || !template.contains("{trigger_signal}") {
                return Err(
                    "prompt_template must contain {tools_list} and {trigger_signal} placeholders"
                        .to_string(),
                );
            }
        }
        if let Some(signal) = &self.features.trigger_signal {
            if signal.trim().is_empty() {
                return Err("trigger_signal must not be blank".to_string());
            }
            if signal.contains('\n') || signal.contains('\r') {
                return Err("trigger_signal must not contain line breaks".to_string());
            }
        }

        Ok(())
    }
}

/// Immutable per-load view shared by every in-flight request. A request
/// captures one snapshot at entry and keeps it until completion; admin saves
/// build a fresh snapshot and swap the pointer.
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub config: AppConfig,
    pub trigger_signal: String,
}

impl ConfigSnapshot {
    pub fn new(config: AppConfig) -> Self {
        let trigger_signal = config
            .features
            .trigger_signal
            .clone()
            .unwrap_or_else(generate_trigger_signal);
        Self {
            config,
            trigger_signal,
        }
    }

    pub fn features(&self) -> &FeaturesConfig {
        &self.config.features
    }

    pub fn services(&self) -> &[UpstreamService] {
        &self.config.upstream_services
    }

    /// Model names to expose on the listing endpoint. Alias entries are
    /// visible by their alias only.
    pub fn visible_models(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for service in self.services() {
            for entry in &service.models {
                let name = match split_alias(entry) {
                    Some((alias, _)) => alias,
                    None => entry.as_str(),
                };
                if !name.trim().is_empty() && !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        names
    }
}

fn generate_trigger_signal() -> String {
    let suffix = Alphanumeric.sample_string(&mut rand::thread_rng(), 20);
    format!("@@TOOLCALL_{suffix}@@")
}

/// Copy-on-write handle to the active snapshot. Readers clone the inner
/// `Arc` once per request; `swap` replaces it without disturbing requests
/// already running against the previous snapshot.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<ConfigSnapshot>>>,
}

impl ConfigHandle {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    pub async fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.inner.read().await.clone()
    }

    pub async fn swap(&self, next: ConfigSnapshot) {
        let mut guard = self.inner.write().await;
        *guard = Arc::new(next);
    }
}
