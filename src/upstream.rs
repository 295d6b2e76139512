use crate::config::UpstreamService;
use crate::error::AppError;
use axum::http::StatusCode;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Timeout,
    Http,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("upstream call failed ({kind:?}, status {status:?}): {message}")]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    /// Raw upstream body for HTTP failures, forwarded verbatim on terminal
    /// client errors.
    pub body: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    fn network(message: String) -> Self {
        Self {
            kind: UpstreamErrorKind::Network,
            status: None,
            body: None,
            message,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self {
                kind: UpstreamErrorKind::Timeout,
                status: None,
                body: None,
                message: err.to_string(),
            }
        } else {
            Self::network(err.to_string())
        }
    }

    /// 429 and 5xx responses, plus anything that failed before a usable
    /// response arrived, may succeed on another channel. A success status
    /// here means the body was empty or undecodable.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            UpstreamErrorKind::Network | UpstreamErrorKind::Timeout => true,
            UpstreamErrorKind::Http => match self.status {
                Some(status) => {
                    status == StatusCode::TOO_MANY_REQUESTS
                        || status.is_server_error()
                        || status.is_success()
                }
                None => false,
            },
        }
    }

    /// A non-429 4xx means the request itself is bad; every channel would
    /// reject it the same way.
    pub fn is_terminal_client_error(&self) -> bool {
        matches!(
            (self.kind, self.status),
            (UpstreamErrorKind::Http, Some(status))
                if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS
        )
    }

    /// Maps the last recorded failure to the client-facing error after the
    /// attempt list is exhausted.
    pub fn into_app_error(self) -> AppError {
        match (self.kind, self.status) {
            (UpstreamErrorKind::Timeout, _) => {
                AppError::upstream_timeout("upstream request timed out")
            }
            (_, Some(StatusCode::TOO_MANY_REQUESTS)) => {
                AppError::rate_limited("rate limit exceeded on all upstream channels")
            }
            _ => AppError::upstream_error(format!(
                "all upstream channels failed: {}",
                self.message
            )),
        }
    }
}

/// POSTs a chat completion and decodes the JSON body. Non-2xx statuses and
/// undecodable bodies are errors carrying the status for classification.
pub async fn call_chat_completions(
    client: &reqwest::Client,
    service: &UpstreamService,
    auth_key: &str,
    body: &Value,
    timeout_ms: u64,
) -> Result<Value, UpstreamCallError> {
    let resp = send_chat_completions(client, service, auth_key, body, timeout_ms, false).await?;
    let status = resp.status();
    let text = resp.text().await.map_err(UpstreamCallError::from_reqwest)?;
    if text.trim().is_empty() {
        return Err(UpstreamCallError {
            kind: UpstreamErrorKind::Http,
            status: Some(status),
            body: None,
            message: "upstream returned an empty body".to_string(),
        });
    }
    serde_json::from_str(&text).map_err(|err| UpstreamCallError {
        kind: UpstreamErrorKind::Http,
        status: Some(status),
        body: Some(text),
        message: format!("upstream returned invalid JSON: {err}"),
    })
}

/// Opens a streaming chat completion. The response body is handed back
/// unconsumed; the caller iterates its byte chunks.
pub async fn call_chat_completions_stream(
    client: &reqwest::Client,
    service: &UpstreamService,
    auth_key: &str,
    body: &Value,
    timeout_ms: u64,
) -> Result<reqwest::Response, UpstreamCallError> {
    send_chat_completions(client, service, auth_key, body, timeout_ms, true).await
}

async fn send_chat_completions(
    client: &reqwest::Client,
    service: &UpstreamService,
    auth_key: &str,
    body: &Value,
    timeout_ms: u64,
    streaming: bool,
) -> Result<reqwest::Response, UpstreamCallError> {
    let url = join_url(&service.base_url, "/v1/chat/completions");
    let accept = if streaming {
        "text/event-stream"
    } else {
        "application/json"
    };
    let resp = client
        .post(url)
        .timeout(Duration::from_millis(timeout_ms))
        .bearer_auth(auth_key)
        .header("Accept", accept)
        .json(body)
        .send()
        .await
        .map_err(UpstreamCallError::from_reqwest)?;

    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let code = extract_error_code(&text);
        tracing::warn!(
            channel = %service.name,
            status = %status,
            code = code.as_deref().unwrap_or("-"),
            "upstream returned error status"
        );
        return Err(UpstreamCallError {
            kind: UpstreamErrorKind::Http,
            status: Some(status),
            message: format!("upstream status {status}"),
            body: Some(text),
        });
    }
    Ok(resp)
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if path == "v1" {
            path = "";
        } else if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("error")
        .and_then(|v| v.get("code"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}
