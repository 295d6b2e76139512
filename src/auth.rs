use crate::config::ConfigSnapshot;
use crate::error::{AppError, AppResult};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use subtle::ConstantTimeEq;

/// Outcome of client authentication: the bearer key the client presented,
/// kept around for `key_passthrough` forwarding.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub client_key: String,
}

/// Validates the `Authorization: Bearer` header against the configured
/// allow-list. Runs before any upstream contact. In `key_passthrough` mode
/// the allow-list is not consulted; the key is only extracted so it can be
/// forwarded verbatim.
pub fn authenticate(headers: &HeaderMap, snapshot: &ConfigSnapshot) -> AppResult<AuthResult> {
    let token = bearer_token(headers).ok_or_else(AppError::unauthorized)?;

    if snapshot.features().key_passthrough {
        return Ok(AuthResult {
            client_key: token.to_string(),
        });
    }

    if key_allowed(token, &snapshot.config.client_authentication.allowed_keys) {
        Ok(AuthResult {
            client_key: token.to_string(),
        })
    } else {
        Err(AppError::unauthorized())
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() { None } else { Some(token) }
}

/// Constant-time membership test. Every configured key is compared so the
/// time taken does not depend on which entry (if any) matched.
fn key_allowed(token: &str, allowed: &[String]) -> bool {
    let token_bytes = token.as_bytes();
    let mut matched = 0u8;
    for key in allowed {
        let key_bytes = key.as_bytes();
        if key_bytes.len() == token_bytes.len() {
            matched |= token_bytes.ct_eq(key_bytes).unwrap_u8();
        }
    }
    matched == 1
}

#[cfg(test)]
mod tests {
    use super::key_allowed;

    #[test]
    fn matches_any_configured_key() {
        let keys = vec!["sk-one".to_string(), "sk-two".to_string()];
        assert!(key_allowed("sk-one", &keys));
        assert!(key_allowed("sk-two", &keys));
    }

    #[test]
    fn rejects_unknown_and_prefix_keys() {
        let keys = vec!["sk-one".to_string()];
        assert!(!key_allowed("sk-on", &keys));
        assert!(!key_allowed("sk-onee", &keys));
        assert!(!key_allowed("", &keys));
    }
}
