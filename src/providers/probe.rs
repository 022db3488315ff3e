//! Provider status probes for the admin surface.
//!
//! A probe answers "can this organization's configuration talk to its
//! provider right now": first a models listing with the tenant key,
//! classified by HTTP status, then (for OpenAI-compatible backends) a
//! 1-token streaming chat sanity test.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::org::resolver::ResolvedProvider;

use super::pool::ClientPool;

/// Machine-readable probe failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeErrorCode {
    /// 401 — key rejected.
    InvalidKey,
    /// 403 — key lacks access.
    Forbidden,
    /// 429 — rate limited.
    RateLimited,
    /// 402 — quota or billing problem.
    QuotaExceeded,
    /// Request timed out.
    Timeout,
    /// Network-level failure.
    Connection,
    /// Any other upstream failure.
    Upstream,
}

/// Result of probing one provider configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    /// Provider name probed.
    pub provider: String,
    /// Overall success.
    pub ok: bool,
    /// Failure class when `ok` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ProbeErrorCode>,
    /// Human-readable detail.
    pub message: String,
    /// Number of models the listing returned.
    pub models_count: usize,
    /// Outcome of the 1-token streaming sanity chat, when attempted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_ok: Option<bool>,
}

impl ProbeReport {
    fn failure(provider: &str, code: ProbeErrorCode, message: String) -> Self {
        Self {
            provider: provider.to_owned(),
            ok: false,
            error_code: Some(code),
            message,
            models_count: 0,
            chat_ok: None,
        }
    }
}

/// Classify an HTTP status into a probe error code.
#[doc(hidden)]
pub fn classify_status(status: u16) -> Option<ProbeErrorCode> {
    match status {
        200..=299 => None,
        401 => Some(ProbeErrorCode::InvalidKey),
        403 => Some(ProbeErrorCode::Forbidden),
        402 => Some(ProbeErrorCode::QuotaExceeded),
        429 => Some(ProbeErrorCode::RateLimited),
        _ => Some(ProbeErrorCode::Upstream),
    }
}

/// Probe runner bound to the shared client pool.
#[derive(Clone)]
pub struct StatusProbe {
    pool: Arc<ClientPool>,
    timeout: Duration,
}

impl StatusProbe {
    /// Build a probe with the configured probe timeout (10 s by default).
    pub fn new(pool: Arc<ClientPool>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// Probe an OpenAI-compatible configuration.
    pub async fn check_openai(&self, config: &ResolvedProvider) -> ProbeReport {
        let provider = "openai";
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_owned());
        let api_key = config.api_key.clone().unwrap_or_default();
        let client = self.pool.get_with_timeout(&base_url, self.timeout);

        let url = format!("{}/models", base_url.trim_end_matches('/'));
        let response = match client.get(&url).bearer_auth(&api_key).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return ProbeReport::failure(
                    provider,
                    ProbeErrorCode::Timeout,
                    format!("connection timeout while fetching models from {base_url}"),
                )
            }
            Err(e) => {
                return ProbeReport::failure(provider, ProbeErrorCode::Connection, e.to_string())
            }
        };

        let status = response.status().as_u16();
        if let Some(code) = classify_status(status) {
            let body = response.text().await.unwrap_or_default();
            return ProbeReport::failure(
                provider,
                code,
                format!("models listing returned {status}: {}", body.chars().take(200).collect::<String>()),
            );
        }

        let payload: Value = response.json().await.unwrap_or(json!({}));
        let models_count = payload
            .get("data")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        debug!(models_count, "models listing succeeded");

        // Second stage: a minimal streaming chat proves the key can actually
        // run completions, not just list models.
        let chat_model = config
            .default_model
            .clone()
            .or_else(|| config.models.first().cloned())
            .unwrap_or_else(|| "gpt-4o-mini".to_owned());
        let chat_ok = self
            .sanity_chat(&client, &base_url, &api_key, &chat_model)
            .await;

        ProbeReport {
            provider: provider.to_owned(),
            ok: chat_ok,
            error_code: (!chat_ok).then_some(ProbeErrorCode::Upstream),
            message: if chat_ok {
                format!("models and chat verified ({models_count} models)")
            } else {
                "models listing succeeded but the streaming chat test failed".to_owned()
            },
            models_count,
            chat_ok: Some(chat_ok),
        }
    }

    /// Probe an Ollama configuration via `GET /api/tags`.
    pub async fn check_ollama(&self, config: &ResolvedProvider) -> ProbeReport {
        let provider = "ollama";
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_owned());
        let client = self.pool.get_with_timeout(&base_url, self.timeout);
        let url = format!("{}/api/tags", base_url.trim_end_matches('/'));

        let response = match client.get(&url).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return ProbeReport::failure(provider, ProbeErrorCode::Timeout, "connection timeout".to_owned())
            }
            Err(e) => {
                return ProbeReport::failure(provider, ProbeErrorCode::Connection, e.to_string())
            }
        };

        let status = response.status().as_u16();
        if let Some(code) = classify_status(status) {
            return ProbeReport::failure(provider, code, format!("tags listing returned {status}"));
        }

        let payload: Value = response.json().await.unwrap_or(json!({}));
        let models_count = payload
            .get("models")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);

        ProbeReport {
            provider: provider.to_owned(),
            ok: true,
            error_code: None,
            message: format!("reachable ({models_count} models)"),
            models_count,
            chat_ok: None,
        }
    }

    /// 1-token streaming chat sanity test.
    async fn sanity_chat(
        &self,
        client: &reqwest::Client,
        base_url: &str,
        api_key: &str,
        model: &str,
    ) -> bool {
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let body = json!({
            "model": model,
            "messages": [{"role": "user", "content": "ping"}],
            "max_tokens": 1,
            "stream": true,
        });

        match client.post(&url).bearer_auth(api_key).json(&body).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
