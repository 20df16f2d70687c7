//! Remote provider for OpenAI-compatible chat completion APIs.
//!
//! Requests are metered (declared cost per 1k tokens), spaced to respect a
//! requests-per-minute budget, and retried on 429 / 5xx with exponential
//! backoff. Reasoning-model families take `max_completion_tokens` instead of
//! `max_tokens`.

use super::prompt::{build_prompt, parse_response, SYSTEM_PROMPT};
use super::{ProviderAdapter, ProviderOutcome};
use crate::config::RemoteProviderConfig;
use crate::error::ProviderError;
use crate::models::{AnalysisCandidate, AnalysisKind, BackendKind, ProviderDescriptor};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

const REASONING_MODEL_PREFIXES: [&str; 4] = ["o1", "o3", "o4", "gpt-5"];

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: u64,
}

/// Name of the token limit parameter accepted by `model`.
pub fn token_limit_param(model: &str) -> &'static str {
    let model = model.to_lowercase();
    let bare = model.rsplit('/').next().unwrap_or(&model);
    if REASONING_MODEL_PREFIXES.iter().any(|p| bare.starts_with(p)) {
        "max_completion_tokens"
    } else {
        "max_tokens"
    }
}

/// One metered remote model.
pub struct RemoteApiProvider {
    config: RemoteProviderConfig,
    http_client: reqwest::Client,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RemoteApiProvider {
    pub fn new(config: RemoteProviderConfig) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| ProviderError::Backend(format!("Failed to create HTTP client: {}", e)))?;

        let rpm = config.requests_per_minute.max(1);
        let min_interval = Duration::from_millis(60_000 / rpm as u64);

        Ok(Self {
            config,
            http_client,
            min_interval,
            last_request: Mutex::new(None),
        })
    }

    fn api_key(&self) -> Option<String> {
        std::env::var(&self.config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }

    /// Wait for the next free request slot, then claim it.
    ///
    /// The slot is claimed only once the wait is over, so a caller dropped
    /// mid-sleep leaves nothing reserved.
    async fn throttle(&self) {
        loop {
            let wait = {
                let mut last = self.last_request.lock().await;
                let now = Instant::now();
                match *last {
                    Some(prev) if prev + self.min_interval > now => {
                        (prev + self.min_interval).saturating_duration_since(now)
                    }
                    _ => {
                        *last = Some(now);
                        return;
                    }
                }
            };
            debug!(
                provider = %self.config.name,
                wait_ms = wait.as_millis() as u64,
                "Rate limiting"
            );
            tokio::time::sleep(wait).await;
        }
    }

    fn request_body(&self, prompt: String) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "response_format": {"type": "json_object"},
        });
        body[token_limit_param(&self.config.model)] = json!(self.config.max_tokens);
        // Reasoning models reject a custom temperature.
        if token_limit_param(&self.config.model) == "max_tokens" {
            body["temperature"] = json!(self.config.temperature);
        }
        body
    }

    async fn send_once(
        &self,
        key: &str,
        body: &Value,
    ) -> Result<CompletionResponse, ProviderError> {
        self.throttle().await;

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    let base = &self.config.base_url;
                    ProviderError::Unavailable(format!("Cannot connect to {}", base))
                } else {
                    ProviderError::Backend(format!("Failed to send request: {}", e))
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::RateLimited(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Backend(format!("API error {}: {}", status, body)));
        }

        response
            .json::<CompletionResponse>()
            .await
            .map_err(|e| ProviderError::Backend(format!("Failed to parse API response: {}", e)))
    }
}

fn is_retryable(err: &ProviderError) -> bool {
    match err {
        ProviderError::RateLimited(_) => true,
        ProviderError::Backend(msg) => msg.starts_with("API error 5"),
        _ => false,
    }
}

#[async_trait]
impl ProviderAdapter for RemoteApiProvider {
    fn describe(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            id: format!("{}:{}", self.config.name, self.config.model),
            backend: BackendKind::RemoteApi,
            model: self.config.model.clone(),
            cost_per_1k_tokens: self.config.cost_per_1k_tokens,
            context_window: self.config.context_window,
            weight: self.config.weight,
            available: self.api_key().is_some(),
        }
    }

    async fn is_available(&self) -> bool {
        self.api_key().is_some()
    }

    async fn analyze(
        &self,
        candidate: &AnalysisCandidate,
        kind: AnalysisKind,
    ) -> Result<ProviderOutcome, ProviderError> {
        let key = self.api_key().ok_or_else(|| {
            ProviderError::Unavailable(format!("{} is not set", self.config.api_key_env))
        })?;

        let body = self.request_body(build_prompt(candidate, kind, self.config.context_window));

        let mut attempt = 0;
        let completion = loop {
            match self.send_once(&key, &body).await {
                Ok(c) => break c,
                Err(e) if attempt < self.config.retries && is_retryable(&e) => {
                    attempt += 1;
                    let backoff = Duration::from_millis(500 * 2u64.pow(attempt as u32 - 1));
                    warn!(
                        provider = %self.config.name,
                        attempt,
                        error = %e,
                        "Retrying remote provider in {:?}",
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        };

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Backend("API returned no choices".to_string()))?;

        let (output, confidence) = parse_response(&content)?;
        let tokens_used = completion
            .usage
            .map(|u| u.total_tokens)
            .unwrap_or_else(|| (candidate.approx_tokens() + content.len() / 4) as u64);

        Ok(ProviderOutcome {
            output,
            confidence,
            tokens_used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(model: &str) -> RemoteProviderConfig {
        RemoteProviderConfig {
            enabled: true,
            name: "openai".to_string(),
            base_url: "https://api.example.invalid/v1".to_string(),
            model: model.to_string(),
            api_key_env: "YOINSIGHT_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            max_tokens: 1024,
            temperature: 0.2,
            cost_per_1k_tokens: 0.002,
            context_window: 16_000,
            weight: 0.8,
            requests_per_minute: 120,
            retries: 1,
        }
    }

    #[test]
    fn test_token_limit_param() {
        assert_eq!(token_limit_param("gpt-4o-mini"), "max_tokens");
        assert_eq!(token_limit_param("o3-mini"), "max_completion_tokens");
        assert_eq!(token_limit_param("openai/gpt-5"), "max_completion_tokens");
        assert_eq!(token_limit_param("claude-3-haiku"), "max_tokens");
    }

    #[test]
    fn test_request_body_uses_model_specific_limit() {
        let provider = RemoteApiProvider::new(config("o1-preview")).unwrap();
        let body = provider.request_body("hi".to_string());
        assert_eq!(body["max_completion_tokens"], 1024);
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("temperature").is_none());

        let provider = RemoteApiProvider::new(config("gpt-4o")).unwrap();
        let body = provider.request_body("hi".to_string());
        assert_eq!(body["max_tokens"], 1024);
    }

    #[tokio::test]
    async fn test_missing_key_means_unavailable() {
        let provider = RemoteApiProvider::new(config("gpt-4o")).unwrap();
        assert!(!provider.is_available().await);
        assert!(!provider.describe().available);
        assert_eq!(provider.describe().id, "openai:gpt-4o");
    }

    #[tokio::test]
    async fn test_throttle_spaces_requests() {
        let provider = RemoteApiProvider::new(config("gpt-4o")).unwrap();
        let start = Instant::now();
        provider.throttle().await;
        provider.throttle().await;
        // 120 rpm -> 500ms between slots.
        assert!(start.elapsed() >= Duration::from_millis(450));
    }

    #[tokio::test]
    async fn test_abandoned_wait_keeps_no_slot() {
        let provider = RemoteApiProvider::new(config("gpt-4o")).unwrap();
        provider.throttle().await;
        let first = (*provider.last_request.lock().await).unwrap();

        // A caller cut off while waiting must not push the schedule back.
        let cut = tokio::time::timeout(Duration::from_millis(50), provider.throttle()).await;
        assert!(cut.is_err());
        assert_eq!(*provider.last_request.lock().await, Some(first));

        let start = Instant::now();
        provider.throttle().await;
        assert!(start.elapsed() < Duration::from_millis(900));
        let claimed = (*provider.last_request.lock().await).unwrap();
        assert!(claimed >= first + Duration::from_millis(500));
    }
}
