//! Local model provider backed by Ollama's chat API.

use super::prompt::{build_prompt, parse_response, SYSTEM_PROMPT};
use super::{ProviderAdapter, ProviderOutcome};
use crate::config::LocalProviderConfig;
use crate::error::ProviderError;
use crate::models::{AnalysisCandidate, AnalysisKind, BackendKind, ProviderDescriptor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Message in the chat history.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Ollama chat API request.
#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    format: &'static str,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_ctx: usize,
}

/// Ollama chat API response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ChatMessage,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// One locally served Ollama model.
pub struct OllamaProvider {
    config: LocalProviderConfig,
    http_client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(config: LocalProviderConfig) -> Result<Self, ProviderError> {
        // The ensemble deadline bounds each call; this only stops runaway sockets.
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| ProviderError::Backend(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    fn id(&self) -> String {
        format!("ollama:{}", self.config.model)
    }

    fn model_matches(&self, name: &str) -> bool {
        let wanted = self.config.model.as_str();
        name == wanted || (!wanted.contains(':') && name == format!("{}:latest", wanted))
    }
}

#[async_trait]
impl ProviderAdapter for OllamaProvider {
    fn describe(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            id: self.id(),
            backend: BackendKind::LocalModel,
            model: self.config.model.clone(),
            cost_per_1k_tokens: 0.0,
            context_window: self.config.context_window,
            weight: self.config.weight,
            available: true,
        }
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.config.url);
        let tags_request = self.http_client.get(&url).send();
        let response = match timeout(Duration::from_secs(5), tags_request).await {
            Ok(Ok(r)) if r.status().is_success() => r,
            Ok(Ok(r)) => {
                debug!("Ollama at {} answered {}", self.config.url, r.status());
                return false;
            }
            Ok(Err(e)) => {
                debug!("Cannot connect to Ollama at {}: {}", self.config.url, e);
                return false;
            }
            Err(_) => {
                debug!("Ollama availability check timed out at {}", self.config.url);
                return false;
            }
        };

        match response.json::<TagsResponse>().await {
            Ok(tags) => tags.models.iter().any(|m| self.model_matches(&m.name)),
            Err(e) => {
                debug!("Unreadable /api/tags response: {}", e);
                false
            }
        }
    }

    async fn analyze(
        &self,
        candidate: &AnalysisCandidate,
        kind: AnalysisKind,
    ) -> Result<ProviderOutcome, ProviderError> {
        let url = format!("{}/api/chat", self.config.url);

        let request = OllamaChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: build_prompt(candidate, kind, self.config.context_window),
                },
            ],
            stream: false,
            format: "json",
            options: OllamaOptions {
                temperature: self.config.temperature,
                num_ctx: self.config.context_window,
            },
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    ProviderError::Unavailable(format!(
                        "Cannot connect to Ollama at {}",
                        self.config.url
                    ))
                } else {
                    ProviderError::Backend(format!("Failed to send request: {}", e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Backend(format!(
                "Ollama API error {}: {}",
                status, body
            )));
        }

        let chat_response: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| {
                ProviderError::Backend(format!("Failed to parse Ollama response: {}", e))
            })?;

        let (output, confidence) = parse_response(&chat_response.message.content)?;
        let tokens_used = chat_response.prompt_eval_count.unwrap_or(0)
            + chat_response.eval_count.unwrap_or(0);

        Ok(ProviderOutcome {
            output,
            confidence,
            tokens_used,
        })
    }
}
