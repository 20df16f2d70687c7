//! Model backends behind a uniform adapter.
//!
//! Each provider wraps one backend (a local Ollama model, a remote
//! OpenAI-compatible API, or the rule-based fallback). Adapters return a
//! typed `Result`; [`run_provider`] is the seam that turns any failure into a
//! failed [`ModelResult`] so nothing is ever raised to the orchestrator.

pub mod ollama;
pub mod prompt;
pub mod remote;
pub mod rules;

pub use ollama::OllamaProvider;
pub use remote::RemoteApiProvider;
pub use rules::RuleBasedProvider;

use crate::config::ProvidersConfig;
use crate::error::ProviderError;
use crate::models::{
    AnalysisCandidate, AnalysisKind, AnalysisOutput, ModelResult, ProviderDescriptor,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Successful provider output before it is stamped into a [`ModelResult`].
#[derive(Debug, Clone)]
pub struct ProviderOutcome {
    pub output: AnalysisOutput,
    pub confidence: f64,
    pub tokens_used: u64,
}

/// Uniform interface over one model backend.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Static description of this provider.
    fn describe(&self) -> ProviderDescriptor;

    /// Check whether the backend can currently serve requests.
    async fn is_available(&self) -> bool;

    /// Run one analysis.
    async fn analyze(
        &self,
        candidate: &AnalysisCandidate,
        kind: AnalysisKind,
    ) -> Result<ProviderOutcome, ProviderError>;
}

/// Call a provider, timing it and capturing any failure as a result.
pub async fn run_provider(
    provider: &dyn ProviderAdapter,
    candidate: &AnalysisCandidate,
    kind: AnalysisKind,
) -> ModelResult {
    let descriptor = provider.describe();
    let start = Instant::now();

    let outcome = provider.analyze(candidate, kind).await;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Ok(outcome) => {
            debug!(
                provider = %descriptor.id,
                kind = %kind,
                confidence = outcome.confidence,
                elapsed_ms,
                "Provider succeeded"
            );
            ModelResult::succeeded(
                &descriptor,
                outcome.output,
                outcome.confidence,
                outcome.tokens_used,
                elapsed_ms,
            )
        }
        Err(e) => {
            warn!(provider = %descriptor.id, kind = %kind, error = %e, "Provider failed");
            ModelResult::failed(&descriptor, e.record(), elapsed_ms)
        }
    }
}

/// Build the model providers declared in configuration.
///
/// The rule-based fallback is not part of this list; the orchestrator owns
/// it separately.
pub fn build_providers(config: &ProvidersConfig) -> Vec<Arc<dyn ProviderAdapter>> {
    let mut providers: Vec<Arc<dyn ProviderAdapter>> = Vec::new();

    for local in config.local.iter().filter(|p| p.enabled) {
        match OllamaProvider::new(local.clone()) {
            Ok(p) => providers.push(Arc::new(p)),
            Err(e) => warn!("Skipping local provider {}: {}", local.model, e),
        }
    }

    for remote in config.remote.iter().filter(|p| p.enabled) {
        match RemoteApiProvider::new(remote.clone()) {
            Ok(p) => providers.push(Arc::new(p)),
            Err(e) => warn!("Skipping remote provider {}: {}", remote.name, e),
        }
    }

    info!("Configured {} model provider(s)", providers.len());
    providers
}
