//! Ensemble dispatch.
//!
//! The orchestrator fans one candidate out to every available model provider
//! under a single shared deadline, tolerates any subset failing, and reduces
//! the survivors to one [`ConsensusResult`]. When nothing succeeds the
//! rule-based provider supplies the answer, so a consensus always exists.

pub mod consensus;

use crate::config::EnsembleConfig;
use crate::error::{AnalysisError, AnalysisResult, ProviderError};
use crate::models::{
    AnalysisCandidate, AnalysisKind, ConsensusMethod, ConsensusResult, ModelResult,
    ProviderDescriptor,
};
use crate::providers::rules::RULES_PROVIDER_ID;
use crate::providers::{run_provider, ProviderAdapter, RuleBasedProvider};
use consensus::{reduce, Contribution};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// A registered provider and its last known availability.
struct ProviderSlot {
    rank: usize,
    adapter: Arc<dyn ProviderAdapter>,
    descriptor: ProviderDescriptor,
    available: AtomicBool,
}

impl ProviderSlot {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    fn current(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            available: self.is_available(),
            ..self.descriptor.clone()
        }
    }
}

/// Dispatches candidates to the registered providers.
pub struct EnsembleOrchestrator {
    slots: Vec<Arc<ProviderSlot>>,
    fallback: RuleBasedProvider,
    config: EnsembleConfig,
}

impl EnsembleOrchestrator {
    /// Register `providers` in order; the order is the tie-break rank.
    pub fn new(providers: Vec<Arc<dyn ProviderAdapter>>, config: EnsembleConfig) -> Self {
        let slots = providers
            .into_iter()
            .enumerate()
            .map(|(rank, adapter)| {
                let descriptor = adapter.describe();
                Arc::new(ProviderSlot {
                    rank,
                    available: AtomicBool::new(descriptor.available),
                    adapter,
                    descriptor,
                })
            })
            .collect();

        Self {
            slots,
            fallback: RuleBasedProvider::new(),
            config,
        }
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    /// Check every provider concurrently and refresh availability flags.
    pub async fn discover(&self) -> Vec<ProviderDescriptor> {
        let checks = self.slots.iter().map(|slot| async move {
            let available = slot.adapter.is_available().await;
            slot.available.store(available, Ordering::Relaxed);
            if available {
                info!(provider = %slot.descriptor.id, "Provider available");
            } else {
                warn!(provider = %slot.descriptor.id, "Provider unavailable");
            }
        });
        join_all(checks).await;
        self.providers()
    }

    /// Registered providers with their current availability, fallback last.
    pub fn providers(&self) -> Vec<ProviderDescriptor> {
        let mut out: Vec<ProviderDescriptor> = self.slots.iter().map(|s| s.current()).collect();
        out.push(self.fallback.describe());
        out
    }

    /// Ids of the registered model providers, in registration order.
    pub fn provider_ids(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.descriptor.id.clone()).collect()
    }

    pub fn knows(&self, provider_id: &str) -> bool {
        provider_id == RULES_PROVIDER_ID || self.slot(provider_id).is_some()
    }

    fn slot(&self, provider_id: &str) -> Option<&Arc<ProviderSlot>> {
        self.slots.iter().find(|s| s.descriptor.id == provider_id)
    }

    /// Analyze with every available provider and reduce to a consensus.
    pub async fn analyze_with_ensemble(
        &self,
        candidate: &AnalysisCandidate,
        kind: AnalysisKind,
        method: ConsensusMethod,
    ) -> ConsensusResult {
        let start = StdInstant::now();
        let active: Vec<&Arc<ProviderSlot>> =
            self.slots.iter().filter(|s| s.is_available()).collect();

        if active.is_empty() {
            debug!(file = %candidate.file_path, kind = %kind, "No model providers available");
            return self.fallback_consensus(candidate, kind, Vec::new(), start);
        }

        let results = self.dispatch(&active, candidate, kind).await;

        let mut failures = Vec::new();
        let mut successes = Vec::new();
        for (slot, result) in results {
            if result.success && result.output.is_some() {
                successes.push((slot, result));
            } else {
                if result.error.as_deref() != Some("timeout") {
                    self.recheck(slot);
                }
                failures.push(result);
            }
        }

        if successes.is_empty() {
            warn!(
                file = %candidate.file_path,
                kind = %kind,
                failed = failures.len(),
                "All providers failed, using rule-based fallback"
            );
            return self.fallback_consensus(candidate, kind, failures, start);
        }

        let method = if successes.len() < self.config.min_providers {
            debug!(
                successes = successes.len(),
                min = self.config.min_providers,
                "Too few providers to vote, using best score"
            );
            ConsensusMethod::BestScore
        } else {
            method
        };

        let mut contributions: Vec<Contribution<'_>> = successes
            .iter()
            .filter_map(|(slot, result)| {
                result.output.as_ref().map(|output| Contribution {
                    rank: slot.rank,
                    provider_id: &result.provider_id,
                    output,
                    confidence: result.confidence,
                    weight: slot.descriptor.weight,
                })
            })
            .collect();

        let reduction = match reduce(method, &mut contributions) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Consensus produced nothing, using rule-based fallback");
                return self.fallback_consensus(candidate, kind, failures, start);
            }
        };

        let mut ordered: Vec<&(&Arc<ProviderSlot>, ModelResult)> = successes.iter().collect();
        ordered.sort_by_key(|(slot, _)| slot.rank);

        let estimated_cost = ordered
            .iter()
            .map(|(slot, r)| r.tokens_used as f64 / 1000.0 * slot.descriptor.cost_per_1k_tokens)
            .sum();

        let result = ConsensusResult {
            output: reduction.output,
            confidence: reduction.confidence,
            method: reduction.method,
            providers: ordered.iter().map(|(_, r)| r.provider_id.clone()).collect(),
            per_model_confidences: ordered
                .iter()
                .map(|(_, r)| (r.provider_id.clone(), r.confidence))
                .collect(),
            failures: failure_map(&failures),
            fallback_used: false,
            estimated_cost,
            elapsed_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            file = %candidate.file_path,
            kind = %kind,
            method = %result.method,
            providers = result.providers.len(),
            failed = result.failures.len(),
            confidence = result.confidence,
            "Ensemble consensus reached"
        );
        result
    }

    /// Analyze with one pinned provider, falling back to rules on failure.
    pub async fn analyze_with_provider(
        &self,
        provider_id: &str,
        candidate: &AnalysisCandidate,
        kind: AnalysisKind,
    ) -> AnalysisResult<ModelResult> {
        if provider_id == RULES_PROVIDER_ID {
            return Ok(self.run_fallback(candidate, kind));
        }

        let slot = self
            .slot(provider_id)
            .ok_or_else(|| AnalysisError::UnknownProvider(provider_id.to_string()))?;

        if !slot.is_available() {
            warn!(
                provider = %provider_id,
                "Pinned provider unavailable, using rule-based fallback"
            );
            return Ok(self.run_fallback(candidate, kind));
        }

        let mut results = self.dispatch(&[slot], candidate, kind).await;
        match results.pop() {
            Some((_, result)) if result.success => Ok(result),
            Some((slot, result)) => {
                warn!(
                    provider = %provider_id,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "Pinned provider failed, using rule-based fallback"
                );
                if result.error.as_deref() != Some("timeout") {
                    self.recheck(slot);
                }
                Ok(self.run_fallback(candidate, kind))
            }
            None => Ok(self.run_fallback(candidate, kind)),
        }
    }

    /// Run `slots` concurrently; late providers become `"timeout"` failures.
    async fn dispatch<'s>(
        &self,
        slots: &[&'s Arc<ProviderSlot>],
        candidate: &AnalysisCandidate,
        kind: AnalysisKind,
    ) -> Vec<(&'s Arc<ProviderSlot>, ModelResult)> {
        let budget = self.config.deadline();
        let deadline = Instant::now() + budget;

        let calls = slots.iter().map(|&slot| async move {
            let call = run_provider(slot.adapter.as_ref(), candidate, kind);
            let result = match timeout_at(deadline, call).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        provider = %slot.descriptor.id,
                        deadline_ms = budget.as_millis() as u64,
                        "Provider missed the ensemble deadline"
                    );
                    ModelResult::failed(
                        &slot.descriptor,
                        ProviderError::Timeout(budget).record(),
                        budget.as_millis() as u64,
                    )
                }
            };
            (slot, result)
        });

        join_all(calls).await
    }

    /// Refresh a provider's availability in the background.
    fn recheck(&self, slot: &Arc<ProviderSlot>) {
        let slot = Arc::clone(slot);
        tokio::spawn(async move {
            let available = slot.adapter.is_available().await;
            if !available {
                warn!(provider = %slot.descriptor.id, "Provider marked unavailable after failure");
            }
            slot.available.store(available, Ordering::Relaxed);
        });
    }

    fn run_fallback(&self, candidate: &AnalysisCandidate, kind: AnalysisKind) -> ModelResult {
        let start = StdInstant::now();
        let outcome = self.fallback.analyze_now(candidate, kind);
        ModelResult::succeeded(
            &self.fallback.describe(),
            outcome.output,
            outcome.confidence,
            outcome.tokens_used,
            start.elapsed().as_millis() as u64,
        )
    }

    fn fallback_consensus(
        &self,
        candidate: &AnalysisCandidate,
        kind: AnalysisKind,
        failures: Vec<ModelResult>,
        start: StdInstant,
    ) -> ConsensusResult {
        let result = self.run_fallback(candidate, kind);
        ConsensusResult {
            output: result.output.unwrap_or_default(),
            confidence: result.confidence,
            method: ConsensusMethod::BestScore,
            providers: vec![result.provider_id.clone()],
            per_model_confidences: BTreeMap::from([(result.provider_id, result.confidence)]),
            failures: failure_map(&failures),
            fallback_used: true,
            estimated_cost: 0.0,
            elapsed_ms: start.elapsed().as_millis() as u64,
        }
    }
}

fn failure_map(failures: &[ModelResult]) -> BTreeMap<String, String> {
    failures
        .iter()
        .map(|r| {
            (
                r.provider_id.clone(),
                r.error.clone().unwrap_or_else(|| "unknown error".to_string()),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::rules::{analyze_source, RULE_CONFIDENCE};
    use crate::models::{AnalysisOutput, SkillLevel};
    use crate::test_support::{candidate, StubProvider};
    use std::time::Duration;

    fn config(timeout_seconds: f64, min_providers: usize) -> EnsembleConfig {
        EnsembleConfig {
            timeout_seconds,
            min_providers,
            method: ConsensusMethod::ConfidenceBased,
        }
    }

    fn orchestrator(stubs: &[Arc<StubProvider>], config: EnsembleConfig) -> EnsembleOrchestrator {
        let providers = stubs
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn ProviderAdapter>)
            .collect();
        EnsembleOrchestrator::new(providers, config)
    }

    #[tokio::test]
    async fn test_slow_provider_is_cut_at_deadline() {
        let fast_a = Arc::new(StubProvider::new("fast-a", 0.9).with_complexity(8.0));
        let fast_b = Arc::new(StubProvider::new("fast-b", 0.5).with_complexity(4.0));
        let slow = Arc::new(
            StubProvider::new("slow", 0.99)
                .with_complexity(0.0)
                .with_delay(Duration::from_secs(10)),
        );
        let ensemble = orchestrator(&[fast_a, fast_b, slow.clone()], config(0.3, 2));

        let start = StdInstant::now();
        let result = ensemble
            .analyze_with_ensemble(
                &candidate("a.py", "x = 1"),
                AnalysisKind::Quality,
                ConsensusMethod::ConfidenceBased,
            )
            .await;
        assert!(start.elapsed() < Duration::from_secs(2));

        assert_eq!(result.providers, vec!["fast-a", "fast-b"]);
        assert_eq!(result.failures.get("slow").map(String::as_str), Some("timeout"));
        assert!(!result.per_model_confidences.contains_key("slow"));
        let expected = (0.9 * 8.0 + 0.5 * 4.0) / 1.4;
        assert!((result.output.complexity_score - expected).abs() < 1e-9);
        assert!(!result.fallback_used);
        assert_eq!(slow.calls(), 1);
    }

    #[tokio::test]
    async fn test_no_providers_uses_rules() {
        let ensemble = EnsembleOrchestrator::new(Vec::new(), config(1.0, 2));
        let source = "API_KEY = \"sk-live-1234567890\"\n";
        let result = ensemble
            .analyze_with_ensemble(
                &candidate("a.py", source),
                AnalysisKind::Security,
                ConsensusMethod::MajorityVote,
            )
            .await;

        assert!(result.fallback_used);
        assert_eq!(result.providers, vec![RULES_PROVIDER_ID]);
        assert_eq!(result.output, analyze_source(source, AnalysisKind::Security));
        assert_eq!(result.confidence, RULE_CONFIDENCE);
    }

    #[tokio::test]
    async fn test_all_failures_equal_rules_output() {
        let a = Arc::new(
            StubProvider::new("a", 0.9).failing(ProviderError::Backend("HTTP 500".to_string())),
        );
        let b = Arc::new(StubProvider::new("b", 0.9).failing(ProviderError::Parse {
            message: "expected value".to_string(),
            raw: "sorry".to_string(),
        }));
        let ensemble = orchestrator(&[a, b], config(1.0, 2));
        let source = "for a in x:\n    for b in y:\n        pass\n";

        let result = ensemble
            .analyze_with_ensemble(
                &candidate("a.py", source),
                AnalysisKind::Performance,
                ConsensusMethod::ConfidenceBased,
            )
            .await;

        assert!(result.fallback_used);
        assert_eq!(result.output, analyze_source(source, AnalysisKind::Performance));
        assert_eq!(result.failures.len(), 2);
        assert!(result.failures["b"].contains("sorry"));
    }

    #[tokio::test]
    async fn test_single_success_uses_best_score() {
        let a = Arc::new(StubProvider::new("a", 0.8));
        let b = Arc::new(
            StubProvider::new("b", 0.9)
                .failing(ProviderError::RateLimited("slow down".to_string())),
        );
        let ensemble = orchestrator(&[a.clone(), b], config(1.0, 2));

        let result = ensemble
            .analyze_with_ensemble(
                &candidate("a.rs", "fn main() {}"),
                AnalysisKind::Pattern,
                ConsensusMethod::MajorityVote,
            )
            .await;

        assert_eq!(result.method, ConsensusMethod::BestScore);
        assert_eq!(result.output, a.output);
        assert_eq!(result.confidence, 0.8);
    }

    #[tokio::test]
    async fn test_failed_provider_is_rechecked() {
        let flaky = Arc::new(
            StubProvider::new("flaky", 0.9)
                .failing(ProviderError::Unavailable("connection refused".to_string())),
        );
        let ensemble = orchestrator(&[flaky.clone()], config(1.0, 1));
        assert!(ensemble.providers()[0].available);

        flaky.reachable.store(false, std::sync::atomic::Ordering::SeqCst);
        ensemble
            .analyze_with_ensemble(
                &candidate("a.rs", "fn main() {}"),
                AnalysisKind::Quality,
                ConsensusMethod::ConfidenceBased,
            )
            .await;

        for _ in 0..10 {
            if !ensemble.providers()[0].available {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!ensemble.providers()[0].available);

        // Unavailable providers are skipped entirely.
        ensemble
            .analyze_with_ensemble(
                &candidate("a.rs", "fn main() {}"),
                AnalysisKind::Quality,
                ConsensusMethod::ConfidenceBased,
            )
            .await;
        assert_eq!(flaky.calls(), 1);
    }

    #[tokio::test]
    async fn test_discover_refreshes_availability() {
        let up = Arc::new(StubProvider::new("up", 0.9));
        let down = Arc::new(StubProvider::new("down", 0.9));
        let ensemble = orchestrator(&[up, down.clone()], config(1.0, 2));

        down.reachable.store(false, std::sync::atomic::Ordering::SeqCst);
        let listed = ensemble.discover().await;

        assert_eq!(listed.len(), 3);
        assert!(listed[0].available);
        assert!(!listed[1].available);
        assert_eq!(listed[2].id, RULES_PROVIDER_ID);
    }

    #[tokio::test]
    async fn test_estimated_cost_uses_declared_rates() {
        let paid = Arc::new(StubProvider::new("paid", 0.8).with_cost(0.002));
        let free = Arc::new(StubProvider::new("free", 0.6));
        let ensemble = orchestrator(&[paid, free], config(1.0, 2));

        let result = ensemble
            .analyze_with_ensemble(
                &candidate("a.rs", "fn main() {}"),
                AnalysisKind::Quality,
                ConsensusMethod::WeightedAverage,
            )
            .await;
        assert!((result.estimated_cost - 0.002).abs() < 1e-12);
        assert_eq!(result.method, ConsensusMethod::WeightedAverage);
    }

    #[tokio::test]
    async fn test_weighted_average_follows_static_weights() {
        let mut sure = StubProvider::new("sure", 0.9).with_output(AnalysisOutput {
            complexity_score: 8.0,
            skill_level: SkillLevel::Expert,
            ..AnalysisOutput::default()
        });
        sure.weight = 0.2;
        let mut trusted = StubProvider::new("trusted", 0.3).with_output(AnalysisOutput {
            complexity_score: 2.0,
            skill_level: SkillLevel::Beginner,
            ..AnalysisOutput::default()
        });
        trusted.weight = 0.8;
        let ensemble = orchestrator(&[Arc::new(sure), Arc::new(trusted)], config(1.0, 2));
        let c = candidate("a.rs", "fn main() {}");

        let weighted = ensemble
            .analyze_with_ensemble(&c, AnalysisKind::Quality, ConsensusMethod::WeightedAverage)
            .await;
        let by_confidence = ensemble
            .analyze_with_ensemble(&c, AnalysisKind::Quality, ConsensusMethod::ConfidenceBased)
            .await;

        // 0.2 * 8 + 0.8 * 2
        assert!((weighted.output.complexity_score - 3.2).abs() < 1e-9);
        assert_eq!(weighted.output.skill_level, SkillLevel::Beginner);
        // (0.9 * 8 + 0.3 * 2) / 1.2
        assert!((by_confidence.output.complexity_score - 6.5).abs() < 1e-9);
        assert_eq!(by_confidence.output.skill_level, SkillLevel::Expert);
    }

    #[tokio::test]
    async fn test_pinned_provider() {
        let a = Arc::new(StubProvider::new("a", 0.8));
        let broken = Arc::new(
            StubProvider::new("broken", 0.8)
                .failing(ProviderError::Backend("HTTP 502".to_string())),
        );
        let ensemble = orchestrator(&[a, broken], config(1.0, 2));
        let c = candidate("a.rs", "fn main() {}");

        let result = ensemble
            .analyze_with_provider("a", &c, AnalysisKind::Quality)
            .await
            .unwrap();
        assert_eq!(result.provider_id, "a");

        let result = ensemble
            .analyze_with_provider("broken", &c, AnalysisKind::Quality)
            .await
            .unwrap();
        assert_eq!(result.provider_id, RULES_PROVIDER_ID);
        assert!(result.success);

        let err = ensemble
            .analyze_with_provider("nope", &c, AnalysisKind::Quality)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::UnknownProvider(id) if id == "nope"));
    }
}
