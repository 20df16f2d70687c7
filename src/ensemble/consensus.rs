//! Consensus strategies.
//!
//! Every strategy has the same shape and lives in [`STRATEGIES`], keyed by
//! [`ConsensusMethod`]. Contributions are sorted by registration rank before
//! any strategy runs, so the reduced output only depends on the set of
//! results and never on the order they completed in.

use crate::error::ConsensusError;
use crate::models::{AnalysisOutput, ConsensusMethod, Finding, SkillLevel};
use std::collections::HashMap;
use tracing::warn;

/// One successful provider result entering a reduction.
#[derive(Debug, Clone)]
pub struct Contribution<'a> {
    /// Registration order of the provider; lower wins ties.
    pub rank: usize,
    pub provider_id: &'a str,
    pub output: &'a AnalysisOutput,
    pub confidence: f64,
    /// Static trust weight of the provider.
    pub weight: f64,
}

/// Reduced output and the confidence reported for it.
pub type StrategyOutput = Result<(AnalysisOutput, f64), ConsensusError>;

pub type Strategy = fn(&[Contribution<'_>]) -> StrategyOutput;

/// Strategy table.
pub const STRATEGIES: [(ConsensusMethod, Strategy); 4] = [
    (ConsensusMethod::ConfidenceBased, confidence_based),
    (ConsensusMethod::WeightedAverage, weighted_average),
    (ConsensusMethod::MajorityVote, majority_vote),
    (ConsensusMethod::BestScore, best_score),
];

pub fn strategy_for(method: ConsensusMethod) -> Strategy {
    STRATEGIES
        .iter()
        .find(|(m, _)| *m == method)
        .map(|(_, s)| *s)
        .unwrap_or(best_score)
}

/// A reduced output together with the method that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    pub output: AnalysisOutput,
    pub confidence: f64,
    pub method: ConsensusMethod,
}

/// Reduce contributions with `method`, falling back to best score if the
/// strategy rejects the input.
pub fn reduce(
    method: ConsensusMethod,
    contributions: &mut [Contribution<'_>],
) -> Result<Reduction, ConsensusError> {
    contributions.sort_by_key(|c| c.rank);

    match strategy_for(method)(contributions) {
        Ok((output, confidence)) => Ok(Reduction {
            output,
            confidence: clamp_confidence(confidence),
            method,
        }),
        Err(ConsensusError::Empty) => Err(ConsensusError::Empty),
        Err(e) => {
            warn!(method = %method, error = %e, "Consensus failed, using best score");
            let (output, confidence) = best_score(contributions)?;
            Ok(Reduction {
                output,
                confidence: clamp_confidence(confidence),
                method: ConsensusMethod::BestScore,
            })
        }
    }
}

fn clamp_confidence(c: f64) -> f64 {
    if c.is_finite() {
        c.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn confidence_based(contributions: &[Contribution<'_>]) -> StrategyOutput {
    let weights = checked_confidences(contributions)?;
    let output = weighted_merge(contributions, &weights)?;
    Ok((output, mean(contributions.iter().map(|c| c.confidence))))
}

fn weighted_average(contributions: &[Contribution<'_>]) -> StrategyOutput {
    checked_confidences(contributions)?;
    let weights: Vec<f64> = contributions.iter().map(|c| c.weight).collect();
    let output = weighted_merge(contributions, &weights)?;
    Ok((output, mean(contributions.iter().map(|c| c.confidence))))
}

fn majority_vote(contributions: &[Contribution<'_>]) -> StrategyOutput {
    checked_confidences(contributions)?;
    if contributions.is_empty() {
        return Err(ConsensusError::Empty);
    }
    let n = contributions.len();
    let ones = vec![1.0; n];
    // Kept when reported by at least half of the results.
    let keep = |count: f64| count * 2.0 >= n as f64;

    let output = AnalysisOutput {
        patterns: vote_list(contributions.iter().map(|c| &c.output.patterns), &ones, keep),
        findings: vote_findings(contributions, &ones, keep),
        complexity_score: mean(contributions.iter().map(|c| c.output.complexity_score)),
        skill_level: vote_skill(contributions, &ones),
        suggestions: vote_list(contributions.iter().map(|c| &c.output.suggestions), &ones, keep),
    };
    Ok((output, mean(contributions.iter().map(|c| c.confidence))))
}

/// Highest confidence wins; ties go to the lowest rank.
pub fn best_score(contributions: &[Contribution<'_>]) -> StrategyOutput {
    let mut best: Option<&Contribution<'_>> = None;
    for c in contributions {
        let score = if c.confidence.is_finite() { c.confidence } else { -1.0 };
        match best {
            Some(b) => {
                let best_score = if b.confidence.is_finite() { b.confidence } else { -1.0 };
                if score > best_score || (score == best_score && c.rank < b.rank) {
                    best = Some(c);
                }
            }
            None => best = Some(c),
        }
    }
    best.map(|c| (c.output.clone(), c.confidence))
        .ok_or(ConsensusError::Empty)
}

fn checked_confidences(contributions: &[Contribution<'_>]) -> Result<Vec<f64>, ConsensusError> {
    contributions
        .iter()
        .map(|c| {
            if c.confidence.is_finite() {
                Ok(c.confidence)
            } else {
                Err(ConsensusError::InvalidConfidence(c.provider_id.to_string()))
            }
        })
        .collect()
}

fn weighted_merge(
    contributions: &[Contribution<'_>],
    weights: &[f64],
) -> Result<AnalysisOutput, ConsensusError> {
    if contributions.is_empty() {
        return Err(ConsensusError::Empty);
    }
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(ConsensusError::ZeroWeight);
    }
    let total: f64 = weights.iter().sum();
    if total <= f64::EPSILON {
        return Err(ConsensusError::ZeroWeight);
    }

    let complexity = contributions
        .iter()
        .zip(weights)
        .map(|(c, w)| c.output.complexity_score * w)
        .sum::<f64>()
        / total;

    let any = |_: f64| true;
    Ok(AnalysisOutput {
        patterns: vote_list(contributions.iter().map(|c| &c.output.patterns), weights, any),
        findings: vote_findings(contributions, weights, any),
        complexity_score: complexity.clamp(0.0, 10.0),
        skill_level: vote_skill(contributions, weights),
        suggestions: vote_list(contributions.iter().map(|c| &c.output.suggestions), weights, any),
    })
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Tally keyed items, remembering first appearance for tie-breaking.
struct Tally<K, V> {
    entries: Vec<(K, V, f64)>,
    index: HashMap<K, usize>,
}

impl<K: Clone + Eq + std::hash::Hash, V> Tally<K, V> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Add `weight` to `key`; `merge` folds the new value into the kept one.
    fn add(&mut self, key: K, value: V, weight: f64, merge: impl FnOnce(&mut V, V)) {
        match self.index.get(&key) {
            Some(&i) => {
                let entry = &mut self.entries[i];
                entry.2 += weight;
                merge(&mut entry.1, value);
            }
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value, weight));
            }
        }
    }

    /// Values ordered by weight (heaviest first), ties by first appearance.
    fn ranked(self, keep: impl Fn(f64) -> bool) -> Vec<V> {
        let mut entries: Vec<(usize, V, f64)> = self
            .entries
            .into_iter()
            .enumerate()
            .filter(|(_, (_, _, w))| keep(*w))
            .map(|(i, (_, v, w))| (i, v, w))
            .collect();
        entries.sort_by(|a, b| b.2.total_cmp(&a.2).then(a.0.cmp(&b.0)));
        entries.into_iter().map(|(_, v, _)| v).collect()
    }
}

fn vote_list<'a>(
    lists: impl Iterator<Item = &'a Vec<String>>,
    weights: &[f64],
    keep: impl Fn(f64) -> bool,
) -> Vec<String> {
    let mut tally: Tally<String, String> = Tally::new();
    for (list, w) in lists.zip(weights) {
        let mut seen: Vec<String> = Vec::new();
        for item in list {
            // A provider repeating an item, in any case, still counts once.
            let key = item.to_lowercase();
            if seen.contains(&key) {
                continue;
            }
            seen.push(key.clone());
            tally.add(key, item.clone(), *w, |_, _| {});
        }
    }
    tally.ranked(keep)
}

fn vote_findings(
    contributions: &[Contribution<'_>],
    weights: &[f64],
    keep: impl Fn(f64) -> bool,
) -> Vec<Finding> {
    let mut tally: Tally<(String, String), Finding> = Tally::new();
    for (c, w) in contributions.iter().zip(weights) {
        let mut seen = Vec::new();
        for finding in &c.output.findings {
            let key = finding.merge_key();
            if seen.contains(&key) {
                continue;
            }
            seen.push(key.clone());
            tally.add(key, finding.clone(), *w, |kept, new| {
                if new.severity > kept.severity {
                    kept.severity = new.severity;
                }
                if kept.line.is_none() {
                    kept.line = new.line;
                }
            });
        }
    }
    tally.ranked(keep)
}

fn vote_skill(contributions: &[Contribution<'_>], weights: &[f64]) -> SkillLevel {
    let mut tally: Tally<SkillLevel, SkillLevel> = Tally::new();
    for (c, w) in contributions.iter().zip(weights) {
        tally.add(c.output.skill_level, c.output.skill_level, *w, |_, _| {});
    }
    tally
        .ranked(|_| true)
        .into_iter()
        .next()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;

    fn output(patterns: &[&str], complexity: f64, skill: SkillLevel) -> AnalysisOutput {
        AnalysisOutput {
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            findings: Vec::new(),
            complexity_score: complexity,
            skill_level: skill,
            suggestions: Vec::new(),
        }
    }

    fn contribution<'a>(
        rank: usize,
        id: &'a str,
        output: &'a AnalysisOutput,
        confidence: f64,
    ) -> Contribution<'a> {
        Contribution {
            rank,
            provider_id: id,
            output,
            confidence,
            weight: 1.0,
        }
    }

    #[test]
    fn test_confidence_weighting_is_nine_to_five() {
        let a = output(&["builder"], 8.0, SkillLevel::Expert);
        let b = output(&["singleton"], 4.0, SkillLevel::Beginner);
        let mut set = vec![contribution(0, "a", &a, 0.9), contribution(1, "b", &b, 0.5)];

        let r = reduce(ConsensusMethod::ConfidenceBased, &mut set).unwrap();
        let expected = (0.9 * 8.0 + 0.5 * 4.0) / 1.4;
        assert!((r.output.complexity_score - expected).abs() < 1e-9);
        assert_eq!(r.output.patterns, vec!["builder", "singleton"]);
        assert_eq!(r.output.skill_level, SkillLevel::Expert);
        assert!((r.confidence - 0.7).abs() < 1e-9);
        assert_eq!(r.method, ConsensusMethod::ConfidenceBased);
    }

    #[test]
    fn test_reduction_ignores_completion_order() {
        let a = output(&["builder", "raii"], 6.0, SkillLevel::Advanced);
        let b = output(&["raii"], 2.0, SkillLevel::Beginner);
        let c = output(&["factory", "builder"], 5.0, SkillLevel::Beginner);

        for method in [
            ConsensusMethod::ConfidenceBased,
            ConsensusMethod::WeightedAverage,
            ConsensusMethod::MajorityVote,
        ] {
            let mut forward = vec![
                contribution(0, "a", &a, 0.6),
                contribution(1, "b", &b, 0.6),
                contribution(2, "c", &c, 0.8),
            ];
            let mut backward = vec![
                contribution(2, "c", &c, 0.8),
                contribution(1, "b", &b, 0.6),
                contribution(0, "a", &a, 0.6),
            ];
            let x = reduce(method, &mut forward).unwrap();
            let y = reduce(method, &mut backward).unwrap();
            assert_eq!(x, y, "{} depends on order", method);
        }
    }

    #[test]
    fn test_majority_keeps_half_and_breaks_ties_by_rank() {
        let a = output(&["builder", "observer"], 3.0, SkillLevel::Advanced);
        let b = output(&["builder"], 5.0, SkillLevel::Beginner);
        let c = output(&["builder", "singleton"], 7.0, SkillLevel::Expert);
        let d = output(&["observer"], 1.0, SkillLevel::Beginner);
        let mut set = vec![
            contribution(0, "a", &a, 0.1),
            contribution(1, "b", &b, 0.9),
            contribution(2, "c", &c, 0.9),
            contribution(3, "d", &d, 0.9),
        ];

        let r = reduce(ConsensusMethod::MajorityVote, &mut set).unwrap();
        assert_eq!(r.output.patterns, vec!["builder", "observer"]);
        assert!((r.output.complexity_score - 4.0).abs() < 1e-9);
        assert_eq!(r.output.skill_level, SkillLevel::Beginner);

        // Two against two: the value of the lowest rank wins.
        let mut tied = vec![
            contribution(1, "b", &b, 0.5),
            contribution(0, "a", &a, 0.5),
        ];
        let r = reduce(ConsensusMethod::MajorityVote, &mut tied).unwrap();
        assert_eq!(r.output.skill_level, SkillLevel::Advanced);
    }

    #[test]
    fn test_case_variants_from_one_provider_vote_once() {
        let mut a = output(&[], 5.0, SkillLevel::Intermediate);
        a.suggestions = vec!["Use bind params".to_string(), "use bind params".to_string()];
        let b = output(&[], 5.0, SkillLevel::Intermediate);
        let c = output(&[], 5.0, SkillLevel::Intermediate);
        let mut set = vec![
            contribution(0, "a", &a, 0.5),
            contribution(1, "b", &b, 0.5),
            contribution(2, "c", &c, 0.5),
        ];

        let r = reduce(ConsensusMethod::MajorityVote, &mut set).unwrap();
        assert!(r.output.suggestions.is_empty());

        // Two of three providers agree across case; the first spelling is kept.
        let mut agreeing = output(&[], 5.0, SkillLevel::Intermediate);
        agreeing.suggestions = vec!["USE BIND PARAMS".to_string()];
        let mut set = vec![
            contribution(0, "a", &a, 0.5),
            contribution(1, "b", &agreeing, 0.5),
            contribution(2, "c", &c, 0.5),
        ];
        let r = reduce(ConsensusMethod::MajorityVote, &mut set).unwrap();
        assert_eq!(r.output.suggestions, vec!["Use bind params"]);
    }

    #[test]
    fn test_findings_merge_by_category_and_message() {
        let mut a = output(&[], 5.0, SkillLevel::Intermediate);
        a.findings.push(Finding {
            category: "security".to_string(),
            severity: Severity::Medium,
            message: "Hardcoded secret".to_string(),
            line: None,
        });
        let mut b = output(&[], 5.0, SkillLevel::Intermediate);
        b.findings.push(Finding {
            category: "Security".to_string(),
            severity: Severity::Critical,
            message: "hardcoded secret".to_string(),
            line: Some(3),
        });
        let mut set = vec![contribution(0, "a", &a, 0.5), contribution(1, "b", &b, 0.5)];

        let r = reduce(ConsensusMethod::ConfidenceBased, &mut set).unwrap();
        assert_eq!(r.output.findings.len(), 1);
        assert_eq!(r.output.findings[0].severity, Severity::Critical);
        assert_eq!(r.output.findings[0].line, Some(3));
    }

    #[test]
    fn test_zero_weight_falls_back_to_best_score() {
        let a = output(&["builder"], 8.0, SkillLevel::Expert);
        let b = output(&["singleton"], 4.0, SkillLevel::Beginner);
        let mut set = vec![contribution(0, "a", &a, 0.0), contribution(1, "b", &b, 0.0)];

        let r = reduce(ConsensusMethod::ConfidenceBased, &mut set).unwrap();
        assert_eq!(r.method, ConsensusMethod::BestScore);
        assert_eq!(r.output, a);
    }

    #[test]
    fn test_non_finite_confidence_falls_back() {
        let a = output(&["builder"], 8.0, SkillLevel::Expert);
        let b = output(&["singleton"], 4.0, SkillLevel::Beginner);
        let mut set = vec![contribution(0, "a", &a, f64::NAN), contribution(1, "b", &b, 0.4)];

        let r = reduce(ConsensusMethod::MajorityVote, &mut set).unwrap();
        assert_eq!(r.method, ConsensusMethod::BestScore);
        assert_eq!(r.output, b);
        assert!((r.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_empty_set_is_an_error() {
        let mut set: Vec<Contribution<'_>> = Vec::new();
        assert_eq!(
            reduce(ConsensusMethod::ConfidenceBased, &mut set),
            Err(ConsensusError::Empty)
        );
    }

    #[test]
    fn test_every_method_has_a_strategy() {
        for (method, _) in STRATEGIES {
            assert_eq!(STRATEGIES.iter().filter(|(m, _)| *m == method).count(), 1);
        }
    }
}
