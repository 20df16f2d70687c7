//! Finding aggregation and statistics.
//!
//! Utilities for computing summary statistics over file reports and for
//! narrowing a report to the findings a caller cares about.

use crate::models::{FileReport, ReportSummary, RepositoryReport, Severity};
use std::collections::BTreeMap;

/// Compute summary statistics from file reports.
pub fn summarize<'a>(files: impl IntoIterator<Item = &'a FileReport>) -> ReportSummary {
    let mut summary = ReportSummary::default();
    let mut analyses = 0usize;
    let mut complexity_total = 0.0;
    let mut confidence_total = 0.0;

    for file in files {
        summary.files_analyzed += 1;

        for analysis in file.analyses.values() {
            analyses += 1;
            complexity_total += analysis.complexity_score;
            confidence_total += analysis.confidence;
            if analysis.ai_powered {
                summary.ai_powered_analyses += 1;
            } else {
                summary.fallback_analyses += 1;
            }

            for pattern in &analysis.patterns {
                *summary.pattern_counts.entry(pattern.clone()).or_default() += 1;
                summary.total_patterns += 1;
            }

            for finding in &analysis.findings {
                summary.total_findings += 1;
                match finding.severity {
                    Severity::Critical => summary.critical += 1,
                    Severity::High => summary.high += 1,
                    Severity::Medium => summary.medium += 1,
                    Severity::Low => summary.low += 1,
                }
                let category = finding.category.trim().to_lowercase();
                *summary.by_category.entry(category).or_default() += 1;
            }
        }
    }

    if analyses > 0 {
        summary.average_complexity = complexity_total / analyses as f64;
        summary.average_confidence = confidence_total / analyses as f64;
    }

    summary
}

/// Most frequent patterns, highest count first, ties by name.
pub fn top_patterns(summary: &ReportSummary, n: usize) -> Vec<(&str, usize)> {
    let mut patterns: Vec<_> = summary
        .pattern_counts
        .iter()
        .map(|(name, count)| (name.as_str(), *count))
        .collect();

    patterns.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    patterns.truncate(n);
    patterns
}

/// Compute language distribution from file reports.
pub fn language_distribution<'a>(
    files: impl IntoIterator<Item = &'a FileReport>,
) -> BTreeMap<String, usize> {
    let mut dist = BTreeMap::new();

    for file in files {
        *dist.entry(file.language.clone()).or_default() += 1;
    }

    dist
}

/// Identify the most problematic files (by finding count).
pub fn most_problematic_files<'a>(
    files: impl IntoIterator<Item = &'a FileReport>,
    n: usize,
) -> Vec<(&'a FileReport, usize)> {
    let mut file_findings: Vec<_> = files
        .into_iter()
        .map(|f| (f, f.finding_count()))
        .filter(|(_, count)| *count > 0)
        .collect();

    // Stable sort keeps path order among equal counts
    file_findings.sort_by_key(|(_, count)| std::cmp::Reverse(*count));
    file_findings.truncate(n);

    file_findings
}

/// Number of findings at or above `threshold`.
pub fn count_at_or_above(summary: &ReportSummary, threshold: Severity) -> usize {
    [
        (Severity::Critical, summary.critical),
        (Severity::High, summary.high),
        (Severity::Medium, summary.medium),
        (Severity::Low, summary.low),
    ]
    .iter()
    .filter(|(severity, _)| *severity >= threshold)
    .map(|(_, count)| count)
    .sum()
}

/// Copy of `report` keeping only findings at or above `min`.
pub fn filter_by_severity(report: &RepositoryReport, min: Severity) -> RepositoryReport {
    let mut files = report.files.clone();
    for file in files.values_mut() {
        for analysis in file.analyses.values_mut() {
            analysis.findings.retain(|f| f.severity >= min);
        }
    }
    RepositoryReport::new(
        report.repository.clone(),
        report.revision.clone(),
        report.analyzed_at,
        files,
    )
}
