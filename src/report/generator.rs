//! Markdown and JSON report generation.
//!
//! Renders a [`RepositoryRun`] together with run metadata that the report
//! itself does not carry (where the code came from, which providers were
//! registered, how long the run took).

use crate::analysis::{language_distribution, most_problematic_files, top_patterns};
use crate::config::ReportConfig;
use crate::coordinator::RepositoryRun;
use crate::models::{AnalysisResponse, FileReport, ReportSummary, Severity};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

/// Facts about the run that are not part of the repository report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportMetadata {
    /// URL or local path that was analyzed.
    pub source: String,
    pub providers: Vec<String>,
    pub cache_backend: String,
    pub duration_seconds: f64,
}

/// Rendering switches.
#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub include_suggestions: bool,
    pub top_patterns: usize,
}

impl From<&ReportConfig> for ReportOptions {
    fn from(config: &ReportConfig) -> Self {
        Self {
            include_suggestions: config.include_suggestions,
            top_patterns: config.top_patterns,
        }
    }
}

/// Generate a complete Markdown report.
pub fn generate_markdown_report(
    run: &RepositoryRun,
    metadata: &ReportMetadata,
    options: &ReportOptions,
) -> String {
    let mut output = String::new();

    output.push_str("# YoInsight Report\n\n");
    output.push_str(&generate_metadata_section(run, metadata));
    output.push_str(&generate_summary_section(run, options));
    output.push_str(&generate_findings_section(run.report.files.values(), options));
    output.push_str(&generate_footer());

    output
}

fn generate_metadata_section(run: &RepositoryRun, metadata: &ReportMetadata) -> String {
    let report = &run.report;
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Repository:** {}\n", metadata.source));
    section.push_str(&format!("- **Identity:** `{}`\n", report.repository));
    section.push_str(&format!("- **Revision:** `{}`\n", report.revision));
    section.push_str(&format!(
        "- **Analysis Date:** {}\n",
        report.analyzed_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Run Mode:** {} ({})\n", run.mode, run.reason));
    section.push_str(&format!(
        "- **Files:** {} analyzed, {} reused, {} removed\n",
        run.analyzed_files, run.reused_files, run.removed_files
    ));
    if metadata.providers.is_empty() {
        section.push_str("- **Providers:** rule-based fallback only\n");
    } else {
        section.push_str(&format!(
            "- **Providers:** {}\n",
            metadata
                .providers
                .iter()
                .map(|p| format!("`{}`", p))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    section.push_str(&format!("- **Cache:** {}\n", metadata.cache_backend));
    section.push_str(&format!(
        "- **Analysis Duration:** {:.1}s\n\n",
        metadata.duration_seconds
    ));

    section
}

fn generate_summary_section(run: &RepositoryRun, options: &ReportOptions) -> String {
    let summary: &ReportSummary = &run.report.summary;
    let files = &run.report.files;
    let mut section = String::new();

    section.push_str("## Summary\n\n");

    section.push_str("### Finding Severity Breakdown\n\n");
    section.push_str(&format!(
        "| {} Critical | {} High | {} Medium | {} Low | **Total** |\n",
        Severity::Critical.emoji(),
        Severity::High.emoji(),
        Severity::Medium.emoji(),
        Severity::Low.emoji(),
    ));
    section.push_str("|:---:|:---:|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| {} | {} | {} | {} | **{}** |\n\n",
        summary.critical, summary.high, summary.medium, summary.low, summary.total_findings
    ));

    section.push_str("### Overview\n\n");
    section.push_str("| Metric | Value |\n");
    section.push_str("|:---|:---:|\n");
    section.push_str(&format!("| Files analyzed | {} |\n", summary.files_analyzed));
    section.push_str(&format!(
        "| Average complexity | {:.1} |\n",
        summary.average_complexity
    ));
    section.push_str(&format!(
        "| Average confidence | {:.0}% |\n",
        summary.average_confidence * 100.0
    ));
    section.push_str(&format!(
        "| Model-backed analyses | {} |\n",
        summary.ai_powered_analyses
    ));
    section.push_str(&format!(
        "| Rule-based analyses | {} |\n\n",
        summary.fallback_analyses
    ));

    if !summary.by_category.is_empty() {
        section.push_str("### Findings by Category\n\n");
        section.push_str("| Category | Count |\n");
        section.push_str("|:---|:---:|\n");

        let mut categories: Vec<_> = summary.by_category.iter().collect();
        categories.sort_by_key(|(_, count)| std::cmp::Reverse(*count));

        for (category, count) in categories {
            section.push_str(&format!("| {} | {} |\n", category, count));
        }
        section.push('\n');
    }

    let patterns = top_patterns(summary, options.top_patterns);
    if !patterns.is_empty() {
        section.push_str("### Top Patterns\n\n");
        section.push_str("| Pattern | Occurrences |\n");
        section.push_str("|:---|:---:|\n");
        for (pattern, count) in patterns {
            section.push_str(&format!("| {} | {} |\n", pattern, count));
        }
        section.push('\n');
    }

    let lang_dist = language_distribution(files.values());
    if !lang_dist.is_empty() {
        section.push_str("### Files by Language\n\n");
        section.push_str("| Language | Files |\n");
        section.push_str("|:---|:---:|\n");

        let mut langs: Vec<_> = lang_dist.iter().collect();
        langs.sort_by_key(|(_, count)| std::cmp::Reverse(*count));

        for (lang, count) in langs {
            section.push_str(&format!("| {} | {} |\n", lang, count));
        }
        section.push('\n');
    }

    let problematic = most_problematic_files(files.values(), 5);
    if !problematic.is_empty() {
        section.push_str("### Most Problematic Files\n\n");
        section.push_str("| File | Findings |\n");
        section.push_str("|:---|:---:|\n");

        for (file, count) in problematic {
            section.push_str(&format!("| `{}` | {} |\n", file.path, count));
        }
        section.push('\n');
    }

    section
}

fn generate_findings_section<'a>(
    files: impl Iterator<Item = &'a FileReport>,
    options: &ReportOptions,
) -> String {
    let mut section = String::new();

    section.push_str("## Findings by File\n\n");

    let files_with_findings: Vec<_> = files.filter(|f| f.finding_count() > 0).collect();

    if files_with_findings.is_empty() {
        section.push_str("No findings in the analyzed files. 🎉\n\n");
        return section;
    }

    for file in files_with_findings {
        section.push_str(&generate_file_section(file, options));
    }

    section
}

fn generate_file_section(file: &FileReport, options: &ReportOptions) -> String {
    let mut section = String::new();

    section.push_str(&format!("### {}\n\n", file.path));
    section.push_str(&format!(
        "*Language: {} | Lines: {} | Findings: {}*\n\n",
        file.language,
        file.line_count,
        file.finding_count()
    ));

    for analysis in file.analyses.values() {
        section.push_str(&generate_analysis_block(analysis, options));
    }

    section.push_str("---\n\n");
    section
}

/// One kind's findings for a file.
fn generate_analysis_block(analysis: &AnalysisResponse, options: &ReportOptions) -> String {
    let mut block = String::new();

    let source = if analysis.ai_powered {
        analysis.providers.join(", ")
    } else {
        "rule-based".to_string()
    };
    block.push_str(&format!(
        "#### {} ({}, confidence {:.0}%, complexity {:.1}, {})\n\n",
        analysis.kind,
        source,
        analysis.confidence * 100.0,
        analysis.complexity_score,
        analysis.skill_level
    ));

    if let Some(meta) = &analysis.ensemble_metadata {
        block.push_str(&format!(
            "*Consensus: {} across {} model(s), est. cost ${:.4}*\n\n",
            meta.consensus_method,
            meta.models_used.len(),
            meta.estimated_cost
        ));
    }

    if !analysis.patterns.is_empty() {
        block.push_str(&format!("**Patterns:** {}\n\n", analysis.patterns.join(", ")));
    }

    let mut findings = analysis.findings.clone();
    findings.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.line.cmp(&b.line)));

    for finding in &findings {
        let line = finding
            .line
            .map(|l| format!(" (line {})", l))
            .unwrap_or_default();
        block.push_str(&format!(
            "- {} **{}** {}: {}{}\n",
            finding.severity.emoji(),
            finding.severity.to_string().to_uppercase(),
            finding.category,
            finding.message,
            line
        ));
    }
    if !findings.is_empty() {
        block.push('\n');
    }

    if options.include_suggestions && !analysis.suggestions.is_empty() {
        for suggestion in &analysis.suggestions {
            block.push_str(&format!("> 💡 {}\n", suggestion));
        }
        block.push('\n');
    }

    block
}

fn generate_footer() -> String {
    "---\n\n*Report generated by YoInsight*\n".to_string()
}

#[derive(Serialize)]
struct JsonReport<'a> {
    metadata: &'a ReportMetadata,
    #[serde(flatten)]
    run: &'a RepositoryRun,
}

/// Generate a JSON report.
pub fn generate_json_report(run: &RepositoryRun, metadata: &ReportMetadata) -> Result<String> {
    serde_json::to_string_pretty(&JsonReport { metadata, run }).map_err(Into::into)
}

/// Write report content to a file.
pub fn write_report(content: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write report to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::RunMode;
    use crate::models::{
        AnalysisKind, ConsensusMethod, EnsembleMetadata, Finding, RepositoryIdentity,
        RepositoryReport, SkillLevel,
    };
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn analysis() -> AnalysisResponse {
        AnalysisResponse {
            kind: AnalysisKind::Security,
            patterns: vec!["builder".to_string()],
            findings: vec![
                Finding {
                    category: "style".to_string(),
                    severity: Severity::Low,
                    message: "Long function".to_string(),
                    line: Some(40),
                },
                Finding {
                    category: "injection".to_string(),
                    severity: Severity::Critical,
                    message: "Query built from user input".to_string(),
                    line: Some(12),
                },
            ],
            complexity_score: 6.5,
            skill_level: SkillLevel::Advanced,
            suggestions: vec!["Use parameterized queries".to_string()],
            confidence: 0.8,
            elapsed_ms: 100,
            ai_powered: true,
            providers: vec!["ollama:codellama".to_string()],
            ensemble_metadata: Some(EnsembleMetadata {
                models_used: vec!["ollama:codellama".to_string()],
                consensus_confidence: 0.8,
                consensus_method: ConsensusMethod::ConfidenceBased,
                per_model_confidences: BTreeMap::new(),
                failed_models: BTreeMap::new(),
                estimated_cost: 0.0012,
            }),
        }
    }

    fn run(with_findings: bool) -> RepositoryRun {
        let mut response = analysis();
        if !with_findings {
            response.findings.clear();
        }
        let file = FileReport {
            path: "src/db.rs".to_string(),
            language: "Rust".to_string(),
            line_count: 80,
            content_digest: "d".repeat(64),
            analyses: [(AnalysisKind::Security, response)].into_iter().collect(),
        };
        let report = RepositoryReport::new(
            RepositoryIdentity::from_remote("https://github.com/acme/app"),
            "abc123",
            Utc::now(),
            [(file.path.clone(), file)].into_iter().collect(),
        );
        RepositoryRun {
            report,
            mode: RunMode::Incremental,
            reason: "2 changed file(s)".to_string(),
            analyzed_files: 1,
            reused_files: 3,
            removed_files: 0,
        }
    }

    fn metadata() -> ReportMetadata {
        ReportMetadata {
            source: "https://github.com/acme/app".to_string(),
            providers: vec!["ollama:codellama".to_string()],
            cache_backend: "memory".to_string(),
            duration_seconds: 3.2,
        }
    }

    fn options() -> ReportOptions {
        ReportOptions {
            include_suggestions: true,
            top_patterns: 10,
        }
    }

    #[test]
    fn test_generate_markdown_report() {
        let markdown = generate_markdown_report(&run(true), &metadata(), &options());

        assert!(markdown.contains("# YoInsight Report"));
        assert!(markdown.contains("**Run Mode:** incremental (2 changed file(s))"));
        assert!(markdown.contains("1 analyzed, 3 reused, 0 removed"));
        assert!(markdown.contains("### Top Patterns"));
        assert!(markdown.contains("| builder | 1 |"));
        assert!(markdown.contains("### src/db.rs"));
        assert!(markdown.contains("Use parameterized queries"));
        assert!(markdown.contains("est. cost $0.0012"));

        // Highest severity first
        let critical = markdown.find("Query built from user input").unwrap();
        let low = markdown.find("Long function").unwrap();
        assert!(critical < low);
    }

    #[test]
    fn test_suggestions_can_be_omitted() {
        let options = ReportOptions {
            include_suggestions: false,
            ..options()
        };
        let markdown = generate_markdown_report(&run(true), &metadata(), &options);
        assert!(!markdown.contains("Use parameterized queries"));
    }

    #[test]
    fn test_no_findings_message() {
        let markdown = generate_markdown_report(&run(false), &metadata(), &options());
        assert!(markdown.contains("No findings in the analyzed files"));
        assert!(!markdown.contains("### src/db.rs"));
    }

    #[test]
    fn test_generate_json_report() {
        let json = generate_json_report(&run(true), &metadata()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["mode"], "incremental");
        assert_eq!(value["metadata"]["cache_backend"], "memory");
        assert_eq!(value["report"]["revision"], "abc123");
        assert_eq!(value["report"]["summary"]["critical"], 1);
    }

    #[test]
    fn test_write_report_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/report.md");
        write_report("# hi\n", &path).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "# hi\n");
    }
}
