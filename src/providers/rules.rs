//! Deterministic rule-based fallback provider.
//!
//! Always available, zero cost. Used when no model provider is available or
//! when every model provider failed. The rule tables are line-oriented
//! regular expressions; the same input always yields the same output.

use super::{ProviderAdapter, ProviderOutcome};
use crate::error::ProviderError;
use crate::models::{
    AnalysisCandidate, AnalysisKind, AnalysisOutput, BackendKind, Finding, ProviderDescriptor,
    Severity, SkillLevel,
};
use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;

/// Identifier of the fallback provider.
pub const RULES_PROVIDER_ID: &str = "rules";

/// Confidence stamped on every rule-based result.
pub const RULE_CONFIDENCE: f64 = 0.5;

struct Rule {
    category: &'static str,
    pattern: &'static str,
    severity: Severity,
    message: &'static str,
    suggestion: &'static str,
}

struct CompiledRule {
    rule: &'static Rule,
    regex: Regex,
}

const QUALITY_RULES: &[Rule] = &[
    Rule {
        category: "maintainability",
        pattern: r"\b(TODO|FIXME|XXX|HACK)\b",
        severity: Severity::Low,
        message: "Unresolved TODO/FIXME marker",
        suggestion: "Track open work in the issue tracker and remove stale markers",
    },
    Rule {
        category: "error_handling",
        pattern: r"\.unwrap\(\)|\.expect\(",
        severity: Severity::Medium,
        message: "Panicking unwrap/expect on a fallible value",
        suggestion: "Propagate errors with `?` or handle the failure case explicitly",
    },
    Rule {
        category: "error_handling",
        pattern: r"^\s*except\s*:|catch\s*\(\s*\w*\s*\)\s*\{\s*\}",
        severity: Severity::Medium,
        message: "Exception swallowed by a bare or empty handler",
        suggestion: "Catch specific exceptions and log or re-raise them",
    },
    Rule {
        category: "debugging",
        pattern: r"console\.log\(|\bprintln!\(|^\s*print\(|System\.out\.println",
        severity: Severity::Low,
        message: "Debug output left in code",
        suggestion: "Use the project's logging facility instead of printing",
    },
    Rule {
        category: "readability",
        pattern: r"^.{121,}$",
        severity: Severity::Low,
        message: "Line longer than 120 characters",
        suggestion: "Break long lines to keep the code readable",
    },
];

const SECURITY_RULES: &[Rule] = &[
    Rule {
        category: "hardcoded_secret",
        pattern: r#"(?i)(password|passwd|secret|api_?key|access_?token|private_?key)\s*[:=]\s*["'][^"']{4,}["']"#,
        severity: Severity::Critical,
        message: "Hardcoded credential",
        suggestion: "Load secrets from the environment or a secret manager",
    },
    Rule {
        category: "injection",
        pattern: r#"(?i)"(select|insert|update|delete)\s[^"]*"\s*(\+|%|\.format\()|'(select|insert|update|delete)\s[^']*'\s*(\+|%|\.format\()|format!\(\s*"(select|insert|update|delete)\s"#,
        severity: Severity::High,
        message: "SQL statement built from string concatenation",
        suggestion: "Use parameterized queries",
    },
    Rule {
        category: "code_execution",
        pattern: r"\beval\s*\(|\bexec\s*\(",
        severity: Severity::High,
        message: "Dynamic code evaluation",
        suggestion: "Avoid eval/exec on data that can be influenced by users",
    },
    Rule {
        category: "command_injection",
        pattern: r"shell\s*=\s*True|os\.system\(|Runtime\.getRuntime\(\)\.exec",
        severity: Severity::High,
        message: "Shell command execution with interpolated input",
        suggestion: "Pass argument vectors instead of shell strings",
    },
    Rule {
        category: "deserialization",
        pattern: r"pickle\.loads?\(|yaml\.load\(|ObjectInputStream",
        severity: Severity::High,
        message: "Unsafe deserialization",
        suggestion: "Use safe loaders (e.g. yaml.safe_load) or a schema-checked format",
    },
    Rule {
        category: "weak_crypto",
        pattern: r"(?i)\b(md5|sha1)\b",
        severity: Severity::Medium,
        message: "Weak hash algorithm",
        suggestion: "Use SHA-256 or a password hash such as argon2 where appropriate",
    },
    Rule {
        category: "xss",
        pattern: r"\.innerHTML\s*=|dangerouslySetInnerHTML",
        severity: Severity::Medium,
        message: "HTML injected without escaping",
        suggestion: "Escape or sanitize content before inserting it into the DOM",
    },
    Rule {
        category: "memory_safety",
        pattern: r"\bunsafe\s*\{",
        severity: Severity::Medium,
        message: "Unsafe block",
        suggestion: "Document the invariants the unsafe block relies on",
    },
    Rule {
        category: "transport",
        pattern: r#""http://(?:[a-z0-9.-]+)"#,
        severity: Severity::Low,
        message: "Plain HTTP URL",
        suggestion: "Prefer HTTPS endpoints",
    },
];

const PERFORMANCE_RULES: &[Rule] = &[
    Rule {
        category: "blocking",
        pattern: r"thread::sleep|time\.sleep\(|Thread\.sleep\(",
        severity: Severity::Medium,
        message: "Blocking sleep",
        suggestion: "Use timers or async sleeps instead of blocking the thread",
    },
    Rule {
        category: "allocation",
        pattern: r"\.clone\(\)\.clone\(\)|\.to_string\(\)\.to_string\(\)|\.collect::<Vec<[^>]*>>\(\)\.len\(\)",
        severity: Severity::Low,
        message: "Redundant allocation",
        suggestion: "Avoid intermediate allocations that are immediately discarded",
    },
    Rule {
        category: "regex",
        pattern: r"Regex::new\(|re\.compile\(|new RegExp\(",
        severity: Severity::Low,
        message: "Regular expression compiled at call site",
        suggestion: "Compile regular expressions once and reuse them",
    },
    Rule {
        category: "io",
        pattern: r"\.readlines\(\)|read_to_end\(|readFileSync\(",
        severity: Severity::Low,
        message: "Whole file read into memory",
        suggestion: "Stream large inputs instead of reading them at once",
    },
];

const PATTERN_RULES: &[(&str, &str)] = &[
    ("builder", r"\w*Builder\b|fn builder\(|\.build\(\)|fn build\("),
    ("singleton", r"getInstance\(|\bINSTANCE\b|OnceLock|OnceCell|lazy_static!|_instance\s*="),
    ("factory", r"\w*Factory\b|\bfn create_\w+|\bdef create_\w+"),
    ("observer", r"\bsubscribe\(|add_listener|addEventListener|\bon_event\b|\bnotify_all\b"),
    ("decorator", r"^\s*@[A-Za-z_][\w.]*"),
    ("iterator", r"impl\s+Iterator|__iter__|\byield\b"),
    ("async_await", r"\basync\s+(fn|def|function)\b|\bawait\b"),
    ("error_propagation", r"\)\?;|\bResult<|\btry\s*[:{]"),
    ("dependency_injection", r"Arc<dyn\s|Box<dyn\s|@Inject|\binterface\s+\w+"),
    ("strategy", r"\w+Strategy\b"),
    ("repository", r"\w+Repository\b"),
];

const BRANCH_PATTERN: &str = r"\b(if|else if|elif|for|while|match|case|catch|except)\b|&&|\|\|";
const LOOP_PATTERN: &str = r"^\s*(for|while|loop)\b|\.forEach\(|\.iter\(\)\.for_each";

fn compile(rules: &'static [Rule]) -> Vec<CompiledRule> {
    rules
        .iter()
        .filter_map(|rule| {
            Regex::new(&format!("(?m){}", rule.pattern))
                .ok()
                .map(|regex| CompiledRule { rule, regex })
        })
        .collect()
}

fn rules_for(kind: AnalysisKind) -> &'static [CompiledRule] {
    static QUALITY: OnceLock<Vec<CompiledRule>> = OnceLock::new();
    static SECURITY: OnceLock<Vec<CompiledRule>> = OnceLock::new();
    static PERFORMANCE: OnceLock<Vec<CompiledRule>> = OnceLock::new();

    match kind {
        AnalysisKind::Quality => QUALITY.get_or_init(|| compile(QUALITY_RULES)),
        AnalysisKind::Security => SECURITY.get_or_init(|| compile(SECURITY_RULES)),
        AnalysisKind::Performance => PERFORMANCE.get_or_init(|| compile(PERFORMANCE_RULES)),
        AnalysisKind::Pattern => &[],
    }
}

fn pattern_detectors() -> &'static [(&'static str, Regex)] {
    static DETECTORS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    DETECTORS.get_or_init(|| {
        PATTERN_RULES
            .iter()
            .filter_map(|(name, pattern)| {
                Regex::new(&format!("(?m){}", pattern)).ok().map(|r| (*name, r))
            })
            .collect()
    })
}

fn regex(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn branch_regex() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    regex(&CELL, BRANCH_PATTERN)
}

fn loop_regex() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    regex(&CELL, LOOP_PATTERN)
}

fn line_of(content: &str, byte_offset: usize) -> usize {
    content[..byte_offset].matches('\n').count() + 1
}

fn indent_of(line: &str) -> usize {
    line.chars()
        .take_while(|c| c.is_whitespace())
        .map(|c| if c == '\t' { 4 } else { 1 })
        .sum()
}

/// 0-10 score from branch density and nesting depth.
fn complexity_score(content: &str) -> f64 {
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return 0.0;
    }
    let branches = branch_regex()
        .map(|r| r.find_iter(content).count())
        .unwrap_or(0);
    let density = branches as f64 / lines.len() as f64;
    let max_depth = lines.iter().map(|l| indent_of(l) / 4).max().unwrap_or(0);
    let size = (lines.len() as f64 / 200.0).min(2.0);

    let score = density * 20.0 + max_depth as f64 * 0.5 + size;
    (score * 10.0).round().clamp(0.0, 100.0) / 10.0
}

fn detect_patterns(content: &str) -> Vec<String> {
    pattern_detectors()
        .iter()
        .filter(|(_, regex)| regex.is_match(content))
        .map(|(name, _)| name.to_string())
        .collect()
}

fn skill_level(patterns: usize, complexity: f64) -> SkillLevel {
    match patterns {
        0 => SkillLevel::Beginner,
        1 if complexity > 6.0 => SkillLevel::Beginner,
        1..=3 => SkillLevel::Intermediate,
        4..=5 => SkillLevel::Advanced,
        _ => SkillLevel::Expert,
    }
}

/// Loops nested inside another loop within the same indentation block.
fn nested_loop_lines(content: &str) -> Vec<usize> {
    let Some(loop_re) = loop_regex() else {
        return Vec::new();
    };
    let mut open: Vec<usize> = Vec::new();
    let mut nested = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let indent = indent_of(line);
        while open.last().is_some_and(|&outer| indent <= outer) {
            open.pop();
        }
        if loop_re.is_match(line) {
            if !open.is_empty() {
                nested.push(idx + 1);
            }
            open.push(indent);
        }
    }
    nested
}

fn apply_rules(content: &str, rules: &[CompiledRule], output: &mut AnalysisOutput) {
    for compiled in rules {
        let mut matches = compiled.regex.find_iter(content);
        let Some(first) = matches.next() else {
            continue;
        };
        let occurrences = 1 + matches.count();
        let message = if occurrences > 1 {
            format!("{} ({} occurrences)", compiled.rule.message, occurrences)
        } else {
            compiled.rule.message.to_string()
        };
        output.findings.push(Finding {
            category: compiled.rule.category.to_string(),
            severity: compiled.rule.severity,
            message,
            line: Some(line_of(content, first.start())),
        });
        let suggestion = compiled.rule.suggestion.to_string();
        if !output.suggestions.contains(&suggestion) {
            output.suggestions.push(suggestion);
        }
    }
}

/// Run the rule table for `kind` over `content`.
pub fn analyze_source(content: &str, kind: AnalysisKind) -> AnalysisOutput {
    let patterns = detect_patterns(content);
    let complexity = complexity_score(content);

    let mut output = AnalysisOutput {
        patterns: Vec::new(),
        findings: Vec::new(),
        complexity_score: complexity,
        skill_level: skill_level(patterns.len(), complexity),
        suggestions: Vec::new(),
    };

    match kind {
        AnalysisKind::Pattern => {
            output.patterns = patterns;
        }
        AnalysisKind::Performance => {
            apply_rules(content, rules_for(kind), &mut output);
            let nested = nested_loop_lines(content);
            if let Some(&first) = nested.first() {
                output.findings.push(Finding {
                    category: "algorithmic".to_string(),
                    severity: Severity::Medium,
                    message: format!("Nested loop ({} occurrences)", nested.len()),
                    line: Some(first),
                });
                output
                    .suggestions
                    .push("Replace nested scans with a map or set lookup".to_string());
            }
        }
        AnalysisKind::Quality | AnalysisKind::Security => {
            apply_rules(content, rules_for(kind), &mut output);
        }
    }

    if kind == AnalysisKind::Quality && complexity >= 7.0 {
        output.findings.push(Finding {
            category: "complexity".to_string(),
            severity: Severity::Medium,
            message: format!("High cyclomatic density (score {:.1})", complexity),
            line: None,
        });
        output
            .suggestions
            .push("Split branch-heavy functions into smaller units".to_string());
    }

    output
}

/// The always-available fallback provider.
#[derive(Debug, Clone, Default)]
pub struct RuleBasedProvider;

impl RuleBasedProvider {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous entry point; the fallback never suspends.
    pub fn analyze_now(
        &self,
        candidate: &AnalysisCandidate,
        kind: AnalysisKind,
    ) -> ProviderOutcome {
        ProviderOutcome {
            output: analyze_source(&candidate.content, kind),
            confidence: RULE_CONFIDENCE,
            tokens_used: 0,
        }
    }
}

#[async_trait]
impl ProviderAdapter for RuleBasedProvider {
    fn describe(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            id: RULES_PROVIDER_ID.to_string(),
            backend: BackendKind::RuleBased,
            model: "rules".to_string(),
            cost_per_1k_tokens: 0.0,
            context_window: usize::MAX,
            weight: 0.5,
            available: true,
        }
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn analyze(
        &self,
        candidate: &AnalysisCandidate,
        kind: AnalysisKind,
    ) -> Result<ProviderOutcome, ProviderError> {
        Ok(self.analyze_now(candidate, kind))
    }
}
