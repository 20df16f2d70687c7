//! Prompts and response parsing shared by the model backends.

use crate::error::ProviderError;
use crate::models::{AnalysisCandidate, AnalysisKind, AnalysisOutput, Finding, Severity, SkillLevel};
use serde::Deserialize;
use serde_json::Value;

/// Confidence assumed when a model does not report one.
pub const DEFAULT_MODEL_CONFIDENCE: f64 = 0.7;

/// Bumped whenever prompts change so cached results are not reused.
pub const PROMPT_VERSION: &str = "v3";

/// System prompt used for every kind.
pub const SYSTEM_PROMPT: &str = r#"You are an expert code reviewer. You analyze one source file at a time.
Reply with a single JSON object and nothing else. No markdown, no prose."#;

const RESPONSE_SHAPE: &str = r#"{"patterns": ["..."], "findings": [{"category": "...", "severity": "low|medium|high|critical", "message": "...", "line": 12}], "complexity_score": 0.0, "skill_level": "beginner|intermediate|advanced|expert", "suggestions": ["..."], "confidence": 0.0}"#;

fn kind_instructions(kind: AnalysisKind) -> &'static str {
    match kind {
        AnalysisKind::Pattern => {
            "Identify the design patterns, idioms and anti-patterns used in this code. \
             List pattern names in `patterns` (e.g. \"builder\", \"singleton\", \"god_object\"). \
             Report anti-patterns as findings."
        }
        AnalysisKind::Quality => {
            "Assess maintainability: naming, function length, duplication, error handling \
             and documentation. Report concrete problems as findings."
        }
        AnalysisKind::Security => {
            "Look for security vulnerabilities: injection, hardcoded secrets, unsafe \
             deserialization, weak cryptography, path traversal, missing input validation. \
             Report each as a finding with an accurate severity."
        }
        AnalysisKind::Performance => {
            "Look for performance problems: quadratic loops, repeated allocation, blocking \
             I/O in hot paths, unnecessary copies, N+1 queries. Report each as a finding."
        }
    }
}

/// Build the user prompt, truncating the source to fit `context_window`.
pub fn build_prompt(
    candidate: &AnalysisCandidate,
    kind: AnalysisKind,
    context_window: usize,
) -> String {
    // Leave room for instructions and the reply.
    let budget_chars = context_window.saturating_sub(1024).max(256) * 4;
    let source = if candidate.content.len() > budget_chars {
        let mut end = budget_chars;
        while !candidate.content.is_char_boundary(end) {
            end -= 1;
        }
        &candidate.content[..end]
    } else {
        candidate.content.as_str()
    };

    let mut prompt = String::new();
    prompt.push_str(kind_instructions(kind));
    prompt.push_str("\n\nRespond with JSON in exactly this shape:\n");
    prompt.push_str(RESPONSE_SHAPE);
    prompt.push_str(
        "\n\n`complexity_score` ranges from 0 (trivial) to 10 (very complex). \
         `confidence` is how sure you are of this assessment, from 0 to 1.\n\n",
    );
    prompt.push_str(&format!(
        "### FILE: {} ({})\n```\n{}\n```\n",
        candidate.file_path, candidate.language, source
    ));
    prompt
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    patterns: Vec<Value>,
    #[serde(default)]
    findings: Vec<Value>,
    #[serde(default)]
    complexity_score: Option<f64>,
    #[serde(default)]
    skill_level: Option<String>,
    #[serde(default)]
    suggestions: Vec<Value>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Parse a model reply into an output and a confidence.
///
/// The first `{` to the last `}` is taken as the JSON body, which tolerates
/// models that wrap their answer in code fences or prose.
pub fn parse_response(raw: &str) -> Result<(AnalysisOutput, f64), ProviderError> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let body = match (start, end) {
        (Some(s), Some(e)) if e > s => &raw[s..=e],
        _ => {
            return Err(ProviderError::Parse {
                message: "no JSON object in response".to_string(),
                raw: raw.to_string(),
            })
        }
    };

    let parsed: RawAnalysis = serde_json::from_str(body).map_err(|e| ProviderError::Parse {
        message: e.to_string(),
        raw: raw.to_string(),
    })?;

    let output = AnalysisOutput {
        patterns: normalize_list(&parsed.patterns),
        findings: parsed.findings.iter().filter_map(value_to_finding).collect(),
        complexity_score: parsed
            .complexity_score
            .filter(|s| s.is_finite())
            .unwrap_or(5.0)
            .clamp(0.0, 10.0),
        skill_level: parsed
            .skill_level
            .as_deref()
            .map(SkillLevel::from_lossy)
            .unwrap_or_default(),
        suggestions: parsed
            .suggestions
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    };

    let confidence = parsed
        .confidence
        .filter(|c| c.is_finite())
        .unwrap_or(DEFAULT_MODEL_CONFIDENCE)
        .clamp(0.0, 1.0);

    Ok((output, confidence))
}

/// Pattern names are lowercased and snake_cased so providers agree on spelling.
fn normalize_list(values: &[Value]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        let name = match value {
            Value::String(s) => s.clone(),
            Value::Object(map) => match map.get("name").and_then(|n| n.as_str()) {
                Some(n) => n.to_string(),
                None => continue,
            },
            _ => continue,
        };
        let normalized = normalize_pattern_name(&name);
        if !normalized.is_empty() && !out.contains(&normalized) {
            out.push(normalized);
        }
    }
    out
}

pub fn normalize_pattern_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

fn value_to_finding(value: &Value) -> Option<Finding> {
    let message = value
        .get("message")
        .or_else(|| value.get("description"))
        .and_then(|m| m.as_str())?
        .trim()
        .to_string();
    if message.is_empty() {
        return None;
    }
    Some(Finding {
        category: value["category"].as_str().unwrap_or("general").to_string(),
        severity: Severity::from_lossy(value["severity"].as_str().unwrap_or("medium")),
        message,
        line: value["line"].as_u64().map(|l| l as usize),
    })
}
