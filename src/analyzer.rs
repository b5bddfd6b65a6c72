//! Optional content analysis after a command has run.
//!
//! [`requires_analysis`] decides from the request text alone whether the
//! ANALYZING stage runs. It is a plain function so it can be exercised
//! separately from the workflow.

use crate::claude::ClaudeClient;
use crate::error::AnalysisError;
use crate::generator::GeneratedCommand;
use crate::request::CommandRequest;
use crate::shell::ExecutionResult;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use tracing::info;

const ANALYSIS_KEYWORDS: &[&str] = &[
    "explain",
    "analyze",
    "analyse",
    "check what",
    "what is the purpose",
    "understand",
    "summarize",
    "review",
    "describe",
    "tell me about",
];

const CONTENT_KEYWORDS: &[&str] = &["read", "checkout", "clone", "download", "cat", "type"];

const MAX_ANALYZED_CHARS: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisKind {
    Purpose,
    Security,
    Explain,
    General,
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AnalysisKind::Purpose => "purpose",
            AnalysisKind::Security => "security",
            AnalysisKind::Explain => "explain",
            AnalysisKind::General => "general",
        };
        f.write_str(label)
    }
}

/// True when the request asks both to fetch content and to interpret it,
/// e.g. "read main.py and explain what it does".
pub fn requires_analysis(request_text: &str) -> bool {
    let lower = request_text.to_lowercase();
    let wants_analysis = ANALYSIS_KEYWORDS.iter().any(|k| lower.contains(k));
    let fetches_content = lower
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| CONTENT_KEYWORDS.contains(&word));
    wants_analysis && fetches_content
}

pub fn analysis_kind(request_text: &str) -> AnalysisKind {
    let lower = request_text.to_lowercase();
    if lower.contains("purpose") || lower.contains("what is") {
        AnalysisKind::Purpose
    } else if lower.contains("security") || lower.contains("vulnerab") {
        AnalysisKind::Security
    } else if lower.contains("explain") {
        AnalysisKind::Explain
    } else {
        AnalysisKind::General
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Analysis {
    pub kind: AnalysisKind,
    pub summary: String,
}

#[async_trait]
pub trait ContentAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        request: &CommandRequest,
        command: &GeneratedCommand,
        result: &ExecutionResult,
        kind: AnalysisKind,
    ) -> Result<Analysis, AnalysisError>;
}

fn analyzable_output(result: &ExecutionResult) -> Result<String, AnalysisError> {
    let stdout = result.stdout_text();
    let stdout = stdout.trim();
    if stdout.is_empty() {
        return Err(AnalysisError::NoContent("the command produced no output".to_string()));
    }
    Ok(match stdout.char_indices().nth(MAX_ANALYZED_CHARS) {
        Some((cut, _)) => stdout[..cut].to_string(),
        None => stdout.to_string(),
    })
}

pub struct LlmAnalyzer {
    client: ClaudeClient,
}

impl LlmAnalyzer {
    pub fn new(client: ClaudeClient) -> Self {
        Self { client }
    }

    fn system_prompt(kind: AnalysisKind) -> &'static str {
        match kind {
            AnalysisKind::Purpose => {
                "You are an expert code and document analyst. Analyze the given content \
                 and explain its purpose, what it does, and its key components."
            }
            AnalysisKind::Security => {
                "You are a security analyst. Review the given content for potential \
                 security issues, vulnerabilities, and best practice violations."
            }
            AnalysisKind::Explain => {
                "You are a patient tutor. Explain the given content step by step in \
                 plain language for someone unfamiliar with it."
            }
            AnalysisKind::General => "You are a helpful assistant that explains command output in plain language.",
        }
    }
}

#[async_trait]
impl ContentAnalyzer for LlmAnalyzer {
    async fn analyze(
        &self,
        request: &CommandRequest,
        command: &GeneratedCommand,
        result: &ExecutionResult,
        kind: AnalysisKind,
    ) -> Result<Analysis, AnalysisError> {
        let output = analyzable_output(result)?;
        info!("Analyzing output of '{}' ({})", command.text, kind);

        let prompt = format!(
            "The user wanted: \"{}\"

Command executed: {}

Output:
```
{}
```

Explain:
1. What the output shows
2. Key findings
3. A direct answer to what the user wanted
4. Next steps, if any",
            request.text(),
            command.text,
            output
        );

        let summary = self.client.complete(Self::system_prompt(kind), &prompt).await?;
        Ok(Analysis {
            kind,
            summary: summary.trim().to_string(),
        })
    }
}

/// Describes output size and shape without a model. Used in mock mode.
pub struct OutputStatsAnalyzer;

#[async_trait]
impl ContentAnalyzer for OutputStatsAnalyzer {
    async fn analyze(
        &self,
        _request: &CommandRequest,
        _command: &GeneratedCommand,
        result: &ExecutionResult,
        kind: AnalysisKind,
    ) -> Result<Analysis, AnalysisError> {
        let output = analyzable_output(result)?;
        let lines = output.lines().count();
        let words = output.split_whitespace().count();
        let first = output.lines().next().unwrap_or_default();

        Ok(Analysis {
            kind,
            summary: format!(
                "Output has {} lines, {} words and {} bytes. First line: {}",
                lines,
                words,
                result.stdout.len(),
                first
            ),
        })
    }
}
