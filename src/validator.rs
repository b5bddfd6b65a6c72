//! Post-execution judgement of whether a run achieved the request.
//!
//! Validation is advisory. It runs strictly after execution and its result
//! never gates anything; a failing validator degrades to "validation
//! unavailable" in the presented report.

use crate::claude::{ClaudeClient, parse_json_reply};
use crate::error::ValidationError;
use crate::generator::GeneratedCommand;
use crate::request::CommandRequest;
use crate::shell::ExecutionResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

const PREVIEW_CHARS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub success: bool,
    pub rationale: String,
    pub confidence: Confidence,
    pub suggestions: Vec<String>,
}

#[async_trait]
pub trait ResultValidator: Send + Sync {
    async fn validate(
        &self,
        request: &CommandRequest,
        command: &GeneratedCommand,
        result: &ExecutionResult,
    ) -> Result<ValidationResult, ValidationError>;
}

#[derive(Debug, Deserialize)]
struct ValidationReply {
    passed: bool,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    suggestions: Vec<String>,
    #[serde(default)]
    confidence: Option<String>,
}

pub struct LlmValidator {
    client: ClaudeClient,
}

const SYSTEM_PROMPT: &str = "You are an expert at validating shell command execution results.

Your role:
1. Determine if the command execution achieved the user's stated goal
2. Analyze stdout, stderr, exit code and the timeout marker
3. Provide clear reasoning for your assessment

Guidelines:
- Exit code 0 with expected output = PASS
- Exit code 0 with empty output might be PASS if the operation produces no output
- Non-zero exit code = usually FAIL unless stderr shows it was only a warning
- A timed out command did not finish and usually FAILS
- Distinguish \"no results found\" from \"error while searching\"

Respond with EXACTLY one JSON object, no other text:
{
  \"passed\": true,
  \"reasoning\": \"explanation of the decision\",
  \"suggestions\": [\"optional improvements\"],
  \"confidence\": \"high|medium|low\"
}";

impl LlmValidator {
    pub fn new(client: ClaudeClient) -> Self {
        Self { client }
    }

    fn build_prompt(request: &CommandRequest, command: &GeneratedCommand, result: &ExecutionResult) -> String {
        format!(
            "User's original intent: {}

Command executed ({}): {}

Execution results:
- Exit code: {}
- Execution time: {:.2} seconds
- Timed out: {}
- Output truncated: {}

Standard Output:
{}

Standard Error:
{}

Did this execution successfully achieve the user's intent?",
            request.text(),
            result.shell,
            command.text,
            result.exit_code,
            result.elapsed.as_secs_f64(),
            result.timed_out,
            result.truncated,
            preview(&result.stdout_text()),
            preview(&result.stderr_text()),
        )
    }
}

#[async_trait]
impl ResultValidator for LlmValidator {
    async fn validate(
        &self,
        request: &CommandRequest,
        command: &GeneratedCommand,
        result: &ExecutionResult,
    ) -> Result<ValidationResult, ValidationError> {
        let prompt = Self::build_prompt(request, command, result);
        let text = self.client.complete(SYSTEM_PROMPT, &prompt).await?;
        let reply: ValidationReply = parse_json_reply(&text)?;
        info!("Validation verdict: passed={}", reply.passed);

        Ok(ValidationResult {
            success: reply.passed,
            rationale: reply.reasoning,
            confidence: match reply.confidence.as_deref().map(str::to_ascii_lowercase).as_deref() {
                Some("high") => Confidence::High,
                Some("medium") => Confidence::Medium,
                _ => Confidence::Low,
            },
            suggestions: reply.suggestions,
        })
    }
}

/// Judges by exit status alone. Used in mock mode.
pub struct HeuristicValidator;

#[async_trait]
impl ResultValidator for HeuristicValidator {
    async fn validate(
        &self,
        _request: &CommandRequest,
        _command: &GeneratedCommand,
        result: &ExecutionResult,
    ) -> Result<ValidationResult, ValidationError> {
        let (success, rationale) = if result.timed_out {
            (false, "The command did not finish before the timeout".to_string())
        } else if result.exit_code == 0 {
            (true, "The command exited with status 0".to_string())
        } else {
            (false, format!("The command exited with status {}", result.exit_code))
        };

        Ok(ValidationResult {
            success,
            rationale,
            confidence: Confidence::Medium,
            suggestions: Vec::new(),
        })
    }
}

/// First [`PREVIEW_CHARS`] characters, with a marker when cut.
pub fn preview(text: &str) -> String {
    if text.is_empty() {
        return "(empty)".to_string();
    }
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}\n... (output truncated)", &text[..cut]),
        None => text.to_string(),
    }
}
