//! Error types for the command pipeline.
//!
//! Each collaborator boundary gets its own error enum so the workflow can
//! decide, per failure kind, whether to retry, degrade, or end the turn.
//! Policy outcomes (blocked/warned verdicts, timeouts, truncation) are not
//! errors; they travel as data on verdicts and execution results.

use crate::shell::ShellKind;
use std::path::PathBuf;
use thiserror::Error;

/// Failure talking to the language model backend.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("no Anthropic API key configured (set ANTHROPIC_API_KEY or run `shellgate --set-api-key`)")]
    MissingApiKey,
    #[error("request to language model failed: {0}")]
    Transport(String),
    #[error("language model reply could not be parsed: {0}")]
    MalformedReply(String),
}

/// The generator could not produce a usable command. Recoverable via retry.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("command generator unavailable: {0}")]
    Unavailable(String),
    #[error("command generator returned malformed output: {0}")]
    Malformed(String),
}

impl From<LlmError> for GenerationError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::MalformedReply(reason) => GenerationError::Malformed(reason),
            other => GenerationError::Unavailable(other.to_string()),
        }
    }
}

/// The validator could not judge the outcome. Degrades to "validation unavailable".
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("result validator unavailable: {0}")]
    Unavailable(String),
    #[error("result validator returned malformed output: {0}")]
    Malformed(String),
}

impl From<LlmError> for ValidationError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::MalformedReply(reason) => ValidationError::Malformed(reason),
            other => ValidationError::Unavailable(other.to_string()),
        }
    }
}

/// Content analysis failed. The turn still presents the execution result.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("content analyzer unavailable: {0}")]
    Unavailable(String),
    #[error("nothing to analyze: {0}")]
    NoContent(String),
}

impl From<LlmError> for AnalysisError {
    fn from(err: LlmError) -> Self {
        AnalysisError::Unavailable(err.to_string())
    }
}

/// A single shell could not be started.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{shell} is not installed ({program} not found)")]
    NotFound { shell: ShellKind, program: PathBuf },
    #[error("permission denied launching {shell} ({program})")]
    PermissionDenied { shell: ShellKind, program: PathBuf },
    #[error("failed to run {shell} ({program}): {source}")]
    Io {
        shell: ShellKind,
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LaunchError {
    /// Classifies a spawn failure by its OS error kind.
    pub fn from_spawn(shell: ShellKind, program: PathBuf, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => LaunchError::NotFound { shell, program },
            std::io::ErrorKind::PermissionDenied => LaunchError::PermissionDenied { shell, program },
            _ => LaunchError::Io { shell, program, source },
        }
    }
}

/// No shell in the fallback sequence produced an execution.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionFailure {
    #[error("no shell available: tried {}", format_shells(.tried))]
    ShellExhausted { tried: Vec<ShellKind> },
    #[error("permission denied launching {shell}")]
    LaunchDenied { shell: ShellKind },
    #[error("failed to launch {shell}: {reason}")]
    LaunchFailed { shell: ShellKind, reason: String },
}

fn format_shells(shells: &[ShellKind]) -> String {
    shells
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Misuse of the turn protocol by the caller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("no confirmation is pending (turn is in stage {0})")]
    NotAwaitingConfirmation(String),
    #[error("turn has already finished")]
    TurnFinished,
}
