use crate::claude::{ClaudeClient, parse_json_reply};
use crate::error::GenerationError;
use crate::request::CommandRequest;
use crate::shell::ShellKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// Safety level declared by the generator. Advisory only; the command filter
/// is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyHint {
    Safe,
    Caution,
    Dangerous,
    Unknown,
}

impl SafetyHint {
    fn parse(level: Option<&str>) -> Self {
        match level.map(|l| l.trim().to_ascii_lowercase()).as_deref() {
            Some("safe") => SafetyHint::Safe,
            Some("caution") => SafetyHint::Caution,
            Some("dangerous") => SafetyHint::Dangerous,
            _ => SafetyHint::Unknown,
        }
    }
}

impl fmt::Display for SafetyHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SafetyHint::Safe => "safe",
            SafetyHint::Caution => "caution",
            SafetyHint::Dangerous => "dangerous",
            SafetyHint::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// One generation result. Superseded, never mutated, on retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedCommand {
    pub text: String,
    pub shell: ShellKind,
    pub explanation: String,
    pub safety_hint: SafetyHint,
    /// Zero-based index of the generation call within the turn.
    pub attempt: u32,
    pub warnings: Vec<String>,
    pub assumptions: Vec<String>,
}

#[async_trait]
pub trait CommandGenerator: Send + Sync {
    /// Produces a command for `request`, taking all feedback gathered so far
    /// in the turn into account.
    async fn generate(
        &self,
        request: &CommandRequest,
        feedback: &[String],
        attempt: u32,
    ) -> Result<GeneratedCommand, GenerationError>;
}

// =========================================================================
// LLM-backed generator
// =========================================================================

#[derive(Debug, Deserialize)]
struct GenerationReply {
    #[serde(default)]
    command: String,
    #[serde(default)]
    shell: Option<String>,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    safety_level: Option<String>,
    #[serde(default)]
    warnings: Vec<String>,
    #[serde(default)]
    assumptions: Vec<String>,
}

pub struct LlmGenerator {
    client: ClaudeClient,
    target_shell: ShellKind,
}

impl LlmGenerator {
    /// `target_shell` is the shell the prompt asks for, normally the first
    /// entry of the fallback sequence.
    pub fn new(client: ClaudeClient, target_shell: ShellKind) -> Self {
        Self { client, target_shell }
    }

    fn system_prompt(&self) -> String {
        format!(
            "You are an expert {shell} command generator.

Your role:
1. Convert natural language requests into safe, efficient {shell} commands
2. Provide a clear explanation of what the command does
3. Assess safety and warn about potentially dangerous operations

Guidelines:
- Produce a single command line that can be passed to {shell} non-interactively
- Prefer read-only operations unless the request explicitly asks for changes
- Never add destructive flags (recursive deletion, force) unless explicitly requested

Safety levels:
- \"safe\": read-only operations, no system changes
- \"caution\": file creation, network operations, process management
- \"dangerous\": deletion, system modification, registry or permission changes

CRITICAL: respond with EXACTLY one JSON object, no code fences, no other text:
{{
  \"command\": \"the command line\",
  \"shell\": \"{shell_id}\",
  \"explanation\": \"what this command does in plain English\",
  \"safety_level\": \"safe|caution|dangerous\",
  \"warnings\": [\"risks, if any\"],
  \"assumptions\": [\"assumptions made about the request\"]
}}",
            shell = self.target_shell_name(),
            shell_id = self.target_shell,
        )
    }

    fn target_shell_name(&self) -> &'static str {
        match self.target_shell {
            ShellKind::PowerShell => "PowerShell",
            ShellKind::Cmd => "Windows cmd.exe",
            ShellKind::Bash => "bash",
            ShellKind::Sh => "POSIX sh",
        }
    }

    fn build_prompt(&self, request: &CommandRequest, feedback: &[String], attempt: u32) -> String {
        let mut prompt = String::new();

        if let Some(context) = request.context() {
            prompt.push_str(context);
            prompt.push_str("\n\n");
        }

        prompt.push_str(&format!(
            "User request: {}\n\nGenerate a {} command to fulfill this request.",
            request.text(),
            self.target_shell_name()
        ));

        if !feedback.is_empty() {
            prompt.push_str("\n\nPrevious attempts were rejected with this feedback:");
            for entry in feedback {
                prompt.push_str(&format!("\n- {}", entry));
            }
            prompt.push_str("\nGenerate an improved command addressing this feedback.");
        }

        if attempt > 0 {
            prompt.push_str(&format!("\n\nThis is retry #{}. Try a different approach.", attempt));
        }

        prompt
    }

    fn into_command(&self, reply: GenerationReply, attempt: u32) -> Result<GeneratedCommand, GenerationError> {
        let text = reply.command.trim().to_string();
        if text.is_empty() {
            return Err(GenerationError::Malformed("reply has an empty command".to_string()));
        }

        let shell = match reply.shell.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(name) => name.parse::<ShellKind>().map_err(GenerationError::Malformed)?,
            None => self.target_shell,
        };

        Ok(GeneratedCommand {
            text,
            shell,
            explanation: reply.explanation,
            safety_hint: SafetyHint::parse(reply.safety_level.as_deref()),
            attempt,
            warnings: reply.warnings,
            assumptions: reply.assumptions,
        })
    }
}

#[async_trait]
impl CommandGenerator for LlmGenerator {
    async fn generate(
        &self,
        request: &CommandRequest,
        feedback: &[String],
        attempt: u32,
    ) -> Result<GeneratedCommand, GenerationError> {
        info!("Generating command (attempt {}) for: {}", attempt, request.text());
        let prompt = self.build_prompt(request, feedback, attempt);
        let text = self.client.complete(&self.system_prompt(), &prompt).await?;
        let reply: GenerationReply = parse_json_reply(&text)?;
        let command = self.into_command(reply, attempt)?;
        info!("Generated command: {}", command.text);
        Ok(command)
    }
}

// =========================================================================
// Mock generator
// =========================================================================

/// Deterministic keyword-driven generator used in mock mode and tests.
pub struct MockGenerator {
    shell: ShellKind,
}

impl MockGenerator {
    pub fn new(shell: ShellKind) -> Self {
        Self { shell }
    }

    fn windows(&self) -> bool {
        matches!(self.shell, ShellKind::PowerShell | ShellKind::Cmd)
    }

    fn pick(&self, posix: &str, powershell: &str, cmd: &str) -> String {
        match self.shell {
            ShellKind::PowerShell => powershell.to_string(),
            ShellKind::Cmd => cmd.to_string(),
            ShellKind::Bash | ShellKind::Sh => posix.to_string(),
        }
    }

    pub fn mock_generate(&self, request_text: &str, feedback: &[String], attempt: u32) -> GeneratedCommand {
        let lower = request_text.to_lowercase();

        let (mut text, explanation, safety_hint) = if lower.contains("delete")
            && (lower.contains("everything") || lower.contains("recursive") || lower.contains("all"))
        {
            (
                self.pick(
                    "rm -rf ~/scratch",
                    "Remove-Item -Path $env:TEMP\\* -Recurse -Force",
                    "rd /s /q %TEMP%",
                ),
                "Recursively deletes the folder and everything in it without prompting".to_string(),
                SafetyHint::Dangerous,
            )
        } else if lower.contains("delete") || lower.contains("remove") {
            (
                self.pick("rm ./old.log", "Remove-Item .\\old.log", "del old.log"),
                "Deletes old.log from the current directory".to_string(),
                SafetyHint::Dangerous,
            )
        } else if lower.contains("notepad") {
            (
                self.pick("notepad", "Start-Process notepad.exe", "notepad"),
                "Launches the Notepad text editor".to_string(),
                SafetyHint::Safe,
            )
        } else if lower.contains("list") && (lower.contains("temp") || lower.contains("tmp")) {
            (
                self.pick("ls -la /tmp", "Get-ChildItem $env:TEMP", "dir %TEMP%"),
                "Lists the contents of the temporary directory".to_string(),
                SafetyHint::Safe,
            )
        } else if lower.contains("list") && lower.contains("file") {
            (
                self.pick("ls -la", "Get-ChildItem", "dir"),
                "Lists files in the current directory".to_string(),
                SafetyHint::Safe,
            )
        } else if lower.contains("read") || lower.contains("cat ") || lower.contains("show the contents") {
            let file = file_argument(request_text).unwrap_or("README.md");
            (
                self.pick(&format!("cat {file}"), &format!("Get-Content {file}"), &format!("type {file}")),
                format!("Prints the contents of {}", file),
                SafetyHint::Safe,
            )
        } else if lower.contains("process") {
            (
                self.pick("ps aux", "Get-Process", "tasklist"),
                "Lists running processes".to_string(),
                SafetyHint::Safe,
            )
        } else if lower.contains("date") || lower.contains("time") {
            (
                self.pick("date", "Get-Date", "echo %DATE% %TIME%"),
                "Shows the current date and time".to_string(),
                SafetyHint::Safe,
            )
        } else if lower.contains("fail") {
            (
                self.pick("exit 3", "exit 3", "exit /b 3"),
                "Exits with status 3".to_string(),
                SafetyHint::Safe,
            )
        } else {
            let words: String = request_text
                .chars()
                .filter(|c| c.is_alphanumeric() || c.is_whitespace())
                .collect();
            let words = words.split_whitespace().collect::<Vec<_>>().join(" ");
            (
                format!("echo {}", words),
                format!("Echoes the request: {}", words),
                SafetyHint::Safe,
            )
        };

        // "add <flag>" feedback is applied literally so retries are observable.
        for entry in feedback {
            if let Some(extra) = entry.trim().strip_prefix("add ") {
                text.push(' ');
                text.push_str(extra.trim());
            }
        }

        let mut assumptions = Vec::new();
        if self.windows() {
            assumptions.push("Running on Windows".to_string());
        }

        GeneratedCommand {
            text,
            shell: self.shell,
            explanation,
            safety_hint,
            attempt,
            warnings: Vec::new(),
            assumptions,
        }
    }
}

fn file_argument(text: &str) -> Option<&str> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| c == '"' || c == '\'' || c == ',' || c == '?'))
        .find(|w| w.contains('.') && !w.starts_with('.') && !w.ends_with('.') && w.chars().all(is_path_char))
}

fn is_path_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | '\\')
}

#[async_trait]
impl CommandGenerator for MockGenerator {
    async fn generate(
        &self,
        request: &CommandRequest,
        feedback: &[String],
        attempt: u32,
    ) -> Result<GeneratedCommand, GenerationError> {
        info!("Using mock generator (SHELLGATE_USE_MOCK=1)");
        if request.is_empty() {
            warn!("Mock generator received an empty request");
            return Err(GenerationError::Malformed("empty request".to_string()));
        }
        Ok(self.mock_generate(request.text(), feedback, attempt))
    }
}
