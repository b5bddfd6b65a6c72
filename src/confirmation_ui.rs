//! Terminal presentation: the confirmation prompt, progress lines and the
//! final turn report.
//!
//! Every method has a `_with_io` form taking injected reader/writer streams
//! so the dialogs can be tested with in-memory buffers.

use crate::coordinator::LaunchOutcome;
use crate::workflow::{
    AbortReason, ConfirmationDecision, ConfirmationGate, ConfirmationRequest, EventSink, Stage, StageEvent,
    TurnReport,
};
use anyhow::Result;
use std::io::{self, BufRead, Stdin, Stdout, Write};
use tracing::{info, warn};

/// Word that must be typed in full to approve a warned command.
pub const WARNED_CONFIRMATION_WORD: &str = "yes";

pub struct ConfirmationUI {
    verbose: bool,
}

impl ConfirmationUI {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    // =========================================================================
    // Core methods with I/O injection (testable)
    // =========================================================================

    /// Shows the command and asks what to do with it.
    ///
    /// End of input is treated as a cancel.
    pub fn prompt_with_io<R: BufRead, W: Write>(
        &self,
        request: &ConfirmationRequest,
        input: &mut R,
        output: &mut W,
    ) -> Result<ConfirmationDecision> {
        self.display_request_with_io(request, output)?;

        loop {
            write!(output, "\nChoose an option (1/2/3): ")?;
            output.flush()?;

            let Some(line) = read_line(input)? else {
                info!("Input closed at confirmation prompt, cancelling");
                return Ok(ConfirmationDecision::Cancel);
            };

            match line.trim() {
                "1" => {
                    if let Some(rule) = request.warning() {
                        writeln!(output, "⚠️  This command matched: {}", rule.description)?;
                        write!(output, "Type '{}' to run it anyway: ", WARNED_CONFIRMATION_WORD)?;
                        output.flush()?;
                        let confirmed = read_line(input)?
                            .is_some_and(|answer| answer.trim().eq_ignore_ascii_case(WARNED_CONFIRMATION_WORD));
                        if !confirmed {
                            writeln!(output, "Not confirmed.")?;
                            continue;
                        }
                    }
                    info!("User approved '{}'", request.command.text);
                    return Ok(ConfirmationDecision::Approve);
                }
                "2" => {
                    write!(output, "What should change? (optional, press Enter to skip): ")?;
                    output.flush()?;
                    let feedback = read_line(input)?
                        .map(|f| f.trim().to_string())
                        .filter(|f| !f.is_empty());
                    info!("User rejected '{}'", request.command.text);
                    return Ok(ConfirmationDecision::Reject(feedback));
                }
                "3" => {
                    info!("User cancelled '{}'", request.command.text);
                    return Ok(ConfirmationDecision::Cancel);
                }
                _ => {
                    writeln!(output, "Invalid choice. Please enter 1, 2, or 3.")?;
                }
            }
        }
    }

    fn display_request_with_io<W: Write>(&self, request: &ConfirmationRequest, output: &mut W) -> Result<()> {
        let command = &request.command;
        writeln!(output, "\n{}", "=".repeat(60))?;
        writeln!(output, "🔐 CONFIRM COMMAND")?;
        writeln!(output, "{}", "=".repeat(60))?;
        writeln!(output)?;
        writeln!(output, "📋 Command: {}", command.text)?;
        writeln!(output, "🐚 Shell: {}", command.shell)?;
        if !command.explanation.is_empty() {
            writeln!(output, "📝 Explanation: {}", command.explanation)?;
        }
        writeln!(output, "🛡️  Generator safety hint: {}", command.safety_hint)?;
        for warning in &command.warnings {
            writeln!(output, "   • {}", warning)?;
        }
        if request.retry_count > 0 {
            writeln!(output, "🔁 Retry {}/{}", request.retry_count, request.max_retries)?;
        }

        if let Some(rule) = request.warning() {
            writeln!(output)?;
            writeln!(output, "⚠️  WARNING: {} [{}]", rule.description, rule.rule_id)?;
        }

        writeln!(output, "{}", "-".repeat(60))?;
        writeln!(output, "What would you like to do?")?;
        writeln!(output)?;
        writeln!(output, "  1️⃣  Run        - Execute this command")?;
        writeln!(output, "  2️⃣  Regenerate - Reject it and generate another one")?;
        writeln!(output, "  3️⃣  Cancel     - Don't run anything")?;
        writeln!(output)?;
        writeln!(output, "{}", "=".repeat(60))?;

        Ok(())
    }

    /// Progress line for a stage transition. Quiet stages print nothing.
    pub fn render_event_with_io<W: Write>(&self, event: &StageEvent, output: &mut W) -> Result<()> {
        let snapshot = &event.snapshot;
        match event.stage {
            Stage::Generating if snapshot.retry_count == 0 => writeln!(output, "💭 Generating command...")?,
            Stage::Generating => writeln!(output, "💭 Regenerating command (retry {})...", snapshot.retry_count)?,
            Stage::Executing => {
                if let Some(command) = &snapshot.command {
                    writeln!(output, "▶️  Running: {}", command)?;
                }
            }
            Stage::Retry => {
                if let Some(detail) = &snapshot.detail {
                    writeln!(output, "🔁 {}", detail)?;
                }
            }
            Stage::Validating if self.verbose => writeln!(output, "🔎 Validating result...")?,
            Stage::Analyzing => writeln!(output, "🔍 Analyzing output...")?,
            _ => {}
        }
        Ok(())
    }

    pub fn render_report_with_io<W: Write>(&self, report: &TurnReport, output: &mut W) -> Result<()> {
        writeln!(output)?;

        if let Some(reason) = &report.abort {
            match reason {
                AbortReason::Blocked { command, rule } => {
                    writeln!(output, "🚫 Blocked: {}", command)?;
                    writeln!(output, "   Safety rule '{}': {}", rule.rule_id, rule.description)?;
                    writeln!(output, "   The command was not executed.")?;
                }
                AbortReason::RetriesExhausted { limit, last_error } => {
                    writeln!(output, "❌ Gave up after {} retries.", limit)?;
                    if let Some(err) = last_error {
                        writeln!(output, "   Last error: {}", err)?;
                    }
                }
                AbortReason::Cancelled => {
                    writeln!(output, "🛑 Cancelled. Nothing was executed.")?;
                }
            }
            return Ok(());
        }

        if self.verbose || report.attempts.len() > 1 {
            for attempt in &report.attempts {
                let outcome = match attempt.outcome {
                    LaunchOutcome::Launched => "launched",
                    LaunchOutcome::NotFound => "not installed",
                    LaunchOutcome::Denied => "permission denied",
                    LaunchOutcome::Failed => "failed to start",
                };
                writeln!(output, "   {}. {} - {}", attempt.position + 1, attempt.shell, outcome)?;
            }
        }

        if let Some(failure) = report.execution_failure() {
            writeln!(output, "❌ Could not run the command: {}", failure)?;
            return Ok(());
        }

        if let Some(result) = report.result() {
            let status = if result.succeeded() { "✅" } else { "❌" };
            writeln!(
                output,
                "{} Exit code {} on {} in {:.2}s",
                status,
                result.exit_code,
                result.shell,
                result.elapsed.as_secs_f64()
            )?;
            if result.timed_out {
                writeln!(
                    output,
                    "⏱️  Timed out after {}s; the process was terminated.",
                    report.limits.timeout.as_secs()
                )?;
            }
            if result.truncated {
                writeln!(output, "✂️  Output truncated at {} bytes per stream.", report.limits.output_cap)?;
            }

            let stdout = result.stdout_text();
            if !stdout.trim().is_empty() {
                writeln!(output, "\n{}", stdout.trim_end())?;
            }
            let stderr = result.stderr_text();
            if !stderr.trim().is_empty() {
                writeln!(output, "\nstderr:\n{}", stderr.trim_end())?;
            }
        }

        match &report.validation {
            Some(Ok(validation)) => {
                let verdict = if validation.success { "passed" } else { "did not pass" };
                writeln!(output, "\n🧪 Validation {} ({:?} confidence)", verdict, validation.confidence)?;
                if !validation.rationale.is_empty() {
                    writeln!(output, "   {}", validation.rationale)?;
                }
                for suggestion in &validation.suggestions {
                    writeln!(output, "   💡 {}", suggestion)?;
                }
            }
            Some(Err(err)) => writeln!(output, "\n⚠️  Validation unavailable: {}", err)?,
            None => {}
        }

        match &report.analysis {
            Some(Ok(analysis)) => writeln!(output, "\n🔍 Analysis ({}):\n{}", analysis.kind, analysis.summary)?,
            Some(Err(err)) => writeln!(output, "\n⚠️  Analysis unavailable: {}", err)?,
            None => {}
        }

        Ok(())
    }

    // =========================================================================
    // Convenience methods using standard I/O
    // =========================================================================

    pub fn render_report(&self, report: &TurnReport) {
        let mut output = io::stdout();
        if let Err(e) = self.render_report_with_io(report, &mut output) {
            warn!("Failed to print report: {}", e);
        }
    }
}

pub(crate) fn read_line<R: BufRead>(input: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

/// Confirmation gate over a pair of streams.
pub struct PromptGate<R, W> {
    ui: ConfirmationUI,
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> PromptGate<R, W> {
    pub fn new(ui: ConfirmationUI, input: R, output: W) -> Self {
        Self { ui, input, output }
    }
}

impl PromptGate<io::StdinLock<'static>, Stdout> {
    pub fn stdio(verbose: bool) -> Self {
        let stdin: Stdin = io::stdin();
        Self::new(ConfirmationUI::new(verbose), stdin.lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> ConfirmationGate for PromptGate<R, W> {
    fn decide(&mut self, request: &ConfirmationRequest) -> ConfirmationDecision {
        match self.ui.prompt_with_io(request, &mut self.input, &mut self.output) {
            Ok(decision) => decision,
            Err(e) => {
                warn!("Confirmation prompt failed, cancelling: {}", e);
                ConfirmationDecision::Cancel
            }
        }
    }
}

/// Prints progress lines as stage events arrive.
pub struct ProgressPrinter<W> {
    ui: ConfirmationUI,
    output: W,
}

impl<W: Write> ProgressPrinter<W> {
    pub fn new(ui: ConfirmationUI, output: W) -> Self {
        Self { ui, output }
    }
}

impl<W: Write> EventSink for ProgressPrinter<W> {
    fn emit(&mut self, event: StageEvent) {
        if let Err(e) = self.ui.render_event_with_io(&event, &mut self.output) {
            warn!("Failed to print progress: {}", e);
        }
    }
}
