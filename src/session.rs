use crate::{
    analyzer::{LlmAnalyzer, OutputStatsAnalyzer},
    claude::ClaudeClient,
    command_filter::CommandFilter,
    confirmation_ui::{ConfirmationUI, PromptGate, read_line},
    config::Config,
    generator::{LlmGenerator, MockGenerator},
    http_client::{HttpClient, ReqwestHttpClient},
    memory::ConversationMemory,
    request::CommandRequest,
    shell::ProcessLauncher,
    validator::{HeuristicValidator, LlmValidator},
    workflow::{Collaborators, ConfirmationGate, EventSink, TurnReport, Workflow},
};
use anyhow::{Context, Result, anyhow, bail};
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const LLM_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// One user's session: the workflow plus conversation memory.
pub struct Session {
    workflow: Workflow,
    memory: ConversationMemory,
    context_turns: usize,
    verbose: bool,
}

impl Session {
    pub fn new(config: &Config, verbose: bool) -> Result<Self> {
        let collaborators = Self::collaborators(config)?;
        let memory = if config.enable_conversation_memory {
            ConversationMemory::open_default(config.max_conversations)
        } else {
            ConversationMemory::in_memory(0)
        };
        Self::with_parts(config, collaborators, memory, verbose)
    }

    /// Builds a session from explicit collaborators and memory.
    pub fn with_parts(
        config: &Config,
        collaborators: Collaborators,
        memory: ConversationMemory,
        verbose: bool,
    ) -> Result<Self> {
        config.validate()?;
        let filter = CommandFilter::standard(config.enable_dangerous_commands)
            .context("Failed to compile the safety rules")?;
        info!("Loaded {} safety rules", filter.rule_count());

        Ok(Self {
            workflow: Workflow::new(collaborators, Arc::new(filter), config.policy()),
            memory,
            context_turns: if config.enable_conversation_memory { config.context_conversations } else { 0 },
            verbose,
        })
    }

    fn collaborators(config: &Config) -> Result<Collaborators> {
        let target_shell = config
            .shells
            .first()
            .copied()
            .ok_or_else(|| anyhow!("No shells configured"))?;
        let launcher = Arc::new(ProcessLauncher::new().with_programs(&config.shell_paths));

        if config.is_mock_mode() {
            info!("Mock mode enabled, no API calls will be made");
            return Ok(Collaborators {
                generator: Arc::new(MockGenerator::new(target_shell)),
                validator: Arc::new(HeuristicValidator),
                analyzer: Arc::new(OutputStatsAnalyzer),
                launcher,
            });
        }

        if config.get_api_key().is_none() {
            bail!(
                "No Anthropic API key configured.\n\
                 Run `shellgate --set-api-key <key>`, export ANTHROPIC_API_KEY, \
                 or set SHELLGATE_USE_MOCK=1 to try it without one."
            );
        }

        let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::with_timeout(LLM_REQUEST_TIMEOUT)?);
        let client = || ClaudeClient::new(http.clone(), config.anthropic_api_key.clone(), config.model.clone());

        Ok(Collaborators {
            generator: Arc::new(LlmGenerator::new(client(), target_shell)),
            validator: Arc::new(LlmValidator::new(client())),
            analyzer: Arc::new(LlmAnalyzer::new(client())),
            launcher,
        })
    }

    pub async fn process_request(
        &mut self,
        text: &str,
        gate: &mut dyn ConfirmationGate,
        sink: &mut dyn EventSink,
    ) -> Result<TurnReport> {
        self.run(CommandRequest::new(text), gate, sink).await
    }

    /// Re-runs the most recent request with corrective feedback.
    ///
    /// Without explicit feedback the previous run's error output is used.
    pub async fn process_corrective_feedback(
        &mut self,
        feedback: Option<&str>,
        gate: &mut dyn ConfirmationGate,
        sink: &mut dyn EventSink,
    ) -> Result<TurnReport> {
        let last = self
            .memory
            .last()
            .ok_or_else(|| anyhow!("No previous request to correct. Run a request first."))?;

        let feedback = match feedback.map(str::trim).filter(|f| !f.is_empty()) {
            Some(feedback) => feedback.to_string(),
            None if !last.stderr_preview.is_empty() => {
                format!("The previous attempt failed with: {}", last.stderr_preview)
            }
            None => bail!("No feedback given and the last run produced no error output"),
        };

        info!("Re-running '{}' with feedback: {}", last.request, feedback);
        let request = CommandRequest::new(&last.request).with_prior_feedback(feedback);
        self.run(request, gate, sink).await
    }

    async fn run(
        &mut self,
        request: CommandRequest,
        gate: &mut dyn ConfirmationGate,
        sink: &mut dyn EventSink,
    ) -> Result<TurnReport> {
        if request.is_empty() {
            bail!("Empty request. Describe what you want to do.");
        }

        let request = match self.memory.context_for_prompt(self.context_turns) {
            Some(context) => request.with_context(context),
            None => request,
        };

        let report = self.workflow.run_turn(request, gate, sink).await?;
        self.memory.record(&report);
        Ok(report)
    }

    pub fn clear_history(&mut self) {
        self.memory.clear();
    }

    pub fn show_history_with_io<W: Write>(&self, output: &mut W) -> Result<()> {
        self.memory.render_history_with_io(output)
    }

    /// Reads requests line by line until `exit`, `quit`, `q` or end of input.
    ///
    /// Confirmation answers are read from the same `input`.
    pub async fn run_interactive_with_io<R: BufRead, W: Write>(
        &mut self,
        input: &mut R,
        output: &mut W,
        sink: &mut dyn EventSink,
    ) -> Result<()> {
        writeln!(output, "shellgate interactive mode")?;
        writeln!(output, "Describe a task, or use /history, /clear, exit.")?;

        loop {
            write!(output, "\nshellgate> ")?;
            output.flush()?;

            let Some(line) = read_line(input)? else {
                break;
            };

            match line.trim() {
                "" => continue,
                "exit" | "quit" | "q" => break,
                "/history" => self.show_history_with_io(output)?,
                "/clear" => {
                    self.clear_history();
                    writeln!(output, "History cleared.")?;
                }
                text => {
                    let outcome = {
                        let mut gate = PromptGate::new(ConfirmationUI::new(self.verbose), &mut *input, &mut *output);
                        self.process_request(text, &mut gate, sink).await
                    };
                    match outcome {
                        Ok(report) => ConfirmationUI::new(self.verbose).render_report_with_io(&report, output)?,
                        Err(e) => writeln!(output, "❌ {}", e)?,
                    }
                }
            }
        }

        writeln!(output, "Goodbye!")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LaunchError;
    use crate::shell::{ExecutionLimits, ExecutionResult, ShellKind, ShellLauncher};
    use crate::workflow::{ConfirmationDecision, ConfirmationRequest, NoopSink};
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::sync::Mutex;
    use std::time::Duration as StdDuration;

    /// Echoes the command text as stdout; `exit N` exits with N.
    struct EchoLauncher {
        launched: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ShellLauncher for EchoLauncher {
        async fn launch(
            &self,
            shell: ShellKind,
            command: &str,
            _limits: &ExecutionLimits,
        ) -> Result<ExecutionResult, LaunchError> {
            self.launched.lock().unwrap().push(command.to_string());
            let exit_code = command
                .strip_prefix("exit ")
                .and_then(|code| code.trim().parse().ok())
                .unwrap_or(0);
            Ok(ExecutionResult {
                exit_code,
                stdout: format!("{}\n", command).into_bytes(),
                stderr: if exit_code == 0 { Vec::new() } else { b"boom".to_vec() },
                elapsed: StdDuration::from_millis(5),
                timed_out: false,
                truncated: false,
                shell,
            })
        }
    }

    struct Always(ConfirmationDecision);

    impl ConfirmationGate for Always {
        fn decide(&mut self, _request: &ConfirmationRequest) -> ConfirmationDecision {
            self.0.clone()
        }
    }

    fn session(config: &Config) -> (Session, Arc<EchoLauncher>) {
        let launcher = Arc::new(EchoLauncher {
            launched: Mutex::new(Vec::new()),
        });
        let collaborators = Collaborators {
            generator: Arc::new(MockGenerator::new(ShellKind::Bash)),
            validator: Arc::new(HeuristicValidator),
            analyzer: Arc::new(OutputStatsAnalyzer),
            launcher: launcher.clone(),
        };
        let memory = ConversationMemory::in_memory(config.max_conversations);
        (Session::with_parts(config, collaborators, memory, false).unwrap(), launcher)
    }

    fn config() -> Config {
        Config {
            shells: vec![ShellKind::Bash],
            use_mock: true,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_process_request_records_memory() {
        let (mut session, launcher) = session(&config());

        let report = session
            .process_request("list files in temp", &mut Always(ConfirmationDecision::Approve), &mut NoopSink)
            .await
            .unwrap();

        assert!(report.succeeded());
        assert_eq!(launcher.launched.lock().unwrap().as_slice(), ["ls -la /tmp"]);
        let last = session.memory.last().unwrap();
        assert_eq!(last.request, "list files in temp");
        assert_eq!(last.command.as_deref(), Some("ls -la /tmp"));
        assert_eq!(last.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_empty_request_is_rejected_before_turn() {
        let (mut session, launcher) = session(&config());
        let err = session
            .process_request("   ", &mut Always(ConfirmationDecision::Approve), &mut NoopSink)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Empty request"));
        assert!(launcher.launched.lock().unwrap().is_empty());
        assert!(session.memory.is_empty());
    }

    #[tokio::test]
    async fn test_blocked_turn_is_remembered_but_not_run() {
        let (mut session, launcher) = session(&config());
        let report = session
            .process_request("delete everything in scratch", &mut Always(ConfirmationDecision::Approve), &mut NoopSink)
            .await
            .unwrap();

        assert!(report.is_aborted());
        assert!(launcher.launched.lock().unwrap().is_empty());
        assert!(session.memory.last().unwrap().aborted.is_some());
    }

    #[tokio::test]
    async fn test_corrective_feedback_reruns_last_request() {
        let (mut session, launcher) = session(&config());
        let mut gate = Always(ConfirmationDecision::Approve);

        session.process_request("list files", &mut gate, &mut NoopSink).await.unwrap();
        let report = session
            .process_corrective_feedback(Some("add -a"), &mut gate, &mut NoopSink)
            .await
            .unwrap();

        assert_eq!(report.request.text(), "list files");
        assert_eq!(report.feedback, vec!["add -a".to_string()]);
        let launched = launcher.launched.lock().unwrap().clone();
        assert_eq!(launched.len(), 2);
        assert!(launched[1].ends_with("-a"));
        assert_eq!(session.memory.len(), 2);
    }

    #[tokio::test]
    async fn test_corrective_feedback_defaults_to_stderr() {
        let (mut session, _) = session(&config());
        let mut gate = Always(ConfirmationDecision::Approve);

        session.process_request("make it fail", &mut gate, &mut NoopSink).await.unwrap();
        let report = session
            .process_corrective_feedback(None, &mut gate, &mut NoopSink)
            .await
            .unwrap();
        assert_eq!(report.feedback, vec!["The previous attempt failed with: boom".to_string()]);
    }

    #[tokio::test]
    async fn test_corrective_feedback_needs_history() {
        let (mut session, _) = session(&config());
        let err = session
            .process_corrective_feedback(Some("x"), &mut Always(ConfirmationDecision::Approve), &mut NoopSink)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No previous request"));
    }

    #[tokio::test]
    async fn test_context_is_passed_to_next_turn() {
        let (mut session, _) = session(&config());
        let mut gate = Always(ConfirmationDecision::Approve);

        session.process_request("list files", &mut gate, &mut NoopSink).await.unwrap();
        let report = session.process_request("what time is it", &mut gate, &mut NoopSink).await.unwrap();

        let context = report.request.context().unwrap();
        assert!(context.contains("1. User: list files"));
    }

    #[tokio::test]
    async fn test_interactive_loop_handles_commands_and_confirmation() {
        let (mut session, launcher) = session(&config());
        let mut input = Cursor::new(b"\n/history\nlist files in temp\n1\n/history\n/clear\n/history\nquit\n".to_vec());
        let mut output = Vec::new();

        session
            .run_interactive_with_io(&mut input, &mut output, &mut NoopSink)
            .await
            .unwrap();

        let output = String::from_utf8(output).unwrap();
        assert_eq!(launcher.launched.lock().unwrap().len(), 1);
        assert!(output.contains("CONFIRM COMMAND"));
        assert!(output.contains("Exit code 0 on bash"));
        assert!(output.contains("1. [exit 0] list files in temp"));
        assert!(output.contains("History cleared."));
        assert_eq!(output.matches("No conversation history.").count(), 2);
        assert!(output.ends_with("Goodbye!\n"));
    }

    #[tokio::test]
    async fn test_interactive_loop_ends_on_eof() {
        let (mut session, _) = session(&config());
        let mut input = Cursor::new(b"list files\n".to_vec());
        let mut output = Vec::new();

        session
            .run_interactive_with_io(&mut input, &mut output, &mut NoopSink)
            .await
            .unwrap();

        let output = String::from_utf8(output).unwrap();
        assert!(output.contains("Cancelled. Nothing was executed."));
    }

    #[test]
    fn test_llm_mode_requires_api_key() {
        let config = Config {
            use_mock: false,
            anthropic_api_key: None,
            ..Config::default()
        };
        let err = Session::new(&config, false).err().unwrap();
        assert!(err.to_string().contains("API key"));
    }
}
