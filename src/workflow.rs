//! The per-turn state machine.
//!
//! A [`Workflow`] owns the long-lived pieces (collaborators, compiled filter,
//! shell coordinator, policy). Each user request runs as a [`Turn`], which
//! owns the only mutable [`WorkflowState`] and is discarded when the turn
//! finishes. `start_turn` borrows the workflow mutably, so at most one turn
//! can be in flight.
//!
//! Stages:
//!
//! ```text
//! GENERATING -> AWAITING_CONFIRMATION -> EXECUTING -> VALIDATING -> [ANALYZING] -> PRESENTING -> DONE
//!      |   \            |                    |
//!      |    ABORTED     +-> RETRY ------+    +-> PRESENTING (no shell could be launched)
//!      +-> RETRY -> GENERATING          |
//!                    RETRY -> ABORTED <-+ (limit reached)
//! ```
//!
//! The caller drives a turn with [`Turn::advance`]. When it returns
//! [`TurnStatus::AwaitingConfirmation`] the prompt has been handed out and
//! [`Turn::submit_confirmation`] or [`Turn::cancel`] decides what happens
//! next. Only a [`ScreenedCommand`] can reach the EXECUTING stage, and one
//! can only be built from a verdict that is not `Blocked`.

use crate::analyzer::{Analysis, AnalysisKind, ContentAnalyzer, analysis_kind, requires_analysis};
use crate::command_filter::{CommandFilter, FilterVerdict, RuleMatch};
use crate::coordinator::{ExecutionCoordinator, ShellAttempt};
use crate::error::{ExecutionFailure, WorkflowError};
use crate::generator::{CommandGenerator, GeneratedCommand};
use crate::request::CommandRequest;
use crate::retry::{FeedbackAccumulator, RetryCounter};
use crate::shell::{ExecutionLimits, ExecutionResult, ShellKind, ShellLauncher};
use crate::validator::{ResultValidator, ValidationResult};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

// =========================================================================
// Stages and events
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Generating,
    AwaitingConfirmation,
    Executing,
    Validating,
    Analyzing,
    Presenting,
    Retry,
    Aborted,
    Done,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Aborted | Stage::Done)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Generating => "GENERATING",
            Stage::AwaitingConfirmation => "AWAITING_CONFIRMATION",
            Stage::Executing => "EXECUTING",
            Stage::Validating => "VALIDATING",
            Stage::Analyzing => "ANALYZING",
            Stage::Presenting => "PRESENTING",
            Stage::Retry => "RETRY",
            Stage::Aborted => "ABORTED",
            Stage::Done => "DONE",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Copy of the interesting parts of the state at a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageSnapshot {
    pub retry_count: u32,
    pub command: Option<String>,
    pub verdict: Option<FilterVerdict>,
    pub shell: Option<ShellKind>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub truncated: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageEvent {
    pub stage: Stage,
    pub snapshot: StageSnapshot,
}

/// Receives stage transitions as they happen.
pub trait EventSink {
    fn emit(&mut self, event: StageEvent);
}

impl EventSink for Vec<StageEvent> {
    fn emit(&mut self, event: StageEvent) {
        self.push(event);
    }
}

impl EventSink for UnboundedSender<StageEvent> {
    fn emit(&mut self, event: StageEvent) {
        if self.send(event).is_err() {
            debug!("Stage event receiver dropped");
        }
    }
}

/// Discards events.
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&mut self, _event: StageEvent) {}
}

// =========================================================================
// Turn data
// =========================================================================

/// A generated command whose verdict is `Allowed` or `Warned`.
#[derive(Debug, Clone)]
pub struct ScreenedCommand {
    command: GeneratedCommand,
    verdict: FilterVerdict,
}

impl ScreenedCommand {
    /// Classifies `command`; a `Blocked` verdict hands the command back with
    /// the matched rule.
    pub fn screen(
        filter: &CommandFilter,
        command: GeneratedCommand,
    ) -> Result<Self, (GeneratedCommand, RuleMatch)> {
        match filter.classify(&command.text) {
            FilterVerdict::Blocked(rule) => Err((command, rule)),
            verdict => Ok(Self { command, verdict }),
        }
    }

    pub fn command(&self) -> &GeneratedCommand {
        &self.command
    }

    pub fn verdict(&self) -> &FilterVerdict {
        &self.verdict
    }
}

/// What the user is asked to approve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmationRequest {
    pub command: GeneratedCommand,
    pub verdict: FilterVerdict,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl ConfirmationRequest {
    /// The matched rule when the verdict is `Warned`.
    pub fn warning(&self) -> Option<&RuleMatch> {
        match &self.verdict {
            FilterVerdict::Warned(rule) => Some(rule),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    Blocked { command: String, rule: RuleMatch },
    RetriesExhausted { limit: u32, last_error: Option<String> },
    Cancelled,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Blocked { rule, .. } => {
                write!(f, "command blocked by safety rule '{}': {}", rule.rule_id, rule.description)
            }
            AbortReason::RetriesExhausted { limit, last_error } => {
                write!(f, "gave up after {} retries", limit)?;
                if let Some(err) = last_error {
                    write!(f, " (last error: {})", err)?;
                }
                Ok(())
            }
            AbortReason::Cancelled => f.write_str("cancelled by user"),
        }
    }
}

/// The aggregate record for one turn.
#[derive(Debug, Clone)]
pub struct WorkflowState {
    pub stage: Stage,
    pub request: CommandRequest,
    pub command: Option<GeneratedCommand>,
    pub verdict: Option<FilterVerdict>,
    pub attempts: Vec<ShellAttempt>,
    pub execution: Option<Result<ExecutionResult, ExecutionFailure>>,
    pub validation: Option<Result<ValidationResult, String>>,
    pub analysis: Option<Result<Analysis, String>>,
    pub retries: RetryCounter,
    pub feedback: FeedbackAccumulator,
    pub last_error: Option<String>,
    pub abort: Option<AbortReason>,
}

impl WorkflowState {
    fn new(request: CommandRequest, max_retries: u32) -> Self {
        let mut feedback = FeedbackAccumulator::new();
        if let Some(prior) = request.prior_feedback() {
            feedback.push(prior);
        }
        Self {
            stage: Stage::Generating,
            request,
            command: None,
            verdict: None,
            attempts: Vec::new(),
            execution: None,
            validation: None,
            analysis: None,
            retries: RetryCounter::new(max_retries),
            feedback,
            last_error: None,
            abort: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    fn snapshot(&self) -> StageSnapshot {
        let result = self.execution.as_ref().and_then(|e| e.as_ref().ok());
        let detail = match (&self.abort, &self.execution) {
            (Some(reason), _) => Some(reason.to_string()),
            (None, Some(Err(failure))) => Some(failure.to_string()),
            _ => self.last_error.clone(),
        };
        StageSnapshot {
            retry_count: self.retries.count(),
            command: self.command.as_ref().map(|c| c.text.clone()),
            verdict: self.verdict.clone(),
            shell: result.map(|r| r.shell),
            exit_code: result.map(|r| r.exit_code),
            timed_out: result.is_some_and(|r| r.timed_out),
            truncated: result.is_some_and(|r| r.truncated),
            detail,
        }
    }
}

/// Everything the presentation layer needs once a turn is over.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub stage: Stage,
    pub request: CommandRequest,
    pub command: Option<GeneratedCommand>,
    pub verdict: Option<FilterVerdict>,
    pub attempts: Vec<ShellAttempt>,
    /// `None` when nothing was executed.
    pub execution: Option<Result<ExecutionResult, ExecutionFailure>>,
    /// `Some(Err(_))` means validation was attempted but unavailable.
    pub validation: Option<Result<ValidationResult, String>>,
    pub analysis: Option<Result<Analysis, String>>,
    pub retry_count: u32,
    pub feedback: Vec<String>,
    pub abort: Option<AbortReason>,
    pub limits: ExecutionLimits,
}

impl TurnReport {
    pub fn is_aborted(&self) -> bool {
        self.stage == Stage::Aborted
    }

    pub fn result(&self) -> Option<&ExecutionResult> {
        self.execution.as_ref().and_then(|e| e.as_ref().ok())
    }

    pub fn execution_failure(&self) -> Option<&ExecutionFailure> {
        self.execution.as_ref().and_then(|e| e.as_ref().err())
    }

    /// True when a command ran, exited 0, and did not time out.
    pub fn succeeded(&self) -> bool {
        self.result().is_some_and(ExecutionResult::succeeded)
    }
}

#[derive(Debug)]
pub enum TurnStatus {
    AwaitingConfirmation(ConfirmationRequest),
    Finished(TurnReport),
}

// =========================================================================
// Workflow
// =========================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowPolicy {
    pub max_retries: u32,
    pub require_confirmation: bool,
    /// Fallback sequence, tried in order.
    pub shells: Vec<ShellKind>,
    pub limits: ExecutionLimits,
}

pub struct Collaborators {
    pub generator: Arc<dyn CommandGenerator>,
    pub validator: Arc<dyn ResultValidator>,
    pub analyzer: Arc<dyn ContentAnalyzer>,
    pub launcher: Arc<dyn ShellLauncher>,
}

pub struct Workflow {
    generator: Arc<dyn CommandGenerator>,
    validator: Arc<dyn ResultValidator>,
    analyzer: Arc<dyn ContentAnalyzer>,
    filter: Arc<CommandFilter>,
    coordinator: ExecutionCoordinator,
    policy: WorkflowPolicy,
}

impl Workflow {
    pub fn new(collaborators: Collaborators, filter: Arc<CommandFilter>, policy: WorkflowPolicy) -> Self {
        Self {
            generator: collaborators.generator,
            validator: collaborators.validator,
            analyzer: collaborators.analyzer,
            filter,
            coordinator: ExecutionCoordinator::new(collaborators.launcher),
            policy,
        }
    }

    pub fn policy(&self) -> &WorkflowPolicy {
        &self.policy
    }

    /// Begins a turn. Emits the initial GENERATING event to `sink`.
    pub fn start_turn<'a>(&'a mut self, request: CommandRequest, sink: &'a mut dyn EventSink) -> Turn<'a> {
        info!("Starting turn for request: {}", request.text());
        let state = WorkflowState::new(request, self.policy.max_retries);
        let mut turn = Turn {
            workflow: self,
            sink,
            state,
            step: Step::Generate,
            finished: false,
        };
        turn.emit();
        turn
    }

    /// Runs a whole turn, asking `gate` whenever confirmation is needed.
    pub async fn run_turn(
        &mut self,
        request: CommandRequest,
        gate: &mut dyn ConfirmationGate,
        sink: &mut dyn EventSink,
    ) -> Result<TurnReport, WorkflowError> {
        let mut turn = self.start_turn(request, sink);
        loop {
            match turn.advance().await? {
                TurnStatus::AwaitingConfirmation(prompt) => match gate.decide(&prompt) {
                    ConfirmationDecision::Approve => turn.submit_confirmation(true, None)?,
                    ConfirmationDecision::Reject(feedback) => turn.submit_confirmation(false, feedback.as_deref())?,
                    ConfirmationDecision::Cancel => turn.cancel()?,
                },
                TurnStatus::Finished(report) => return Ok(report),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationDecision {
    Approve,
    /// Reject and regenerate, optionally with feedback for the generator.
    Reject(Option<String>),
    /// End the turn without executing anything.
    Cancel,
}

/// Source of confirmation decisions, usually a terminal prompt.
pub trait ConfirmationGate {
    fn decide(&mut self, request: &ConfirmationRequest) -> ConfirmationDecision;
}

// =========================================================================
// Turn
// =========================================================================

enum Step {
    Generate,
    Confirm(ScreenedCommand),
    Execute(ScreenedCommand),
    Validate,
    Analyze(AnalysisKind),
    Present,
    Retry,
    Aborted,
    Done,
}

impl Step {
    fn stage(&self) -> Stage {
        match self {
            Step::Generate => Stage::Generating,
            Step::Confirm(_) => Stage::AwaitingConfirmation,
            Step::Execute(_) => Stage::Executing,
            Step::Validate => Stage::Validating,
            Step::Analyze(_) => Stage::Analyzing,
            Step::Present => Stage::Presenting,
            Step::Retry => Stage::Retry,
            Step::Aborted => Stage::Aborted,
            Step::Done => Stage::Done,
        }
    }
}

pub struct Turn<'a> {
    workflow: &'a Workflow,
    sink: &'a mut dyn EventSink,
    state: WorkflowState,
    step: Step,
    finished: bool,
}

impl Turn<'_> {
    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn stage(&self) -> Stage {
        self.step.stage()
    }

    /// Runs stages until the turn needs a confirmation decision or ends.
    ///
    /// Calling it again while a confirmation is pending hands out the same
    /// prompt. Calling it after the report was returned is an error.
    pub async fn advance(&mut self) -> Result<TurnStatus, WorkflowError> {
        if self.finished {
            return Err(WorkflowError::TurnFinished);
        }

        loop {
            let next = match std::mem::replace(&mut self.step, Step::Done) {
                Step::Generate => self.generate().await,
                Step::Execute(screened) => self.execute(screened).await,
                Step::Validate => self.validate().await,
                Step::Analyze(kind) => self.analyze(kind).await,
                Step::Retry => self.retry(),
                Step::Confirm(screened) => {
                    let prompt = ConfirmationRequest {
                        command: screened.command.clone(),
                        verdict: screened.verdict.clone(),
                        retry_count: self.state.retries.count(),
                        max_retries: self.state.retries.limit(),
                    };
                    self.step = Step::Confirm(screened);
                    return Ok(TurnStatus::AwaitingConfirmation(prompt));
                }
                Step::Present => {
                    self.enter(Step::Done);
                    return Ok(TurnStatus::Finished(self.finish()));
                }
                Step::Aborted => {
                    self.step = Step::Aborted;
                    return Ok(TurnStatus::Finished(self.finish()));
                }
                Step::Done => return Err(WorkflowError::TurnFinished),
            };
            self.enter(next);
        }
    }

    /// Answers the pending confirmation. Rejection always leads to RETRY;
    /// non-blank `feedback` is passed to the next generation call.
    pub fn submit_confirmation(&mut self, approved: bool, feedback: Option<&str>) -> Result<(), WorkflowError> {
        let screened = self.take_pending()?;
        if approved {
            info!("User approved command: {}", screened.command.text);
            self.enter(Step::Execute(screened));
        } else {
            info!("User rejected command: {}", screened.command.text);
            if let Some(feedback) = feedback {
                self.state.feedback.push(feedback);
            }
            self.enter(Step::Retry);
        }
        Ok(())
    }

    /// Ends the turn at the confirmation gate. Nothing is executed.
    pub fn cancel(&mut self) -> Result<(), WorkflowError> {
        let screened = self.take_pending()?;
        info!("User cancelled command: {}", screened.command.text);
        self.abort(AbortReason::Cancelled);
        Ok(())
    }

    fn take_pending(&mut self) -> Result<ScreenedCommand, WorkflowError> {
        if self.finished {
            return Err(WorkflowError::TurnFinished);
        }
        match std::mem::replace(&mut self.step, Step::Done) {
            Step::Confirm(screened) => Ok(screened),
            other => {
                let stage = other.stage();
                self.step = other;
                Err(WorkflowError::NotAwaitingConfirmation(stage.to_string()))
            }
        }
    }

    fn enter(&mut self, step: Step) {
        let stage = step.stage();
        debug!("{} -> {}", self.state.stage, stage);
        self.step = step;
        self.state.stage = stage;
        self.emit();
    }

    fn emit(&mut self) {
        let event = StageEvent {
            stage: self.state.stage,
            snapshot: self.state.snapshot(),
        };
        self.sink.emit(event);
    }

    fn abort(&mut self, reason: AbortReason) {
        warn!("Turn aborted: {}", reason);
        self.state.abort = Some(reason);
        self.enter(Step::Aborted);
    }

    fn abort_step(&mut self, reason: AbortReason) -> Step {
        warn!("Turn aborted: {}", reason);
        self.state.abort = Some(reason);
        Step::Aborted
    }

    async fn generate(&mut self) -> Step {
        let attempt = self.state.retries.count();
        let outcome = self
            .workflow
            .generator
            .generate(&self.state.request, self.state.feedback.entries(), attempt)
            .await;

        let command = match outcome {
            Ok(command) => command,
            Err(err) => {
                error!("Command generation failed: {}", err);
                self.state.last_error = Some(err.to_string());
                if self.state.retries.can_retry() {
                    return Step::Retry;
                }
                let reason = AbortReason::RetriesExhausted {
                    limit: self.state.retries.limit(),
                    last_error: self.state.last_error.clone(),
                };
                return self.abort_step(reason);
            }
        };

        self.state.last_error = None;
        self.state.command = Some(command.clone());

        match ScreenedCommand::screen(&self.workflow.filter, command) {
            Err((command, rule)) => {
                self.state.verdict = Some(FilterVerdict::Blocked(rule.clone()));
                self.abort_step(AbortReason::Blocked {
                    command: command.text,
                    rule,
                })
            }
            Ok(screened) => {
                self.state.verdict = Some(screened.verdict.clone());
                if screened.verdict.is_warned() || self.workflow.policy.require_confirmation {
                    Step::Confirm(screened)
                } else {
                    Step::Execute(screened)
                }
            }
        }
    }

    async fn execute(&mut self, screened: ScreenedCommand) -> Step {
        let policy = &self.workflow.policy;
        let run = self
            .workflow
            .coordinator
            .execute(&screened.command.text, &policy.shells, &policy.limits)
            .await;

        self.state.attempts = run.attempts;
        match run.result {
            Ok(result) => {
                if result.timed_out {
                    warn!("Command timed out after {:?}", policy.limits.timeout);
                }
                self.state.execution = Some(Ok(result));
                Step::Validate
            }
            Err(failure) => {
                error!("Execution unavailable: {}", failure);
                self.state.execution = Some(Err(failure));
                Step::Present
            }
        }
    }

    async fn validate(&mut self) -> Step {
        let validation = match (&self.state.command, &self.state.execution) {
            (Some(command), Some(Ok(result))) => {
                self.workflow
                    .validator
                    .validate(&self.state.request, command, result)
                    .await
            }
            _ => return Step::Present,
        };

        if let Err(err) = &validation {
            warn!("Validation unavailable: {}", err);
        }
        self.state.validation = Some(validation.map_err(|e| e.to_string()));

        let text = self.state.request.text();
        if requires_analysis(text) {
            Step::Analyze(analysis_kind(text))
        } else {
            Step::Present
        }
    }

    async fn analyze(&mut self, kind: AnalysisKind) -> Step {
        if let (Some(command), Some(Ok(result))) = (&self.state.command, &self.state.execution) {
            let analysis = self
                .workflow
                .analyzer
                .analyze(&self.state.request, command, result, kind)
                .await;
            if let Err(err) = &analysis {
                warn!("Content analysis failed: {}", err);
            }
            self.state.analysis = Some(analysis.map_err(|e| e.to_string()));
        }
        Step::Present
    }

    fn retry(&mut self) -> Step {
        match self.state.retries.try_increment() {
            Ok(count) => {
                info!("Retrying generation ({}/{})", count, self.state.retries.limit());
                Step::Generate
            }
            Err(exhausted) => self.abort_step(AbortReason::RetriesExhausted {
                limit: exhausted.limit,
                last_error: self.state.last_error.clone(),
            }),
        }
    }

    fn finish(&mut self) -> TurnReport {
        self.finished = true;
        let state = &mut self.state;
        TurnReport {
            stage: state.stage,
            request: state.request.clone(),
            command: state.command.take(),
            verdict: state.verdict.take(),
            attempts: std::mem::take(&mut state.attempts),
            execution: state.execution.take(),
            validation: state.validation.take(),
            analysis: state.analysis.take(),
            retry_count: state.retries.count(),
            feedback: state.feedback.entries().to_vec(),
            abort: state.abort.take(),
            limits: self.workflow.policy.limits,
        }
    }
}
