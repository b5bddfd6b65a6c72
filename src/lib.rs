//! Shellgate - natural-language requests to shell commands, behind a safety gate.
//!
//! A request such as "list files in temp" goes through a fixed pipeline:
//!
//! - **Generation** of a candidate command by a language model (or a
//!   deterministic mock)
//! - **Filtering** against static safety rules: blocked commands never run,
//!   warned commands always need explicit confirmation
//! - **Confirmation** by the user, who can approve, reject with feedback
//!   (which regenerates), or cancel
//! - **Execution** through an ordered list of shells with fallback, under a
//!   wall-clock timeout and an output cap
//! - **Validation** and optional **analysis** of the result
//!
//! # Architecture
//!
//! - [`config`] - Configuration file, environment overrides, validation
//! - [`error`] - Error types per component boundary
//! - [`filter_rules`] / [`command_filter`] - Safety rules and classification
//! - [`request`] - The sanitized user request
//! - [`claude`] / [`http_client`] - Anthropic Messages API access
//! - [`generator`] / [`validator`] / [`analyzer`] - Model-backed collaborators and their mocks
//! - [`shell`] - Launching one shell process with limits
//! - [`coordinator`] - Shell fallback
//! - [`retry`] - Retry counter and feedback accumulation
//! - [`workflow`] - The per-turn state machine
//! - [`memory`] - Conversation memory across turns
//! - [`confirmation_ui`] - Terminal prompt and report rendering
//! - [`session`] - Wires everything together for the CLI
//!
//! # Example
//!
//! ```ignore
//! use shellgate::config::Config;
//! use shellgate::confirmation_ui::{ConfirmationUI, PromptGate, ProgressPrinter};
//! use shellgate::session::Session;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let mut session = Session::new(&config, false)?;
//!
//!     let mut gate = PromptGate::stdio(false);
//!     let mut progress = ProgressPrinter::new(ConfirmationUI::new(false), std::io::stdout());
//!     let report = session.process_request("list files in temp", &mut gate, &mut progress).await?;
//!     ConfirmationUI::new(false).render_report(&report);
//!
//!     // Not what you wanted? Re-run with feedback.
//!     session.process_corrective_feedback(Some("include hidden files"), &mut gate, &mut progress).await?;
//!     Ok(())
//! }
//! ```

pub mod analyzer;
pub mod claude;
pub mod command_filter;
pub mod config;
pub mod confirmation_ui;
pub mod coordinator;
pub mod error;
pub mod filter_rules;
pub mod generator;
pub mod http_client;
pub mod memory;
pub mod request;
pub mod retry;
pub mod session;
pub mod shell;
pub mod validator;
pub mod workflow;
