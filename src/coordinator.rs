//! Shell fallback over an ordered priority list.
//!
//! The coordinator walks the list with an explicit cursor, one launch at a
//! time. Only "not installed" moves the cursor forward; any other launch
//! failure ends the attempt sequence immediately.

use crate::error::{ExecutionFailure, LaunchError};
use crate::shell::{ExecutionLimits, ExecutionResult, ShellKind, ShellLauncher};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchOutcome {
    Launched,
    NotFound,
    Denied,
    Failed,
}

/// One entry in the fallback record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShellAttempt {
    pub shell: ShellKind,
    pub outcome: LaunchOutcome,
    /// Zero-based index into the priority list.
    pub position: usize,
}

/// Attempts made plus the final outcome.
#[derive(Debug, Clone)]
pub struct CoordinatedRun {
    pub attempts: Vec<ShellAttempt>,
    pub result: Result<ExecutionResult, ExecutionFailure>,
}

pub struct ExecutionCoordinator {
    launcher: Arc<dyn ShellLauncher>,
}

impl ExecutionCoordinator {
    pub fn new(launcher: Arc<dyn ShellLauncher>) -> Self {
        Self { launcher }
    }

    /// Runs `command` on the first shell in `shells` that can be launched.
    pub async fn execute(&self, command: &str, shells: &[ShellKind], limits: &ExecutionLimits) -> CoordinatedRun {
        let mut attempts = Vec::with_capacity(shells.len());
        let mut cursor = 0;

        while let Some(&shell) = shells.get(cursor) {
            let position = cursor;
            match self.launcher.launch(shell, command, limits).await {
                Ok(result) => {
                    info!("Command ran on {} (attempt {})", shell, position + 1);
                    attempts.push(ShellAttempt {
                        shell,
                        outcome: LaunchOutcome::Launched,
                        position,
                    });
                    return CoordinatedRun {
                        attempts,
                        result: Ok(result),
                    };
                }
                Err(LaunchError::NotFound { program, .. }) => {
                    warn!("{} not available ({}), trying next shell", shell, program.display());
                    attempts.push(ShellAttempt {
                        shell,
                        outcome: LaunchOutcome::NotFound,
                        position,
                    });
                    cursor += 1;
                }
                Err(LaunchError::PermissionDenied { .. }) => {
                    error!("Permission denied launching {}", shell);
                    attempts.push(ShellAttempt {
                        shell,
                        outcome: LaunchOutcome::Denied,
                        position,
                    });
                    return CoordinatedRun {
                        attempts,
                        result: Err(ExecutionFailure::LaunchDenied { shell }),
                    };
                }
                Err(err) => {
                    error!("Launching {} failed: {}", shell, err);
                    attempts.push(ShellAttempt {
                        shell,
                        outcome: LaunchOutcome::Failed,
                        position,
                    });
                    return CoordinatedRun {
                        attempts,
                        result: Err(ExecutionFailure::LaunchFailed {
                            shell,
                            reason: err.to_string(),
                        }),
                    };
                }
            }
        }

        error!("No shell could be launched from {:?}", shells);
        CoordinatedRun {
            attempts,
            result: Err(ExecutionFailure::ShellExhausted { tried: shells.to_vec() }),
        }
    }
}
