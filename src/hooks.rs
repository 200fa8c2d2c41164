//! Hook commands executed inside service containers.
//!
//! Each command line is split with shell-word rules (quotes respected, no
//! expansion, pipes or redirection) and run as a one-shot exec. Commands of
//! one phase run strictly in order and the phase stops at the first failure.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::runtime::{ContainerRuntime, RuntimeError};

/// When a hook phase runs relative to the test command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    PreRun,
    PostRun,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPhase::PreRun => write!(f, "pre-run"),
            HookPhase::PostRun => write!(f, "post-run"),
        }
    }
}

/// Why a single hook command failed.
#[derive(Debug, thiserror::Error)]
pub enum HookFailure {
    #[error("cannot parse command line: {0}")]
    Tokenize(#[from] shell_words::ParseError),

    #[error("empty command")]
    EmptyCommand,

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("exited with code {code}: {output}")]
    NonZeroExit { code: i64, output: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// A failed hook, with enough context to report it.
#[derive(Debug, thiserror::Error)]
#[error("[{service}] {phase} hook `{command}` failed: {source}")]
pub struct HookError {
    pub service: String,
    pub phase: HookPhase,
    pub command: String,
    #[source]
    pub source: HookFailure,
}

/// Runs hook commands inside one service's container.
pub struct HookRunner {
    runtime: Arc<dyn ContainerRuntime>,
    service: String,
    timeout: Option<Duration>,
}

impl HookRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, service: &str, timeout: Option<Duration>) -> Self {
        Self {
            runtime,
            service: service.to_string(),
            timeout,
        }
    }

    /// Runs every command of a phase in order, stopping at the first failure.
    pub async fn run_phase(
        &self,
        container_id: &str,
        phase: HookPhase,
        commands: &[String],
    ) -> Result<(), HookError> {
        for command in commands {
            info!("[{}] {} hook: {}", self.service, phase, command);
            self.run(container_id, command)
                .await
                .map_err(|source| HookError {
                    service: self.service.clone(),
                    phase,
                    command: command.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Runs a single command line inside the container.
    pub async fn run(&self, container_id: &str, command: &str) -> Result<(), HookFailure> {
        let argv = shell_words::split(command)?;
        if argv.is_empty() {
            return Err(HookFailure::EmptyCommand);
        }

        let exec = self.runtime.exec(container_id, &argv);
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, exec)
                .await
                .map_err(|_| HookFailure::Timeout(limit))??,
            None => exec.await?,
        };

        if !output.output.is_empty() {
            debug!("[{}] {}", self.service, output.output.trim_end());
        }

        if output.success() {
            Ok(())
        } else {
            Err(HookFailure::NonZeroExit {
                code: output.exit_code,
                output: output.output,
            })
        }
    }
}
