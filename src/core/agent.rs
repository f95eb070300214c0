//! Delegated Executor
//!
//! Hands an [`Action`] to an external coding agent as a child process and
//! reports what happened. Every invocation runs under an [`ExecutionPolicy`]
//! chosen per action kind; this is the only place that decides timeouts,
//! kill grace, output bounds and launch retries.

use crate::core::decision::{Action, ActionKind};
use crate::core::state::ExecutionConfig;
use crate::io::process::{run_bounded, ProcessExit, ProcessLimits, ProcessSpec};
use crate::swarm;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

pub const TIMEOUT_MARKER: &str = "[timeout]";
pub const ABORT_MARKER: &str = "[aborted: shutdown grace elapsed]";

/// Exactly one of these holds for every [`ExecutionResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed,
    TimedOut,
    LaunchFailed,
}

impl ExecutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionOutcome::Completed => "completed",
            ExecutionOutcome::TimedOut => "timed_out",
            ExecutionOutcome::LaunchFailed => "launch_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(ExecutionOutcome::Completed),
            "timed_out" => Some(ExecutionOutcome::TimedOut),
            "launch_failed" => Some(ExecutionOutcome::LaunchFailed),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub outcome: ExecutionOutcome,
    pub success: bool,
    /// Captured stdout, bounded; carries a truncation marker when cut.
    pub output: String,
    pub output_truncated: bool,
    pub error: Option<String>,
    pub duration: Duration,
    pub exit_code: Option<i32>,
}

impl ExecutionResult {
    pub fn launch_failed(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            outcome: ExecutionOutcome::LaunchFailed,
            success: false,
            output: String::new(),
            output_truncated: false,
            error: Some(error.into()),
            duration,
            exit_code: None,
        }
    }

    pub fn timed_out(marker: &str, output: String, output_truncated: bool, duration: Duration) -> Self {
        Self {
            outcome: ExecutionOutcome::TimedOut,
            success: false,
            output,
            output_truncated,
            error: Some(marker.to_string()),
            duration,
            exit_code: None,
        }
    }
}

/// Per-kind execution limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionPolicy {
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub output_limit_bytes: usize,
    /// Extra spawn attempts for transient launch errors. A missing
    /// executable is never retried.
    pub launch_retries: u32,
}

impl ExecutionPolicy {
    pub fn limits(&self, timeout: Duration) -> ProcessLimits {
        ProcessLimits {
            timeout,
            kill_grace: self.kill_grace,
            output_limit_bytes: self.output_limit_bytes,
        }
    }
}

/// The seam the orchestrator executes through.
#[async_trait]
pub trait Delegate: Send + Sync {
    /// Runs `action` to completion, timeout or abort. Never panics and never
    /// returns an error: every failure is an unsuccessful result.
    async fn execute(&self, action: &Action, abort: &CancellationToken) -> ExecutionResult;
}

pub struct AgentExecutor {
    workspace: PathBuf,
    config: ExecutionConfig,
}

impl AgentExecutor {
    pub fn new(workspace: impl Into<PathBuf>, config: ExecutionConfig) -> Self {
        Self {
            workspace: workspace.into(),
            config,
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn workspace(&self) -> &PathBuf {
        &self.workspace
    }

    pub fn policy_for(&self, kind: ActionKind) -> ExecutionPolicy {
        let base = ExecutionPolicy {
            timeout: Duration::from_secs(self.config.timeout_secs),
            kill_grace: Duration::from_millis(self.config.kill_grace_ms),
            output_limit_bytes: self.config.output_limit_bytes,
            launch_retries: self.config.launch_retries,
        };
        match kind {
            ActionKind::SingleAgent | ActionKind::MultiAgentSwarm => base,
            ActionKind::Internal => ExecutionPolicy {
                launch_retries: 0,
                ..base
            },
        }
    }

    /// Single-agent invocation: `<agent> <print-flag> <instruction>`.
    pub fn agent_spec(&self, instruction: &str) -> ProcessSpec {
        let mut spec = ProcessSpec::new(&self.config.agent_binary, &self.workspace);
        if !self.config.agent_print_flag.is_empty() {
            spec = spec.arg(&self.config.agent_print_flag);
        }
        spec.arg(instruction)
    }

    /// Runs one invocation under `policy`, limited to `timeout`.
    pub async fn invoke(
        &self,
        spec: &ProcessSpec,
        policy: &ExecutionPolicy,
        timeout: Duration,
        abort: &CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();
        let limits = policy.limits(timeout);
        let mut attempt = 0;

        loop {
            match run_bounded(spec, &limits, abort).await {
                Ok(out) => {
                    let output = out.stdout_text();
                    let output_truncated = out.truncated();
                    return match out.exit {
                        ProcessExit::Exited { code, success } => {
                            let stderr = out.stderr_text();
                            let error = if success {
                                None
                            } else if stderr.trim().is_empty() {
                                Some(format!("exited with status {}", describe_code(code)))
                            } else {
                                Some(stderr)
                            };
                            ExecutionResult {
                                outcome: ExecutionOutcome::Completed,
                                success,
                                output,
                                output_truncated,
                                error,
                                duration: out.duration,
                                exit_code: code,
                            }
                        }
                        ProcessExit::TimedOut => ExecutionResult::timed_out(
                            TIMEOUT_MARKER,
                            output,
                            output_truncated,
                            out.duration,
                        ),
                        ProcessExit::Aborted => ExecutionResult::timed_out(
                            ABORT_MARKER,
                            output,
                            output_truncated,
                            out.duration,
                        ),
                    };
                }
                Err(e) if is_transient_spawn_error(&e) && attempt < policy.launch_retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "transient launch failure, retrying");
                    tokio::select! {
                        _ = abort.cancelled() => {
                            return ExecutionResult::launch_failed(
                                format!("launch of `{}` aborted: {}", spec.display(), e),
                                started.elapsed(),
                            );
                        }
                        _ = tokio::time::sleep(Duration::from_millis(200 * attempt as u64)) => {}
                    }
                }
                Err(e) => {
                    let reason = if e.kind() == io::ErrorKind::NotFound {
                        format!("executable not found: {}", spec.program.to_string_lossy())
                    } else {
                        format!("failed to launch `{}`: {}", spec.display(), e)
                    };
                    warn!(%reason, "launch failed");
                    return ExecutionResult::launch_failed(reason, started.elapsed());
                }
            }
        }
    }

    async fn execute_internal(&self, action: &Action) -> ExecutionResult {
        let started = Instant::now();
        info!(description = %action.description, "internal action recorded, not delegated");
        ExecutionResult {
            outcome: ExecutionOutcome::Completed,
            success: true,
            output: "internal action: recorded without delegation".to_string(),
            output_truncated: false,
            error: None,
            duration: started.elapsed(),
            exit_code: None,
        }
    }
}

#[async_trait]
impl Delegate for AgentExecutor {
    #[instrument(skip_all, fields(kind = %action.kind, priority = %action.priority))]
    async fn execute(&self, action: &Action, abort: &CancellationToken) -> ExecutionResult {
        let policy = self.policy_for(action.kind);
        let result = match action.kind {
            ActionKind::SingleAgent => {
                let spec = self.agent_spec(&action.prompt);
                self.invoke(&spec, &policy, policy.timeout, abort).await
            }
            ActionKind::MultiAgentSwarm => swarm::run_swarm(self, action, &policy, abort).await,
            ActionKind::Internal => self.execute_internal(action).await,
        };
        info!(
            outcome = %result.outcome,
            success = result.success,
            duration_ms = result.duration.as_millis() as u64,
            "delegation finished"
        );
        result
    }
}

fn describe_code(code: Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

fn is_transient_spawn_error(e: &io::Error) -> bool {
    if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) {
        return true;
    }
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        if let Some(code) = e.raw_os_error() {
            return code == Errno::ETXTBSY as i32 || code == Errno::EAGAIN as i32;
        }
    }
    false
}
