// src/swarm.rs - Two-phase multi-agent swarm delegation

use crate::core::agent::{AgentExecutor, ExecutionOutcome, ExecutionPolicy, ExecutionResult, TIMEOUT_MARKER};
use crate::core::decision::Action;
use crate::io::process::ProcessSpec;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// `<swarm> init --topology <t> --maxAgents <n>`
pub fn init_spec(executor: &AgentExecutor) -> ProcessSpec {
    let config = executor.config();
    ProcessSpec::new(&config.swarm_binary, executor.workspace())
        .arg("init")
        .arg("--topology")
        .arg(&config.swarm_topology)
        .arg("--maxAgents")
        .arg(config.swarm_max_agents.to_string())
}

/// `<swarm> orchestrate <instruction>`
pub fn orchestrate_spec(executor: &AgentExecutor, instruction: &str) -> ProcessSpec {
    ProcessSpec::new(&executor.config().swarm_binary, executor.workspace())
        .arg("orchestrate")
        .arg(instruction)
}

/// Initializes the swarm, then hands it the task.
///
/// Both phases share one deadline so the whole delegation stays inside
/// `policy.timeout`. If initialization fails the task is never sent and the
/// init result is what gets reported.
pub async fn run_swarm(
    executor: &AgentExecutor,
    action: &Action,
    policy: &ExecutionPolicy,
    abort: &CancellationToken,
) -> ExecutionResult {
    let started = Instant::now();

    let init = executor
        .invoke(&init_spec(executor), policy, policy.timeout, abort)
        .await;
    if !init.success {
        warn!(outcome = %init.outcome, "swarm init failed; skipping orchestration");
        // Timeout and abort markers are reported bare.
        if init.outcome != ExecutionOutcome::Completed {
            return init;
        }
        return ExecutionResult {
            error: Some(format!(
                "swarm init failed: {}",
                init.error.as_deref().unwrap_or("unknown error")
            )),
            ..init
        };
    }
    info!(duration_ms = init.duration.as_millis() as u64, "swarm initialized");

    let remaining = policy.timeout.saturating_sub(started.elapsed());
    if remaining.is_zero() {
        return ExecutionResult::timed_out(
            TIMEOUT_MARKER,
            init.output,
            init.output_truncated,
            started.elapsed(),
        );
    }

    let task = executor
        .invoke(&orchestrate_spec(executor, &action.prompt), policy, remaining, abort)
        .await;

    ExecutionResult {
        duration: started.elapsed().max(Duration::from_nanos(1)),
        ..task
    }
}
