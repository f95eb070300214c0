//! The OIDA loop: Observe, Infer, Decide, Act, Record.
//!
//! Cycles run strictly one after another. The change observer keeps
//! collecting in the background while a cycle is in flight; everything it
//! flushed by the next tick is merged into that tick's observation.

use crate::core::agent::Delegate;
use crate::core::context::ReasoningContext;
use crate::core::cortex::Reasoner;
use crate::core::decision::{Decision, Disposition};
use crate::core::evaluator::evaluate;
use crate::core::state::{LoopState, OidaConfig};
use crate::io::events::Observation;
use crate::io::ignore::IgnoreSet;
use crate::io::watcher::{self, ChangeObserver};
use crate::memory::{CycleRecord, StateStore};
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub const REASONER_DOWN_REASONING: &str = "reasoning endpoint unavailable; skipped";
pub const INTERRUPTED_REASONING: &str = "interrupted by shutdown before a decision was reached";

pub struct Orchestrator {
    config: OidaConfig,
    reasoner: Arc<dyn Reasoner>,
    delegate: Arc<dyn Delegate>,
    store: Arc<dyn StateStore>,
    state: Arc<watch::Sender<LoopState>>,
}

impl Orchestrator {
    pub fn new(
        config: OidaConfig,
        reasoner: Arc<dyn Reasoner>,
        delegate: Arc<dyn Delegate>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let (state, _) = watch::channel(LoopState::Starting);
        Self {
            config,
            reasoner,
            delegate,
            store,
            state: Arc::new(state),
        }
    }

    /// Follows `starting -> cycling -> stopping -> stopped`.
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    pub fn config(&self) -> &OidaConfig {
        &self.config
    }

    fn set_state(&self, next: LoopState) {
        self.state.send_replace(next);
        debug!(state = %next, "loop state");
    }

    /// Validates config, starts watching the workspace, and cycles until
    /// `shutdown` fires. Config errors are fatal here and nowhere else.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.set_state(LoopState::Starting);
        self.config.validate().context("Invalid configuration")?;

        let ignore = IgnoreSet::new(&self.config.ignore_patterns)?;
        let observer = watcher::watch(&self.config.workspace_root, ignore, self.config.debounce())?;
        self.run_with(observer, shutdown).await
    }

    /// Cycles over an already running observer.
    pub async fn run_with(&self, mut observer: ChangeObserver, shutdown: CancellationToken) -> Result<()> {
        self.set_state(LoopState::Starting);

        let mut seq = match self.store.last_cycle().await {
            Ok(last) => last.map_or(1, |c| c + 1),
            Err(e) => {
                observer.stop().await;
                self.set_state(LoopState::Stopped);
                return Err(e.context("Failed to read the cycle log"));
            }
        };

        // Reachability only gates the infer step; it never blocks startup.
        if !self.reasoner.probe().await {
            warn!("reasoning endpoint unreachable at startup; cycles will wait until it recovers");
        }
        let monitor_cancel = CancellationToken::new();
        let monitor = {
            let reasoner = self.reasoner.clone();
            let cancel = monitor_cancel.clone();
            tokio::spawn(async move { reasoner.monitor(cancel).await })
        };

        // Once shutdown fires, in-flight work gets the grace period before
        // its children are killed.
        let abort = CancellationToken::new();
        let done = CancellationToken::new();
        let grace_timer = {
            let shutdown = shutdown.clone();
            let abort = abort.clone();
            let done = done.clone();
            let state = self.state.clone();
            let grace = self.config.shutdown_grace();
            tokio::spawn(async move {
                tokio::select! {
                    _ = done.cancelled() => return,
                    _ = shutdown.cancelled() => {}
                }
                state.send_replace(LoopState::Stopping);
                info!(grace_secs = grace.as_secs(), "stop requested; draining in-flight work");
                tokio::select! {
                    _ = done.cancelled() => {}
                    _ = tokio::time::sleep(grace) => {
                        warn!("shutdown grace elapsed; aborting in-flight execution");
                        abort.cancel();
                    }
                }
            })
        };

        self.set_state(LoopState::Cycling);
        info!(
            first_cycle = seq,
            interval_secs = self.config.cycle_interval_secs,
            "OIDA loop cycling"
        );

        let interval = self.config.cycle_interval();
        while !shutdown.is_cancelled() {
            let started = Instant::now();

            if let Some(record) = self.cycle(&mut observer, seq, &shutdown, &abort).await {
                // A lost record is logged, never fatal. Its number is reused
                // so the log stays gapless.
                match self.store.append(&record).await {
                    Ok(()) => {
                        debug!(cycle = seq, "cycle recorded");
                        seq += 1;
                    }
                    Err(e) => error!(cycle = seq, error = %e, "failed to record cycle"),
                }
            }

            let pause = interval.saturating_sub(started.elapsed());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        self.set_state(LoopState::Stopping);
        done.cancel();
        monitor_cancel.cancel();
        let _ = grace_timer.await;
        let _ = monitor.await;

        observer.stop().await;
        if let Err(e) = self.store.flush().await {
            warn!(error = %e, "state store flush failed");
        }
        self.set_state(LoopState::Stopped);
        info!(last_cycle = seq - 1, "OIDA loop stopped");
        Ok(())
    }

    /// One pass through observe, infer, decide and act. Returns the record
    /// to append, or `None` for an idle tick that was skipped.
    #[instrument(skip_all, fields(cycle = seq))]
    pub async fn cycle(
        &self,
        observer: &mut ChangeObserver,
        seq: u64,
        shutdown: &CancellationToken,
        abort: &CancellationToken,
    ) -> Option<CycleRecord> {
        let observation = Observation::merge(observer.drain());
        if observation.is_empty() && !self.config.think_when_idle {
            return None;
        }
        let summary = observation.summary();
        debug!(events = observation.events().len(), "observed");

        let decision = self.decide(&summary, shutdown).await;
        match decision.disposition {
            Disposition::Act => info!(
                confidence = decision.confidence,
                reasoning = %decision.reasoning,
                "act"
            ),
            Disposition::Investigate => info!(
                confidence = decision.confidence,
                reasoning = %decision.reasoning,
                "investigate: promising but not yet actionable"
            ),
            Disposition::Wait => debug!(
                confidence = decision.confidence,
                reasoning = %decision.reasoning,
                "wait"
            ),
        }

        let execution = match &decision.action {
            Some(action) => {
                info!(kind = %action.kind, priority = %action.priority, description = %action.description, "delegating");
                let result = self.delegate.execute(action, abort).await;
                if result.success {
                    info!(duration_ms = result.duration.as_millis() as u64, "delegation succeeded");
                } else {
                    warn!(
                        outcome = %result.outcome,
                        error = result.error.as_deref().unwrap_or(""),
                        "delegation failed"
                    );
                }
                Some(result)
            }
            None => None,
        };

        Some(CycleRecord {
            cycle: seq,
            at: Utc::now(),
            observation_summary: summary,
            decision,
            execution,
        })
    }

    async fn decide(&self, summary: &str, shutdown: &CancellationToken) -> Decision {
        if !self.reasoner.is_available() {
            return Decision::wait(REASONER_DOWN_REASONING);
        }

        let context = match ReasoningContext::load(self.store.as_ref(), self.config.reasoning.history_window).await {
            Ok(context) => context,
            Err(e) => {
                warn!(error = %e, "could not load reasoning context; continuing without it");
                ReasoningContext::default()
            }
        };

        tokio::select! {
            raw = self.reasoner.think(summary, &context) => {
                evaluate(raw, self.config.decision.action_threshold)
            }
            _ = shutdown.cancelled() => Decision::wait(INTERRUPTED_REASONING),
        }
    }
}
