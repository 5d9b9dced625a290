//! Agent run loop
//!
//! One runner drives one strategy over one session state chain. Cycles are
//! strictly sequential. Each cycle:
//!
//! 1. checks the kill switch (halt and abort the strategy if active)
//! 2. advances the cycle counter
//! 3. applies a queued parameter suggestion through the mutation sandbox
//! 4. takes the pre-snapshot
//! 5. runs the strategy
//! 6. routes any trades through the two-phase commit
//! 7. takes the post-snapshot and persists the session
//!
//! A failure in steps 3-7 puts the pre-snapshot state back. Kill-switch errors
//! halt at once; anything else counts towards the consecutive-failure
//! threshold, which resets after a clean cycle.
//!
//! A shutdown request is honoured between cycles only, so a cycle that has
//! started always finishes its external calls and bookkeeping.

use crate::audit::AuditLog;
use crate::config::AgentSettings;
use crate::drp::SnapshotStore;
use crate::kill_switch::KillSwitch;
use crate::mutation::{MutationOutcome, MutationProposal, MutationSandbox};
use crate::state::SessionState;
use crate::strategy::{Adapters, Strategy};
use crate::tx::TwoPhaseCommit;
use crate::{Error, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{error, info, info_span, warn, Instrument};

/// Why the run loop stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "halt", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HaltReason {
    HaltedByKillSwitch { reason: String },
    HaltedByFailureThreshold { failures: u32, last_error: String },
    MaxCycles,
    /// Operator asked for a stop (Ctrl-C)
    Shutdown,
}

impl HaltReason {
    fn abort_reason(&self) -> Option<String> {
        match self {
            HaltReason::HaltedByKillSwitch { reason } => Some(reason.clone()),
            HaltReason::HaltedByFailureThreshold {
                failures,
                last_error,
            } => Some(format!(
                "{} consecutive failures, last: {}",
                failures, last_error
            )),
            HaltReason::Shutdown => Some("shutdown requested".to_string()),
            HaltReason::MaxCycles => None,
        }
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub halt: HaltReason,
    /// Last committed state
    pub state: SessionState,
    /// Cycles started, including failed ones
    pub cycles: u64,
}

/// Drives a strategy through the cycle loop until a halt condition.
pub struct AgentRunner {
    settings: AgentSettings,
    strategy: Box<dyn Strategy>,
    strategy_config: Value,
    state: SessionState,
    adapters: Adapters,
    drp: Arc<SnapshotStore>,
    sandbox: MutationSandbox,
    audit: AuditLog,
    queued: Option<MutationProposal>,
    consecutive_failures: u32,
    last_suggestion: Option<Instant>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl AgentRunner {
    pub fn new(
        settings: AgentSettings,
        strategy: Box<dyn Strategy>,
        state: SessionState,
        adapters: Adapters,
        drp: Arc<SnapshotStore>,
        sandbox: MutationSandbox,
        audit: AuditLog,
    ) -> Self {
        Self {
            settings,
            strategy,
            strategy_config: Value::Null,
            state,
            adapters,
            drp,
            sandbox,
            audit,
            queued: None,
            consecutive_failures: 0,
            last_suggestion: None,
            shutdown: None,
        }
    }

    /// Per-cycle configuration handed to `Strategy::run`.
    pub fn with_strategy_config(mut self, config: Value) -> Self {
        self.strategy_config = config;
        self
    }

    /// Queue a proposal to apply at the start of the next cycle.
    pub fn with_proposal(mut self, proposal: MutationProposal) -> Self {
        self.queued = Some(proposal);
        self
    }

    /// Stop before the next cycle once `true` is sent.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    fn kill_switch(&self) -> &KillSwitch {
        &self.adapters.kill_switch
    }

    fn stop_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Sleep between cycles, cut short by a shutdown request.
    async fn pause(&mut self, duration: Duration) {
        let Some(rx) = self.shutdown.as_mut() else {
            sleep(duration).await;
            return;
        };
        let stopped = async {
            let closed = rx.wait_for(|stop| *stop).await.is_err();
            // A dropped sender can no longer ask for a stop.
            if closed {
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = sleep(duration) => {}
            _ = stopped => {}
        }
    }

    /// Run until the kill switch, the failure threshold, a shutdown request
    /// or `max_cycles`.
    pub async fn run(mut self) -> Result<RunOutcome> {
        info!(
            session_id = %self.state.session_id(),
            strategy = %self.strategy.name(),
            cycle = self.state.cycle_counter(),
            "Agent run loop starting"
        );
        let mut cycles = 0u64;

        let halt = loop {
            if let Err(e) = self.kill_switch().check().await {
                break HaltReason::HaltedByKillSwitch {
                    reason: self.kill_reason(&e).await,
                };
            }
            if self.stop_requested() {
                break HaltReason::Shutdown;
            }
            if self.settings.max_cycles.is_some_and(|max| cycles >= max) {
                break HaltReason::MaxCycles;
            }

            self.state = self.state.next_cycle();
            cycles += 1;
            let span = info_span!(
                "cycle",
                session_id = %self.state.session_id(),
                cycle = self.state.cycle_counter()
            );

            match self.cycle().instrument(span.clone()).await {
                Ok(()) => {
                    if self.consecutive_failures > 0 {
                        info!(parent: &span, recovered_after = self.consecutive_failures, "Cycle recovered");
                    }
                    self.consecutive_failures = 0;
                }
                Err(e) if e.is_kill_switch() => {
                    break HaltReason::HaltedByKillSwitch {
                        reason: self.kill_reason(&e).await,
                    };
                }
                Err(e) => {
                    self.consecutive_failures += 1;
                    error!(
                        parent: &span,
                        error = %e,
                        failures = self.consecutive_failures,
                        threshold = self.settings.max_consecutive_failures,
                        "Cycle failed, state rolled back"
                    );
                    if self.consecutive_failures >= self.settings.max_consecutive_failures {
                        break HaltReason::HaltedByFailureThreshold {
                            failures: self.consecutive_failures,
                            last_error: e.to_string(),
                        };
                    }
                    self.pause(self.settings.failure_backoff()).await;
                    continue;
                }
            }

            self.request_suggestion().instrument(span).await;
            self.pause(self.settings.cycle_interval()).await;
        };

        self.halt(halt, cycles).await
    }

    /// Steps 3-7. On error the state goes back to the last rollback point:
    /// the pre-cycle state, or the post-mutation state once a mutation has
    /// gone through, so history stays in step with the live parameters.
    async fn cycle(&mut self) -> Result<()> {
        let mut rollback = self.state.clone();
        match self.cycle_steps(&mut rollback).await {
            Ok(state) => {
                self.state = state;
                Ok(())
            }
            Err(e) => {
                self.state = rollback;
                if let Err(persist) = self.drp.persist_session(&self.state).await {
                    warn!(error = %persist, "Could not persist rolled-back state");
                }
                Err(e)
            }
        }
    }

    async fn cycle_steps(&mut self, rollback: &mut SessionState) -> Result<SessionState> {
        let mut state = self.state.clone();

        if let Some(proposal) = self.queued.take() {
            let report = self
                .sandbox
                .sandboxed_mutate(self.strategy.as_mut(), &state, &self.adapters, &proposal)
                .await?;
            match &report.outcome {
                MutationOutcome::Applied { changed } => {
                    info!(changed, diff = ?report.diff, "Mutation applied")
                }
                MutationOutcome::Reverted => warn!("Mutation reverted, approval not received"),
                MutationOutcome::Rejected { reason } => warn!(%reason, "Mutation dropped"),
            }
            state = report.state;
            *rollback = state.clone();
        }

        let pre_snapshot = self.drp.save_snapshot(&state).await?;
        info!(pre_snapshot = %pre_snapshot, "Pre-cycle snapshot");

        let (next, trades) = self
            .strategy
            .run(&state, &self.adapters, &self.strategy_config)
            .await?
            .into_parts();

        let next = if trades.is_empty() {
            next
        } else {
            info!(trades = trades.len(), "Committing trade batch");
            let committed = TwoPhaseCommit::new(self.adapters.tx.as_ref(), &self.drp)
                .with_audit(&self.audit)
                .execute(next, &trades)
                .await
                .map_err(|failure| failure.into_error())?;
            committed.state
        };

        let post_snapshot = self.drp.save_snapshot(&next).await?;
        self.drp.persist_session(&next).await?;
        info!(
            post_snapshot = %post_snapshot,
            history = next.history().len(),
            "Cycle complete"
        );
        Ok(next)
    }

    /// Ask the suggestion source for new parameters once per mutation
    /// interval. Failures are logged and never fail the cycle.
    async fn request_suggestion(&mut self) {
        let Some(source) = self.adapters.suggestions.clone() else {
            return;
        };
        let due = self
            .last_suggestion
            .map_or(true, |at| at.elapsed() >= self.settings.mutation_interval());
        if !due {
            return;
        }
        self.last_suggestion = Some(Instant::now());

        let params = self.strategy.params();
        let performance = self.strategy.performance_data(&self.state);
        match source
            .suggest(self.strategy.name(), &params, &performance)
            .await
        {
            Ok(Some(proposal)) => {
                info!(params = ?proposal.params, rationale = %proposal.rationale, "Mutation suggested");
                if self.queued.replace(proposal).is_some() {
                    warn!("Replaced an unapplied suggestion");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Suggestion request failed"),
        }
    }

    async fn kill_reason(&self, e: &Error) -> String {
        if let Error::KillSwitchActive { reason } = e {
            return reason.clone();
        }
        self.kill_switch()
            .status()
            .await
            .reason
            .unwrap_or_else(|| e.to_string())
    }

    async fn halt(mut self, halt: HaltReason, cycles: u64) -> Result<RunOutcome> {
        let session_id = self.state.session_id();
        match halt.abort_reason() {
            Some(reason) => {
                error!(%session_id, ?halt, "Agent halted");
                self.strategy.abort(&reason).await;
            }
            None => info!(%session_id, cycles, "Agent reached its cycle limit"),
        }
        self.audit
            .record_for(
                "agent_halted",
                session_id,
                self.state.cycle_counter(),
                json!({ "halt": &halt, "cycles": cycles }),
            )
            .await;
        if let Err(e) = self.drp.persist_session(&self.state).await {
            error!(%session_id, error = %e, "Final session persist failed");
        }
        Ok(RunOutcome {
            halt,
            state: self.state,
            cycles,
        })
    }
}
