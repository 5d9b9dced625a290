//! Sandboxed application of parameter mutations
//!
//! Every mutation is bracketed by DRP snapshots and a parameter dump before
//! and after, and the per-parameter diff is written to the log and the audit
//! trail. With manual approval on, the change stays provisional until an
//! operator approves it or the TTL expires, in which case parameters and
//! state are put back.

use super::approval::{ApprovalQueue, ApprovalRequest, ApprovalStatus};
use super::{param_diff, Guardrail, MutationProposal};
use crate::audit::AuditLog;
use crate::drp::SnapshotStore;
use crate::kill_switch::KillSwitch;
use crate::state::SessionState;
use crate::strategy::{Adapters, Strategy};
use crate::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::time::{sleep, Instant};

pub const EVENT_MUTATION_APPLIED: &str = "MUTATION_APPLIED";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationSettings {
    pub manual_approval: bool,
    pub approval_ttl_secs: u64,
    pub poll_interval_ms: u64,
    /// Patterns added to the built-in guardrail blocklist.
    pub blocklist: Vec<String>,
}

impl Default for MutationSettings {
    fn default() -> Self {
        Self {
            manual_approval: false,
            approval_ttl_secs: 3600,
            poll_interval_ms: 1000,
            blocklist: Vec::new(),
        }
    }
}

impl MutationSettings {
    pub fn approval_ttl(&self) -> Duration {
        Duration::from_secs(self.approval_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The hook ran and was accepted. `changed` is the hook's own report.
    Applied { changed: bool },
    /// Approval timed out; parameters and state were put back.
    Reverted,
    /// Dropped before application (guardrail or validation).
    Rejected { reason: String },
}

#[derive(Debug)]
pub struct MutationReport {
    pub outcome: MutationOutcome,
    /// State to continue with. Equal to the pre-mutation snapshot on revert.
    pub state: SessionState,
    pub diff: Vec<String>,
    pub pre_snapshot: Option<String>,
    pub post_snapshot: Option<String>,
}

pub struct MutationSandbox {
    drp: std::sync::Arc<SnapshotStore>,
    kill_switch: KillSwitch,
    approvals: ApprovalQueue,
    audit: AuditLog,
    guardrail: Guardrail,
    settings: MutationSettings,
}

impl MutationSandbox {
    pub fn new(
        drp: std::sync::Arc<SnapshotStore>,
        kill_switch: KillSwitch,
        approvals: ApprovalQueue,
        audit: AuditLog,
        settings: MutationSettings,
    ) -> Self {
        Self {
            guardrail: Guardrail::new(&settings.blocklist),
            drp,
            kill_switch,
            approvals,
            audit,
            settings,
        }
    }

    pub fn approvals(&self) -> &ApprovalQueue {
        &self.approvals
    }

    fn rejected(state: &SessionState, reason: String) -> MutationReport {
        MutationReport {
            outcome: MutationOutcome::Rejected { reason },
            state: state.clone(),
            diff: Vec::new(),
            pre_snapshot: None,
            post_snapshot: None,
        }
    }

    pub async fn sandboxed_mutate(
        &self,
        strategy: &mut dyn Strategy,
        state: &SessionState,
        adapters: &Adapters,
        proposal: &MutationProposal,
    ) -> Result<MutationReport> {
        self.kill_switch.check().await?;

        let screened = proposal
            .validate()
            .and_then(|_| self.guardrail.inspect_proposal(proposal))
            .and_then(|_| {
                if proposal.strategy == strategy.name() {
                    Ok(())
                } else {
                    Err(Error::Validation(format!(
                        "proposal targets {} but strategy is {}",
                        proposal.strategy,
                        strategy.name()
                    )))
                }
            });
        if let Err(e) = screened {
            tracing::warn!(strategy = %proposal.strategy, error = %e, "Mutation proposal dropped");
            self.audit
                .record_for(
                    "mutation_rejected",
                    state.session_id(),
                    state.cycle_counter(),
                    json!({"proposal": proposal, "reason": e.to_string()}),
                )
                .await;
            return Ok(Self::rejected(state, e.to_string()));
        }

        let pre = self.drp.save_snapshot(state).await?;
        let before = strategy.params();

        let changed = match strategy.mutate(proposal, adapters).await {
            Ok(changed) => changed,
            Err(e) => {
                strategy.restore_params(before.clone())?;
                if matches!(e, Error::Validation(_)) {
                    tracing::warn!(strategy = %proposal.strategy, error = %e, "Mutation rejected by strategy");
                    self.audit
                        .record_for(
                            "mutation_rejected",
                            state.session_id(),
                            state.cycle_counter(),
                            json!({"proposal": proposal, "reason": e.to_string(), "pre_snapshot": pre}),
                        )
                        .await;
                    let mut report = Self::rejected(state, e.to_string());
                    report.pre_snapshot = Some(pre);
                    return Ok(report);
                }
                return Err(e);
            }
        };

        let after = strategy.params();
        let post = self.drp.save_snapshot(state).await?;
        let diff = param_diff(&before, &after);

        tracing::warn!(
            session_id = %state.session_id(),
            cycle = state.cycle_counter(),
            strategy = %proposal.strategy,
            rationale = %proposal.rationale,
            diff = ?diff,
            pre_snapshot = %pre,
            post_snapshot = %post,
            "MUTATION"
        );
        self.audit
            .record_for(
                "mutation",
                state.session_id(),
                state.cycle_counter(),
                json!({
                    "strategy": proposal.strategy,
                    "rationale": proposal.rationale,
                    "diff": diff,
                    "pre_snapshot": pre,
                    "post_snapshot": post,
                }),
            )
            .await;

        let report = |outcome, state| MutationReport {
            outcome,
            state,
            diff: diff.clone(),
            pre_snapshot: Some(pre.clone()),
            post_snapshot: Some(post.clone()),
        };

        if self.settings.manual_approval && changed {
            let request = ApprovalRequest {
                proposal: proposal.clone(),
                diff: diff.clone(),
                pre_snapshot: pre.clone(),
                proposed_at: Utc::now(),
            };
            let approved = match self.await_approval(&request).await {
                Ok(approved) => approved,
                Err(e) => {
                    strategy.restore_params(before)?;
                    return Err(e);
                }
            };
            if !approved {
                strategy.restore_params(before)?;
                let restored = self.drp.load_snapshot(&pre).await?;
                tracing::warn!(
                    session_id = %restored.session_id(),
                    strategy = %proposal.strategy,
                    pre_snapshot = %pre,
                    "Mutation approval timed out, reverted"
                );
                self.audit
                    .record_for(
                        "mutation_reverted",
                        restored.session_id(),
                        restored.cycle_counter(),
                        json!({"strategy": proposal.strategy, "pre_snapshot": pre, "diff": diff}),
                    )
                    .await;
                return Ok(report(MutationOutcome::Reverted, restored));
            }
        }

        let applied = state.record_event(
            EVENT_MUTATION_APPLIED,
            json!({"strategy": proposal.strategy, "diff": diff, "rationale": proposal.rationale}),
        );
        self.audit
            .record_for(
                "mutation_applied",
                applied.session_id(),
                applied.cycle_counter(),
                json!({"strategy": proposal.strategy, "changed": changed}),
            )
            .await;
        Ok(report(MutationOutcome::Applied { changed }, applied))
    }

    /// Poll until approved (`true`) or the TTL runs out (`false`). The kill
    /// switch aborts the wait with an error after withdrawing the request.
    async fn await_approval(&self, request: &ApprovalRequest) -> Result<bool> {
        let strategy = request.proposal.strategy.as_str();
        self.approvals.propose(request).await?;
        let deadline = Instant::now() + self.settings.approval_ttl();

        loop {
            if self.approvals.status(strategy).await? == ApprovalStatus::Approved {
                self.approvals.consume(strategy).await?;
                return Ok(true);
            }
            if let Err(e) = self.kill_switch.check().await {
                self.approvals.withdraw(strategy).await?;
                return Err(e);
            }
            if Instant::now() >= deadline {
                break;
            }
            sleep(self.settings.poll_interval()).await;
        }

        if self.approvals.withdraw(strategy).await? {
            return Ok(false);
        }
        // The approval rename won the race with the withdrawal.
        self.approvals.consume(strategy).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drp::DEFAULT_PREFIX;
    use crate::mutation::QueuedSuggestions;
    use crate::storage::MemoryStore;
    use crate::strategy::IdleStrategy;
    use crate::tx::{Trade, Transaction, TxReceipt, TxSender};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use serde_json::Value;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct NoSender;

    #[async_trait]
    impl TxSender for NoSender {
        fn build_bundle(&self, _: &SessionState, _: &[Trade]) -> Result<Vec<Transaction>> {
            Ok(Vec::new())
        }
        async fn send(&self, _: &Transaction) -> Result<TxReceipt> {
            Err(Error::Broadcast("no sends in sandbox tests".into()))
        }
    }

    struct Fixture {
        _dir: TempDir,
        sandbox: MutationSandbox,
        adapters: Adapters,
        kill_switch: KillSwitch,
        audit_path: std::path::PathBuf,
    }

    fn fixture(settings: MutationSettings) -> Fixture {
        let dir = TempDir::new().unwrap();
        let drp = Arc::new(SnapshotStore::new(Arc::new(MemoryStore::new()), DEFAULT_PREFIX));
        let kill_switch = KillSwitch::with_default_key(Arc::new(MemoryStore::new()));
        let audit_path = dir.path().join("audit.jsonl");
        let sandbox = MutationSandbox::new(
            drp,
            kill_switch.clone(),
            ApprovalQueue::new(dir.path().join("approvals")),
            AuditLog::new(&audit_path),
            settings,
        );
        let adapters = Adapters {
            tx: Arc::new(NoSender),
            suggestions: Some(Arc::new(QueuedSuggestions::new())),
            kill_switch: kill_switch.clone(),
        };
        Fixture {
            _dir: dir,
            sandbox,
            adapters,
            kill_switch,
            audit_path,
        }
    }

    fn strategy() -> IdleStrategy {
        IdleStrategy::new(
            "arb",
            serde_json::from_value(json!({"min_profit_bps": 25, "max_slippage_bps": 50})).unwrap(),
        )
    }

    fn proposal(params: Value, rationale: &str) -> MutationProposal {
        MutationProposal {
            strategy: "arb".into(),
            params: serde_json::from_value(params).unwrap(),
            rationale: rationale.into(),
        }
    }

    fn state() -> SessionState {
        SessionState::new(BTreeMap::from([("WETH".to_string(), dec!(10))]))
    }

    #[tokio::test]
    async fn applies_and_audits_diff_without_manual_approval() {
        let f = fixture(MutationSettings::default());
        let mut s = strategy();
        let st = state();

        let report = f
            .sandbox
            .sandboxed_mutate(&mut s, &st, &f.adapters, &proposal(json!({"min_profit_bps": 40}), "wider spreads"))
            .await
            .unwrap();

        assert_eq!(report.outcome, MutationOutcome::Applied { changed: true });
        assert_eq!(report.diff, vec!["- min_profit_bps: 25", "+ min_profit_bps: 40"]);
        assert!(report.pre_snapshot.is_some() && report.post_snapshot.is_some());
        assert_eq!(s.params()["min_profit_bps"], 40);
        assert_eq!(
            report.state.history().last().unwrap().event_type,
            EVENT_MUTATION_APPLIED
        );

        let audit = std::fs::read_to_string(&f.audit_path).unwrap();
        assert!(audit.contains("\"mutation\""));
        assert!(audit.contains("+ min_profit_bps: 40"));
        assert!(audit.contains("mutation_applied"));
    }

    #[tokio::test]
    async fn guardrail_drops_unsafe_proposal_untouched() {
        let f = fixture(MutationSettings::default());
        let mut s = strategy();
        let st = state();

        let report = f
            .sandbox
            .sandboxed_mutate(
                &mut s,
                &st,
                &f.adapters,
                &proposal(json!({"min_profit_bps": 1}), "then exec(payload)"),
            )
            .await
            .unwrap();

        assert!(matches!(report.outcome, MutationOutcome::Rejected { .. }));
        assert_eq!(s.params()["min_profit_bps"], 25);
        assert_eq!(report.state, st);
        assert!(report.pre_snapshot.is_none());
    }

    #[tokio::test]
    async fn strategy_validation_failure_leaves_params_intact() {
        let f = fixture(MutationSettings::default());
        let mut s = strategy();

        let report = f
            .sandbox
            .sandboxed_mutate(
                &mut s,
                &state(),
                &f.adapters,
                &proposal(json!({"min_profit_bps": 30, "nope": 1}), "partial"),
            )
            .await
            .unwrap();

        assert!(matches!(report.outcome, MutationOutcome::Rejected { .. }));
        assert_eq!(s.params(), strategy().params());
    }

    #[tokio::test]
    async fn kill_switch_blocks_mutation() {
        let f = fixture(MutationSettings::default());
        f.kill_switch.activate("halt").await.unwrap();
        let mut s = strategy();

        let err = f
            .sandbox
            .sandboxed_mutate(&mut s, &state(), &f.adapters, &proposal(json!({"min_profit_bps": 30}), "r"))
            .await
            .unwrap_err();
        assert!(err.is_kill_switch());
        assert_eq!(s.params()["min_profit_bps"], 25);
    }

    #[tokio::test]
    async fn unapproved_mutation_reverts_after_ttl() {
        let f = fixture(MutationSettings {
            manual_approval: true,
            approval_ttl_secs: 1,
            poll_interval_ms: 50,
            blocklist: Vec::new(),
        });
        let mut s = strategy();
        let st = state();

        let report = f
            .sandbox
            .sandboxed_mutate(&mut s, &st, &f.adapters, &proposal(json!({"min_profit_bps": 99}), "aggressive"))
            .await
            .unwrap();

        assert_eq!(report.outcome, MutationOutcome::Reverted);
        assert_eq!(report.state, st);
        assert_eq!(s.params()["min_profit_bps"], 25);

        // A late approval finds nothing to promote.
        let approvals = f.sandbox.approvals();
        assert!(approvals.approve("arb").await.is_err());
        assert_eq!(approvals.status("arb").await.unwrap(), ApprovalStatus::None);
        assert!(std::fs::read_to_string(&f.audit_path)
            .unwrap()
            .contains("mutation_reverted"));
    }

    #[tokio::test]
    async fn operator_approval_within_ttl_applies() {
        let f = fixture(MutationSettings {
            manual_approval: true,
            approval_ttl_secs: 10,
            poll_interval_ms: 20,
            blocklist: Vec::new(),
        });
        let approvals = f.sandbox.approvals().clone();
        let approver = tokio::spawn(async move {
            for _ in 0..200 {
                if approvals.approve("arb").await.is_ok() {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            false
        });

        let mut s = strategy();
        let report = f
            .sandbox
            .sandboxed_mutate(&mut s, &state(), &f.adapters, &proposal(json!({"min_profit_bps": 35}), "ok"))
            .await
            .unwrap();

        assert!(approver.await.unwrap());
        assert_eq!(report.outcome, MutationOutcome::Applied { changed: true });
        assert_eq!(s.params()["min_profit_bps"], 35);
        // Consumed on application.
        assert_eq!(
            f.sandbox.approvals().status("arb").await.unwrap(),
            ApprovalStatus::None
        );
    }
}
