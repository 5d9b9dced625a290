//! Two-phase commit around a batch of trades
//!
//! ```text
//! NONE --mark_pending + snapshot--> PENDING --all sent--> COMMITTED
//!                                      \----any send fails--> ROLLED_BACK
//! ```
//!
//! Intent is made durable (a DRP snapshot showing the ids as pending) before
//! anything is submitted. On failure the pending ids are cleared and the
//! error is returned, but transactions that already reached the network stay
//! there: the guarantee is at-most-once per transaction, not all-or-nothing
//! per batch. No compensating transactions are attempted; the ids that went
//! out are reported in [`BatchFailure::broadcast`] for operators.

use super::{Trade, TxReceipt, TxSender};
use crate::audit::AuditLog;
use crate::drp::SnapshotStore;
use crate::state::SessionState;
use crate::Error;
use serde::Serialize;
use serde_json::json;

pub const EVENT_TX_BROADCAST: &str = "TX_BROADCAST";
pub const EVENT_COMMIT_ROLLED_BACK: &str = "COMMIT_ROLLED_BACK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitPhase {
    None,
    Pending,
    Committed,
    RolledBack,
}

#[derive(Debug)]
pub struct BatchCommitted {
    pub state: SessionState,
    pub receipts: Vec<TxReceipt>,
    /// Location of the snapshot that recorded the batch as in flight.
    pub pending_snapshot: String,
}

#[derive(Debug)]
pub struct BatchFailure {
    /// `None` if the batch never left the building stage, `RolledBack` once
    /// anything was marked pending.
    pub phase: CommitPhase,
    /// State with every id of the batch cleared from the pending set.
    pub state: SessionState,
    pub broadcast: Vec<TxReceipt>,
    pub error: Error,
}

impl BatchFailure {
    pub fn into_error(self) -> Error {
        match self.phase {
            CommitPhase::RolledBack => Error::CommitRolledBack {
                broadcast: self.broadcast.into_iter().map(|r| r.tx_id).collect(),
                source: Box::new(self.error),
            },
            _ => self.error,
        }
    }
}

pub struct TwoPhaseCommit<'a> {
    sender: &'a dyn TxSender,
    drp: &'a SnapshotStore,
    audit: Option<&'a AuditLog>,
}

impl<'a> TwoPhaseCommit<'a> {
    pub fn new(sender: &'a dyn TxSender, drp: &'a SnapshotStore) -> Self {
        Self {
            sender,
            drp,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: &'a AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub async fn execute(
        &self,
        state: SessionState,
        trades: &[Trade],
    ) -> std::result::Result<BatchCommitted, BatchFailure> {
        let not_started = |state: SessionState, error: Error| BatchFailure {
            phase: CommitPhase::None,
            state,
            broadcast: Vec::new(),
            error,
        };

        let txs = match self.sender.build_bundle(&state, trades) {
            Ok(txs) => txs,
            Err(e) => return Err(not_started(state, e)),
        };
        let ids: Vec<String> = txs.iter().map(|t| t.id.clone()).collect();

        let pending = state.mark_pending(ids.iter().cloned());
        // Without a durable intent record nothing may be sent.
        let pending_snapshot = match self.drp.save_snapshot(&pending).await {
            Ok(path) => path,
            Err(e) => return Err(not_started(state, e)),
        };
        tracing::info!(
            session_id = %pending.session_id(),
            cycle = pending.cycle_counter(),
            tx_ids = ?ids,
            snapshot = %pending_snapshot,
            phase = "PENDING",
            "Batch marked pending"
        );

        let mut receipts = Vec::with_capacity(txs.len());
        for tx in &txs {
            match self.sender.send(tx).await {
                Ok(receipt) => receipts.push(receipt),
                Err(error) => {
                    let rolled_back = pending
                        .clear_pending(ids.iter())
                        .record_event(
                            EVENT_COMMIT_ROLLED_BACK,
                            json!({
                                "failed_tx": tx.id,
                                "error": error.to_string(),
                                "broadcast": receipts,
                                "batch": ids,
                            }),
                        );
                    tracing::error!(
                        session_id = %rolled_back.session_id(),
                        cycle = rolled_back.cycle_counter(),
                        failed_tx = %tx.id,
                        broadcast = receipts.len(),
                        error = %error,
                        phase = "ROLLED_BACK",
                        "Batch rolled back; broadcast transactions are not reversed"
                    );
                    if let Some(audit) = self.audit {
                        audit
                            .record_for(
                                "commit_rolled_back",
                                rolled_back.session_id(),
                                rolled_back.cycle_counter(),
                                json!({
                                    "failed_tx": tx.id,
                                    "error": error.to_string(),
                                    "broadcast": receipts,
                                    "pending_snapshot": pending_snapshot,
                                }),
                            )
                            .await;
                    }
                    return Err(BatchFailure {
                        phase: CommitPhase::RolledBack,
                        state: rolled_back,
                        broadcast: receipts,
                        error,
                    });
                }
            }
        }

        let committed = receipts
            .iter()
            .fold(pending.clear_pending(ids.iter()), |s, r| {
                s.record_event(EVENT_TX_BROADCAST, json!(r))
            });
        tracing::info!(
            session_id = %committed.session_id(),
            cycle = committed.cycle_counter(),
            count = receipts.len(),
            phase = "COMMITTED",
            "Batch committed"
        );
        Ok(BatchCommitted {
            state: committed,
            receipts,
            pending_snapshot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drp::DEFAULT_PREFIX;
    use crate::storage::MemoryStore;
    use crate::tx::tests::trade;
    use crate::tx::{transaction_id, Transaction};
    use crate::wallet::PreparedTransaction;
    use crate::Result;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    /// Fails the send at `fail_at` (0-based), succeeds otherwise.
    struct ScriptedSender {
        fail_at: Option<usize>,
        sent: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl TxSender for ScriptedSender {
        fn build_bundle(&self, state: &SessionState, trades: &[Trade]) -> Result<Vec<Transaction>> {
            trades
                .iter()
                .enumerate()
                .map(|(i, t)| {
                    let request = PreparedTransaction {
                        to: t.to,
                        data: t.data.clone(),
                        value: t.value,
                        gas_limit: None,
                        chain_id: 1,
                    };
                    Ok(Transaction {
                        id: transaction_id(state, i, &request)?,
                        venue: t.venue.clone(),
                        request,
                    })
                })
                .collect()
        }

        async fn send(&self, tx: &Transaction) -> Result<TxReceipt> {
            let mut sent = self.sent.lock().unwrap();
            if self.fail_at == Some(sent.len()) {
                return Err(Error::Broadcast("execution reverted".into()));
            }
            sent.push(tx.id.clone());
            Ok(TxReceipt {
                tx_id: tx.id.clone(),
                tx_hash: format!("0xhash{}", sent.len()),
                nonce: sent.len() as u64 - 1,
            })
        }
    }

    fn setup(fail_at: Option<usize>) -> (ScriptedSender, SnapshotStore, SessionState) {
        let sender = ScriptedSender {
            fail_at,
            sent: StdMutex::new(Vec::new()),
        };
        let drp = SnapshotStore::new(Arc::new(MemoryStore::new()), DEFAULT_PREFIX);
        let state = SessionState::new(BTreeMap::from([("WETH".to_string(), dec!(10))]));
        (sender, drp, state)
    }

    #[tokio::test]
    async fn full_success_commits_and_clears_pending() {
        let (sender, drp, state) = setup(None);
        let trades = [trade("a", 1), trade("b", 2)];

        let done = TwoPhaseCommit::new(&sender, &drp)
            .execute(state.clone(), &trades)
            .await
            .unwrap();

        assert!(done.state.pending_transfers().is_empty());
        assert_eq!(done.receipts.len(), 2);
        assert_eq!(done.state.history().len(), 2);
        assert!(done
            .state
            .history()
            .iter()
            .all(|e| e.event_type == EVENT_TX_BROADCAST));

        // The intent snapshot was durable and shows the batch in flight.
        let intent = drp.load_snapshot(&done.pending_snapshot).await.unwrap();
        let sent = sender.sent.lock().unwrap().clone();
        assert_eq!(intent.pending_transfers().len(), 2);
        assert!(sent.iter().all(|id| intent.is_pending(id)));
    }

    #[tokio::test]
    async fn second_of_three_failing_clears_all_and_keeps_first_broadcast() {
        let (sender, drp, state) = setup(Some(1));
        let audit_dir = tempfile::TempDir::new().unwrap();
        let audit = AuditLog::in_dir(audit_dir.path());
        let trades = [trade("a", 1), trade("b", 2), trade("c", 3)];
        let ids: Vec<String> = sender
            .build_bundle(&state, &trades)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();

        let failure = TwoPhaseCommit::new(&sender, &drp)
            .with_audit(&audit)
            .execute(state.clone(), &trades)
            .await
            .unwrap_err();

        assert_eq!(failure.phase, CommitPhase::RolledBack);
        for id in &ids {
            assert!(!failure.state.is_pending(id));
        }
        assert_eq!(failure.broadcast.len(), 1);
        assert_eq!(failure.broadcast[0].tx_id, ids[0]);
        assert_eq!(*sender.sent.lock().unwrap(), vec![ids[0].clone()]);
        assert_eq!(
            failure.state.history().last().unwrap().event_type,
            EVENT_COMMIT_ROLLED_BACK
        );

        let audit_text = std::fs::read_to_string(audit.path().await).unwrap();
        assert!(audit_text.contains("commit_rolled_back"));

        match failure.into_error() {
            Error::CommitRolledBack { broadcast, source } => {
                assert_eq!(broadcast, vec![ids[0].clone()]);
                assert!(matches!(*source, Error::Broadcast(_)));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn nothing_is_sent_without_a_durable_intent() {
        let sender = ScriptedSender {
            fail_at: None,
            sent: StdMutex::new(Vec::new()),
        };
        let mem = MemoryStore::new();
        let drp = SnapshotStore::new(Arc::new(mem.clone()), DEFAULT_PREFIX);
        let state = SessionState::new(BTreeMap::new());
        mem.set_unavailable(true);

        let failure = TwoPhaseCommit::new(&sender, &drp)
            .execute(state.clone(), &[trade("a", 1)])
            .await
            .unwrap_err();

        assert_eq!(failure.phase, CommitPhase::None);
        assert_eq!(failure.state, state);
        assert!(sender.sent.lock().unwrap().is_empty());
        assert!(matches!(failure.into_error(), Error::SnapshotWrite { .. }));
    }
}
