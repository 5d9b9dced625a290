//! Strategy boundary
//!
//! Strategies decide what to trade; they never touch the nonce manager or
//! the DRP store. Capital-moving work goes through [`Adapters::tx`] and the
//! run loop's two-phase commit.

use crate::kill_switch::KillSwitch;
use crate::mutation::{MutationProposal, SuggestionSource};
use crate::state::SessionState;
use crate::tx::{Trade, TxSender};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Result of one strategy cycle.
#[derive(Debug)]
pub enum CycleOutput {
    State(SessionState),
    WithTrades(SessionState, Vec<Trade>),
}

impl CycleOutput {
    pub fn into_parts(self) -> (SessionState, Vec<Trade>) {
        match self {
            CycleOutput::State(s) => (s, Vec::new()),
            CycleOutput::WithTrades(s, trades) => (s, trades),
        }
    }
}

/// Capabilities handed to a strategy. Each adapter checks the kill switch
/// itself before moving capital.
#[derive(Clone)]
pub struct Adapters {
    pub tx: Arc<dyn TxSender>,
    pub suggestions: Option<Arc<dyn SuggestionSource>>,
    pub kill_switch: KillSwitch,
}

#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &mut self,
        state: &SessionState,
        adapters: &Adapters,
        config: &Value,
    ) -> Result<CycleOutput>;

    /// Apply a validated proposal. `Ok(true)` if any parameter changed.
    async fn mutate(&mut self, proposal: &MutationProposal, adapters: &Adapters) -> Result<bool>;

    /// Serializable view of the tunable parameters.
    fn params(&self) -> Value;

    /// Put back parameters captured with [`Strategy::params`].
    fn restore_params(&mut self, params: Value) -> Result<()>;

    async fn abort(&mut self, reason: &str);

    fn performance_data(&self, state: &SessionState) -> Value {
        json!({
            "cycle": state.cycle_counter(),
            "capital_base": state.capital_base(),
            "trades": state.history().len(),
            "pending_transfers": state.pending_transfers().len(),
        })
    }
}

/// Never trades. Keeps a flat map of numeric knobs that mutations may tune,
/// which makes it usable for dry runs of the whole pipeline.
pub struct IdleStrategy {
    name: String,
    params: Map<String, Value>,
    aborted: Option<String>,
}

impl IdleStrategy {
    pub fn new(name: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            params,
            aborted: None,
        }
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.aborted.as_deref()
    }
}

#[async_trait]
impl Strategy for IdleStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &mut self,
        state: &SessionState,
        _adapters: &Adapters,
        _config: &Value,
    ) -> Result<CycleOutput> {
        tracing::debug!(strategy = %self.name, cycle = state.cycle_counter(), "Idle cycle");
        Ok(CycleOutput::State(state.clone()))
    }

    async fn mutate(&mut self, proposal: &MutationProposal, _adapters: &Adapters) -> Result<bool> {
        let mut changed = false;
        for (key, value) in &proposal.params {
            if !self.params.contains_key(key) {
                return Err(Error::Validation(format!(
                    "{} has no parameter {:?}",
                    self.name, key
                )));
            }
            if !value.is_number() {
                return Err(Error::Validation(format!("{} must be numeric", key)));
            }
            if self.params.get(key) != Some(value) {
                self.params.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        Ok(changed)
    }

    fn params(&self) -> Value {
        Value::Object(self.params.clone())
    }

    fn restore_params(&mut self, params: Value) -> Result<()> {
        match params {
            Value::Object(map) => {
                self.params = map;
                Ok(())
            }
            other => Err(Error::Validation(format!(
                "expected parameter object, got {}",
                other
            ))),
        }
    }

    async fn abort(&mut self, reason: &str) {
        tracing::error!(strategy = %self.name, reason, "Strategy aborted");
        self.aborted = Some(reason.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::tx::{Transaction, TxReceipt};
    use std::collections::BTreeMap;

    struct NoSender;

    #[async_trait]
    impl TxSender for NoSender {
        fn build_bundle(&self, _: &SessionState, _: &[Trade]) -> Result<Vec<Transaction>> {
            Ok(Vec::new())
        }
        async fn send(&self, tx: &Transaction) -> Result<TxReceipt> {
            Err(Error::Broadcast(format!("unexpected send of {}", tx.id)))
        }
    }

    fn adapters() -> Adapters {
        Adapters {
            tx: Arc::new(NoSender),
            suggestions: None,
            kill_switch: KillSwitch::with_default_key(Arc::new(MemoryStore::new())),
        }
    }

    fn proposal(params: Value) -> MutationProposal {
        MutationProposal {
            strategy: "idle".into(),
            params: serde_json::from_value(params).unwrap(),
            rationale: "tighten".into(),
        }
    }

    #[tokio::test]
    async fn idle_strategy_tunes_known_numeric_params() {
        let mut s = IdleStrategy::new(
            "idle",
            serde_json::from_value(json!({"min_profit_bps": 25})).unwrap(),
        );
        let a = adapters();

        assert!(s.mutate(&proposal(json!({"min_profit_bps": 30})), &a).await.unwrap());
        assert!(!s.mutate(&proposal(json!({"min_profit_bps": 30})), &a).await.unwrap());
        assert!(s.mutate(&proposal(json!({"unknown": 1})), &a).await.is_err());
        assert!(s.mutate(&proposal(json!({"min_profit_bps": "x"})), &a).await.is_err());
        assert_eq!(s.params(), json!({"min_profit_bps": 30}));

        s.restore_params(json!({"min_profit_bps": 25})).unwrap();
        assert_eq!(s.params(), json!({"min_profit_bps": 25}));
        assert!(s.restore_params(json!([1])).is_err());
    }

    #[tokio::test]
    async fn idle_cycle_returns_state_without_trades() {
        let mut s = IdleStrategy::new("idle", Map::new());
        let state = SessionState::new(BTreeMap::new());
        let (out, trades) = s
            .run(&state, &adapters(), &Value::Null)
            .await
            .unwrap()
            .into_parts();
        assert_eq!(out, state);
        assert!(trades.is_empty());

        let perf = s.performance_data(&state);
        assert_eq!(perf["cycle"], 0);

        s.abort("halt").await;
        assert_eq!(s.abort_reason(), Some("halt"));
    }
}
