//! Immutable session state
//!
//! A [`SessionState`] is the source of truth for one agent session: capital
//! per venue-qualified asset, the append-only event history, in-flight
//! transfer ids, and the cycle counter. Every mutator takes `&self` and
//! returns a new value, so holding an old state is a free rollback point and
//! concurrent readers never observe a half-applied change.
//!
//! Decimal balances serialize as strings, which keeps snapshots exact.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

pub const EVENT_TRADE_EXECUTED: &str = "TRADE_EXECUTED";

/// One entry of the session audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistoryEvent {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionState {
    session_id: Uuid,
    start_time: DateTime<Utc>,
    capital_base: BTreeMap<String, Decimal>,
    history: Vec<HistoryEvent>,
    pending_transfers: BTreeSet<String>,
    cycle_counter: u64,
}

impl SessionState {
    /// Start a fresh session with the given opening balances.
    pub fn new(capital_base: BTreeMap<String, Decimal>) -> Self {
        let state = Self {
            session_id: Uuid::new_v4(),
            start_time: Utc::now(),
            capital_base,
            history: Vec::new(),
            pending_transfers: BTreeSet::new(),
            cycle_counter: 0,
        };
        tracing::info!(
            session_id = %state.session_id,
            capital = ?state.capital_base,
            "Session state created"
        );
        state
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn capital_base(&self) -> &BTreeMap<String, Decimal> {
        &self.capital_base
    }

    /// Balance for `asset`, zero if the asset was never touched.
    pub fn balance(&self, asset: &str) -> Decimal {
        self.capital_base
            .get(asset)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn history(&self) -> &[HistoryEvent] {
        &self.history
    }

    pub fn pending_transfers(&self) -> &BTreeSet<String> {
        &self.pending_transfers
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending_transfers.contains(id)
    }

    pub fn cycle_counter(&self) -> u64 {
        self.cycle_counter
    }

    /// Append a `TRADE_EXECUTED` event.
    pub fn record_trade(&self, details: Value) -> Self {
        self.record_event(EVENT_TRADE_EXECUTED, details)
    }

    /// Append an arbitrary event to the history.
    pub fn record_event(&self, event_type: &str, data: Value) -> Self {
        let event = HistoryEvent {
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            data,
        };
        tracing::info!(
            session_id = %self.session_id,
            cycle = self.cycle_counter,
            event_type,
            data = %event.data,
            "State event recorded"
        );

        let mut history = Vec::with_capacity(self.history.len() + 1);
        history.extend(self.history.iter().cloned());
        history.push(event);
        Self {
            history,
            ..self.clone()
        }
    }

    /// Apply signed deltas. Unknown assets start from zero; balances may go
    /// negative while debits are in flight. Keys are never removed.
    pub fn update_capital<I, K>(&self, changes: I) -> Self
    where
        I: IntoIterator<Item = (K, Decimal)>,
        K: Into<String>,
    {
        let mut capital_base = self.capital_base.clone();
        let mut applied = BTreeMap::new();
        for (asset, delta) in changes {
            let asset = asset.into();
            *capital_base.entry(asset.clone()).or_insert(Decimal::ZERO) += delta;
            *applied.entry(asset).or_insert(Decimal::ZERO) += delta;
        }
        tracing::info!(
            session_id = %self.session_id,
            cycle = self.cycle_counter,
            changes = ?applied,
            balances = ?capital_base,
            "Capital updated"
        );
        Self {
            capital_base,
            ..self.clone()
        }
    }

    /// Set union. Marking an id that is already pending is a no-op.
    pub fn mark_pending<I, S>(&self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut pending_transfers = self.pending_transfers.clone();
        pending_transfers.extend(ids.into_iter().map(Into::into));
        tracing::debug!(
            session_id = %self.session_id,
            pending = pending_transfers.len(),
            "Transfers marked pending"
        );
        Self {
            pending_transfers,
            ..self.clone()
        }
    }

    /// Set difference. Clearing an absent id is a no-op.
    pub fn clear_pending<I, S>(&self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut pending_transfers = self.pending_transfers.clone();
        for id in ids {
            pending_transfers.remove(id.as_ref());
        }
        tracing::debug!(
            session_id = %self.session_id,
            pending = pending_transfers.len(),
            "Pending transfers cleared"
        );
        Self {
            pending_transfers,
            ..self.clone()
        }
    }

    /// Advance the cycle counter by one.
    pub fn next_cycle(&self) -> Self {
        Self {
            cycle_counter: self.cycle_counter + 1,
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate a serialized state. Malformed input is rejected
    /// as a whole; no partial state is ever produced.
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| Error::Validation(format!("state is not valid JSON: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let state: Self = serde_json::from_value(value)
            .map_err(|e| Error::Validation(format!("state schema mismatch: {}", e)))?;
        state.validate()?;
        Ok(state)
    }

    fn validate(&self) -> Result<()> {
        if self.session_id.is_nil() {
            return Err(Error::Validation("session_id is nil".into()));
        }
        if let Some(key) = self.capital_base.keys().find(|k| k.trim().is_empty()) {
            return Err(Error::Validation(format!("empty asset key {:?}", key)));
        }
        if let Some(pos) = self
            .history
            .iter()
            .position(|e| e.event_type.trim().is_empty())
        {
            return Err(Error::Validation(format!(
                "history entry {} has empty event_type",
                pos
            )));
        }
        if self.pending_transfers.iter().any(|id| id.trim().is_empty()) {
            return Err(Error::Validation("empty pending transfer id".into()));
        }
        Ok(())
    }
}
