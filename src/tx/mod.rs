//! Transaction submission
//!
//! [`TxSender`] is the boundary the two-phase commit talks to. The
//! production implementation, [`TransactionManager`], gates every send on the
//! kill switch, holds a nonce lease across broadcast and bumps the nonce only
//! once the network has accepted the transaction.

pub mod two_phase;

pub use two_phase::{BatchCommitted, BatchFailure, CommitPhase, TwoPhaseCommit};

use crate::kill_switch::KillSwitch;
use crate::nonce::NonceManager;
use crate::state::SessionState;
use crate::wallet::PreparedTransaction;
use crate::{Error, Result};
use alloy::primitives::{Address, Bytes, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// A capital-moving action proposed by a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub venue: String,
    pub to: Address,
    #[serde(default)]
    pub data: Bytes,
    #[serde(default)]
    pub value: U256,
    #[serde(default)]
    pub gas_limit: Option<u64>,
    /// Free-form context carried into logs and history.
    #[serde(default)]
    pub memo: Value,
}

/// A trade bound to a transaction id, ready to send.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub id: String,
    pub venue: String,
    pub request: PreparedTransaction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TxReceipt {
    pub tx_id: String,
    pub tx_hash: String,
    pub nonce: u64,
}

/// Builds and sends the transactions behind a batch of trades.
#[async_trait]
pub trait TxSender: Send + Sync {
    fn build_bundle(&self, state: &SessionState, trades: &[Trade]) -> Result<Vec<Transaction>>;

    /// Submit one transaction. Implementations check the kill switch and
    /// take a nonce before broadcasting.
    async fn send(&self, tx: &Transaction) -> Result<TxReceipt>;
}

/// Signs and broadcasts with an explicit nonce, returning the tx hash.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, tx: &Transaction, nonce: u64) -> Result<String>;
}

/// Stable id for the `index`-th transaction of a batch. The same trade in
/// the same cycle always gets the same id.
pub fn transaction_id(state: &SessionState, index: usize, request: &PreparedTransaction) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(state.session_id().as_bytes());
    hasher.update(&state.cycle_counter().to_le_bytes());
    hasher.update(&(index as u64).to_le_bytes());
    hasher.update(&serde_json::to_vec(request)?);
    Ok(format!("tx-{}", &hasher.finalize().to_hex()[..16]))
}

fn is_nonce_too_low(e: &Error) -> bool {
    e.to_string().to_lowercase().contains("nonce too low")
}

pub struct TransactionManager {
    kill_switch: KillSwitch,
    nonces: Arc<NonceManager>,
    broadcaster: Arc<dyn Broadcaster>,
    chain_id: u64,
}

impl TransactionManager {
    pub fn new(
        kill_switch: KillSwitch,
        nonces: Arc<NonceManager>,
        broadcaster: Arc<dyn Broadcaster>,
        chain_id: u64,
    ) -> Self {
        Self {
            kill_switch,
            nonces,
            broadcaster,
            chain_id,
        }
    }

    pub fn nonces(&self) -> &Arc<NonceManager> {
        &self.nonces
    }
}

#[async_trait]
impl TxSender for TransactionManager {
    fn build_bundle(&self, state: &SessionState, trades: &[Trade]) -> Result<Vec<Transaction>> {
        trades
            .iter()
            .enumerate()
            .map(|(index, trade)| {
                if trade.venue.trim().is_empty() {
                    return Err(Error::Validation(format!("trade {} has no venue", index)));
                }
                let request = PreparedTransaction {
                    to: trade.to,
                    data: trade.data.clone(),
                    value: trade.value,
                    gas_limit: trade.gas_limit,
                    chain_id: self.chain_id,
                };
                Ok(Transaction {
                    id: transaction_id(state, index, &request)?,
                    venue: trade.venue.clone(),
                    request,
                })
            })
            .collect()
    }

    async fn send(&self, tx: &Transaction) -> Result<TxReceipt> {
        let lease = self.nonces.lease().await?;
        // Checked under the lease so nothing queued behind a halt can slip out.
        if let Err(e) = self.kill_switch.check().await {
            tracing::error!(tx_id = %tx.id, venue = %tx.venue, "Transaction blocked by kill switch");
            return Err(e);
        }
        let nonce = lease.nonce();

        match self.broadcaster.broadcast(tx, nonce).await {
            Ok(tx_hash) => {
                lease.commit()?;
                tracing::info!(tx_id = %tx.id, tx_hash = %tx_hash, nonce, venue = %tx.venue, "Transaction broadcast");
                Ok(TxReceipt {
                    tx_id: tx.id.clone(),
                    tx_hash,
                    nonce,
                })
            }
            Err(e) => {
                drop(lease);
                tracing::error!(tx_id = %tx.id, nonce, error = %e, "Transaction send failed");
                if is_nonce_too_low(&e) {
                    tracing::warn!(tx_id = %tx.id, "Nonce too low, resynchronizing");
                    if let Err(resync) = self.nonces.resync().await {
                        tracing::error!(error = %resync, "Nonce resync failed");
                    }
                }
                Err(e)
            }
        }
    }
}
