//! Error types for the arbitrage agent core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The system-wide kill switch is active. Never retried.
    #[error("Kill switch active: {reason}")]
    KillSwitchActive { reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Snapshot write failed for {path}: {reason}")]
    SnapshotWrite { path: String, reason: String },

    #[error("Nonce lock not acquired: {0}")]
    NonceLock(String),

    #[error("Nonce store error: {0}")]
    NonceStore(String),

    #[error("Transient external error: {0}")]
    Transient(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Mutation proposal rejected by guardrail: {0}")]
    Guardrail(String),

    #[error("Strategy error: {0}")]
    Strategy(String),

    #[error("Broadcast failed: {0}")]
    Broadcast(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    /// A batch failed mid-submission. `broadcast` lists the transactions that
    /// already reached the network; they are NOT reversed.
    #[error("Batch rolled back after {} broadcast transaction(s): {source}", broadcast.len())]
    CommitRolledBack {
        broadcast: Vec<String>,
        #[source]
        source: Box<Error>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the safety interlock, including when it surfaces through a
    /// rolled-back batch.
    pub fn is_kill_switch(&self) -> bool {
        match self {
            Error::KillSwitchActive { .. } => true,
            Error::CommitRolledBack { source, .. } => source.is_kill_switch(),
            _ => false,
        }
    }

    /// Errors worth retrying at the adapter boundary.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient(_) => true,
            Error::Network(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    pub fn kill_switch(reason: impl Into<String>) -> Self {
        Error::KillSwitchActive {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
