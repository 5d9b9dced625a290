//! Arbitrage Agent Core
//!
//! Crash-safe session state, nonce custody and a kill-switch interlock for an
//! agent that moves capital across on-chain and off-chain venues:
//! - Immutable session state with DRP snapshots before and after every cycle
//! - Single-writer nonce manager shared by every broadcast path
//! - Two-phase commit that makes trade intent durable before submission
//! - Sandboxed, audited and optionally human-approved parameter mutations
//!
//! # Safety Model
//!
//! - Every capital-moving path calls [`KillSwitch::check`] first; an
//!   unreadable kill switch counts as active
//! - Private keys never leave the wallet module
//! - A failed cycle never leaves partial state behind
//! - Full audit trail of mutations, kill-switch toggles and rollbacks

pub mod audit;
pub mod config;
pub mod control;
pub mod drp;
pub mod kill_switch;
pub mod mutation;
pub mod nonce;
pub mod retry;
pub mod runner;
pub mod state;
pub mod storage;
pub mod strategy;
pub mod tx;
pub mod wallet;

mod error;

// Re-export commonly used types
pub use config::{Config, RpcConfig};
pub use drp::SnapshotStore;
pub use error::{Error, Result};
pub use kill_switch::KillSwitch;
pub use nonce::NonceManager;
pub use runner::{AgentRunner, HaltReason, RunOutcome};
pub use state::SessionState;
