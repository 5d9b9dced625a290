//! Key custody and on-chain broadcast
//!
//! The private key lives only inside [`SecureWallet`]; the broadcaster signs
//! through alloy's wallet filler and never sees key material.

mod broadcaster;
mod signer;

pub use broadcaster::RpcBroadcaster;
pub use signer::{PreparedTransaction, SecureWallet};
