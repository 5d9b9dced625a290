//! Secure wallet implementation
//!
//! SECURITY: This is the ONLY place where private keys exist.
//! - Keys are held in alloy's PrivateKeySigner
//! - Keys are never serialized or logged
//! - The raw hex only ever passes through a `SecretString`

use crate::{Error, Result};
use alloy::network::EthereumWallet;
use alloy::primitives::{Address, Bytes, U256};
use alloy::signers::local::PrivateKeySigner;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Transaction body before nonce assignment and signing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedTransaction {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    /// `None` lets the provider estimate.
    pub gas_limit: Option<u64>,
    pub chain_id: u64,
}

/// Secure wallet that protects private keys
///
/// No `Serialize` impl; the key is only reachable through the alloy
/// [`EthereumWallet`] signing interface.
pub struct SecureWallet {
    address: Address,
    wallet: EthereumWallet,
}

impl SecureWallet {
    /// Create a wallet from an environment variable holding a hex key.
    pub fn from_env(var_name: &str) -> Result<Self> {
        let key = std::env::var(var_name).map_err(|_| {
            Error::Wallet(format!(
                "Environment variable {} not set. Required for wallet initialization.",
                var_name
            ))
        })?;
        Self::from_secret(&SecretString::from(key))
    }

    pub fn from_secret(key: &SecretString) -> Result<Self> {
        let raw = key.expose_secret().trim();
        let raw = raw.strip_prefix("0x").unwrap_or(raw);

        let signer: PrivateKeySigner = raw
            .parse()
            .map_err(|e| Error::Wallet(format!("Invalid private key: {}", e)))?;

        Ok(Self {
            address: signer.address(),
            wallet: EthereumWallet::from(signer),
        })
    }

    /// Public address (safe to share)
    pub fn address(&self) -> Address {
        self.address
    }

    /// Signing handle for alloy providers. Exposes signing, not the key.
    pub fn wallet(&self) -> &EthereumWallet {
        &self.wallet
    }
}

impl std::fmt::Debug for SecureWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureWallet")
            .field("address", &self.address)
            .field("signer", &"[REDACTED]")
            .finish()
    }
}
