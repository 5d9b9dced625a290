//! Configuration for the arbitrage agent
//!
//! Non-secret settings come from an optional JSON file; every field has a
//! default so a partial file is enough. Secrets are read from the
//! environment only and never serialized.

pub mod rpc;

use crate::mutation::MutationSettings;
use crate::retry::RetryPolicy;
use crate::storage::{HttpStore, LocalStore, ObjectStore};
use crate::{Error, Result};
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub use rpc::RpcConfig;

/// Shared secret for the control API
pub const CONTROL_API_TOKEN_ENV: &str = "CONTROL_API_TOKEN";
/// Hex private key of the signing account
pub const PRIVATE_KEY_ENV: &str = "PRIVATE_KEY";
/// Bearer token for the remote object store
pub const OBJECT_STORE_TOKEN_ENV: &str = "OBJECT_STORE_TOKEN";
/// Model endpoint for parameter suggestions
pub const SUGGESTION_URL_ENV: &str = "SUGGESTION_URL";
pub const SUGGESTION_TOKEN_ENV: &str = "SUGGESTION_API_TOKEN";

/// Run loop timing and failure handling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub cycle_interval_ms: u64,
    /// Halt once this many cycles in a row have failed
    pub max_consecutive_failures: u32,
    /// How often to ask the suggestion source for new parameters
    pub mutation_interval_secs: u64,
    pub failure_backoff_ms: u64,
    /// Stop after this many cycles (dry runs)
    pub max_cycles: Option<u64>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 5_000,
            max_consecutive_failures: 3,
            mutation_interval_secs: 300,
            failure_backoff_ms: 2_000,
            max_cycles: None,
        }
    }
}

impl AgentSettings {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_millis(self.failure_backoff_ms)
    }

    pub fn mutation_interval(&self) -> Duration {
        Duration::from_secs(self.mutation_interval_secs)
    }
}

/// Which strategy to run and its initial parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategySettings {
    pub name: String,
    /// Tunable parameters, the surface mutations may change
    pub params: Map<String, Value>,
    /// Opaque per-cycle configuration handed to `Strategy::run`
    pub config: Value,
    /// Starting balances keyed by asset
    pub capital: BTreeMap<String, Decimal>,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            name: "idle".to_string(),
            params: Map::new(),
            config: Value::Null,
            capital: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrpSettings {
    pub prefix: String,
    /// Snapshots older than this are pruned on later saves
    pub ttl_secs: Option<u64>,
    /// Remote object store base URL; local session directory when unset
    pub remote_url: Option<String>,
}

impl Default for DrpSettings {
    fn default() -> Self {
        Self {
            prefix: crate::drp::DEFAULT_PREFIX.to_string(),
            ttl_secs: None,
            remote_url: None,
        }
    }
}

impl DrpSettings {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchSettings {
    pub marker_key: String,
    pub remote_url: Option<String>,
}

impl Default for KillSwitchSettings {
    fn default() -> Self {
        Self {
            marker_key: crate::kill_switch::DEFAULT_MARKER_KEY.to_string(),
            remote_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    pub bind: String,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NonceSettings {
    /// File name under the session directory
    pub lock_file: String,
    pub chain_id: u64,
}

impl Default for NonceSettings {
    fn default() -> Self {
        Self {
            lock_file: "nonce.lock".to_string(),
            // Ethereum mainnet
            chain_id: 1,
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local state: nonce file, approvals, audit log, local snapshots
    pub session_dir: PathBuf,
    pub agent: AgentSettings,
    pub strategy: StrategySettings,
    pub drp: DrpSettings,
    pub kill_switch: KillSwitchSettings,
    pub mutation: MutationSettings,
    pub control: ControlSettings,
    pub nonce: NonceSettings,
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_dir: PathBuf::from("session"),
            agent: AgentSettings::default(),
            strategy: StrategySettings::default(),
            drp: DrpSettings::default(),
            kill_switch: KillSwitchSettings::default(),
            mutation: MutationSettings::default(),
            control: ControlSettings::default(),
            nonce: NonceSettings::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.max_consecutive_failures == 0 {
            return Err(Error::Config(
                "agent.max_consecutive_failures must be at least 1".into(),
            ));
        }
        if self.retry.attempts == 0 {
            return Err(Error::Config("retry.attempts must be at least 1".into()));
        }
        if self.strategy.name.trim().is_empty() {
            return Err(Error::Config("strategy.name is empty".into()));
        }
        Ok(())
    }

    pub fn nonce_path(&self) -> PathBuf {
        self.session_dir.join(&self.nonce.lock_file)
    }

    pub fn approvals_dir(&self) -> PathBuf {
        self.session_dir.join("approvals")
    }

    /// Backing store for DRP snapshots.
    pub fn snapshot_backend(&self) -> Result<Arc<dyn ObjectStore>> {
        self.backend(self.drp.remote_url.as_deref())
    }

    /// Backing store for the kill-switch marker.
    pub fn kill_switch_backend(&self) -> Result<Arc<dyn ObjectStore>> {
        self.backend(self.kill_switch.remote_url.as_deref())
    }

    fn backend(&self, remote: Option<&str>) -> Result<Arc<dyn ObjectStore>> {
        Ok(match remote {
            Some(url) => Arc::new(HttpStore::new(url, secret(OBJECT_STORE_TOKEN_ENV))?),
            None => Arc::new(LocalStore::new(&self.session_dir)),
        })
    }
}

/// Read a secret from the environment. Empty values count as unset.
pub fn secret(var: &str) -> Option<SecretString> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}
