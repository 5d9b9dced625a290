//! RPC endpoint configuration
//!
//! Endpoints are read in priority order:
//! 1. `ETH_RPC_URL` - the primary node
//! 2. `ETH_RPC_URL_1`, `ETH_RPC_URL_2`, ... - failover nodes, scanned until
//!    the first gap
//!
//! # Examples
//!
//! ```bash
//! export ETH_RPC_URL="https://eth-mainnet.g.alchemy.com/v2/YOUR_KEY"
//! export ETH_RPC_URL_1="https://mainnet.infura.io/v3/YOUR_KEY"
//! export ETH_RPC_URL_2="https://rpc.ankr.com/eth"
//! ```
//!
//! There is deliberately no public fallback: an agent that signs must know
//! which node it talks to.

use crate::{Error, Result};

const PRIMARY_VAR: &str = "ETH_RPC_URL";

/// Ordered, de-duplicated list of RPC endpoints for the signing chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcConfig {
    urls: Vec<String>,
}

impl RpcConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable lookup; `from_env` passes the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(url) = lookup(PRIMARY_VAR) {
            tracing::debug!("Using {} as primary RPC", PRIMARY_VAR);
            config.push(url);
        }
        let mut i = 1;
        while let Some(url) = lookup(&format!("{}_{}", PRIMARY_VAR, i)) {
            config.push(url);
            i += 1;
        }
        if config.urls.is_empty() {
            tracing::warn!("No RPC endpoint configured; set {}", PRIMARY_VAR);
        } else {
            tracing::info!(endpoints = config.urls.len(), "RPC endpoints loaded");
        }
        config
    }

    pub fn with_urls(urls: Vec<String>) -> Self {
        let mut config = Self::default();
        for url in urls {
            config.push(url);
        }
        config
    }

    fn push(&mut self, url: String) {
        let url = url.trim().to_string();
        if !url.is_empty() && !self.urls.contains(&url) {
            self.urls.push(url);
        }
    }

    /// The first configured endpoint.
    pub fn primary(&self) -> Result<&str> {
        self.urls
            .first()
            .map(String::as_str)
            .ok_or_else(|| Error::Config(format!("no RPC endpoint configured; set {}", PRIMARY_VAR)))
    }

    /// All endpoints, primary first, for broadcast failover.
    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn primary_then_numbered_failovers() {
        let config = RpcConfig::from_lookup(lookup(&[
            ("ETH_RPC_URL", "https://a"),
            ("ETH_RPC_URL_1", "https://b"),
            ("ETH_RPC_URL_2", "https://a"),
            ("ETH_RPC_URL_3", "https://c"),
            ("ETH_RPC_URL_5", "https://unreachable"),
        ]));
        assert_eq!(config.urls(), ["https://a", "https://b", "https://c"]);
        assert_eq!(config.primary().unwrap(), "https://a");
    }

    #[test]
    fn numbered_only_is_enough() {
        let config = RpcConfig::from_lookup(lookup(&[("ETH_RPC_URL_1", "https://b")]));
        assert_eq!(config.primary().unwrap(), "https://b");
    }

    #[test]
    fn empty_is_a_config_error() {
        let config = RpcConfig::from_lookup(lookup(&[("ETH_RPC_URL", "  ")]));
        assert!(config.is_empty());
        assert!(matches!(config.primary(), Err(Error::Config(_))));
        assert_eq!(RpcConfig::with_urls(vec!["x".into(), "x".into()]).urls().len(), 1);
    }
}
