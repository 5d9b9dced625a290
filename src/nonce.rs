//! Durable, cross-process nonce custody for one signing account
//!
//! The nonce lives as a plain-text integer in a lock file that is held with
//! an exclusive OS lock for as long as the manager is open. A second
//! process (or a second manager in the same process) cannot initialize
//! against the same file, which makes the manager the single writer of
//! nonces for the account.
//!
//! Sending goes through [`NonceManager::lease`]: the lease holds the
//! in-process mutex across sign + broadcast, and [`NonceLease::commit`]
//! persists `N + 1` before the mutex is released. Dropping a lease without
//! committing leaves the nonce untouched.

use crate::retry::{transient, RetryPolicy};
use crate::{Error, Result};
use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder};
use async_trait::async_trait;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Authoritative nonce, i.e. the chain's transaction count for the account.
#[async_trait]
pub trait NonceSource: Send + Sync {
    async fn transaction_count(&self) -> Result<u64>;
}

/// Reads the pending transaction count over JSON-RPC.
pub struct RpcNonceSource {
    rpc_url: url::Url,
    address: Address,
    retry: RetryPolicy,
}

impl RpcNonceSource {
    pub fn new(rpc_url: &str, address: Address, retry: RetryPolicy) -> Result<Self> {
        let rpc_url = rpc_url
            .parse()
            .map_err(|e| Error::Config(format!("invalid RPC URL: {}", e)))?;
        Ok(Self {
            rpc_url,
            address,
            retry,
        })
    }
}

#[async_trait]
impl NonceSource for RpcNonceSource {
    async fn transaction_count(&self) -> Result<u64> {
        let provider = ProviderBuilder::new().connect_http(self.rpc_url.clone());
        let address = self.address;
        self.retry
            .run("get_transaction_count", |_| {
                let provider = provider.clone();
                async move {
                    provider
                        .get_transaction_count(address)
                        .pending()
                        .await
                        .map_err(transient)
                }
            })
            .await
    }
}

#[derive(Default)]
struct Slot {
    file: Option<File>,
    nonce: Option<u64>,
}

pub struct NonceManager {
    path: PathBuf,
    source: Arc<dyn NonceSource>,
    slot: Mutex<Slot>,
}

impl NonceManager {
    pub fn new(path: impl Into<PathBuf>, source: Arc<dyn NonceSource>) -> Self {
        Self {
            path: path.into(),
            source,
            slot: Mutex::new(Slot::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the exclusive lock and load the current nonce.
    ///
    /// Fails with [`Error::NonceLock`] if another holder owns the file. A
    /// missing or unparsable value is replaced by the chain's transaction
    /// count, which is persisted immediately.
    pub async fn initialize(&self) -> Result<u64> {
        let mut slot = self.slot.lock().await;
        if let (Some(_), Some(nonce)) = (&slot.file, slot.nonce) {
            return Ok(nonce);
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::NonceStore(format!("{}: {}", parent.display(), e)))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| Error::NonceStore(format!("{}: {}", self.path.display(), e)))?;

        file.try_lock_exclusive().map_err(|e| {
            Error::NonceLock(format!(
                "{} is held by another process ({})",
                self.path.display(),
                e
            ))
        })?;

        let mut raw = String::new();
        file.read_to_string(&mut raw)
            .map_err(|e| Error::NonceStore(format!("{}: {}", self.path.display(), e)))?;

        let nonce = match raw.trim().parse::<u64>() {
            Ok(n) => {
                tracing::info!(nonce = n, path = %self.path.display(), "Nonce loaded from lock file");
                n
            }
            Err(_) => {
                if !raw.trim().is_empty() {
                    tracing::warn!(content = %raw.trim(), "Corrupt nonce file, falling back to chain");
                }
                let n = match self.source.transaction_count().await {
                    Ok(n) => n,
                    Err(e) => {
                        let _ = FileExt::unlock(&file);
                        return Err(e);
                    }
                };
                write_nonce(&mut file, n)?;
                tracing::info!(nonce = n, "Nonce initialized from chain");
                n
            }
        };

        slot.file = Some(file);
        slot.nonce = Some(nonce);
        Ok(nonce)
    }

    /// The next nonce to use.
    pub async fn get(&self) -> Result<u64> {
        let slot = self.slot.lock().await;
        Self::current(&slot)
    }

    /// Record one successful broadcast. Call only after the transaction has
    /// been accepted by the network.
    pub async fn bump(&self) -> Result<u64> {
        let mut slot = self.slot.lock().await;
        Self::advance(&mut slot)
    }

    /// Hold the nonce exclusively for one sign-and-broadcast sequence.
    pub async fn lease(&self) -> Result<NonceLease<'_>> {
        let slot = self.slot.lock().await;
        let nonce = Self::current(&slot)?;
        Ok(NonceLease { slot, nonce })
    }

    /// Replace the local nonce with the chain's view, e.g. after a
    /// "nonce too low" rejection.
    pub async fn resync(&self) -> Result<u64> {
        let mut slot = self.slot.lock().await;
        let old = Self::current(&slot)?;
        let fresh = self.source.transaction_count().await?;
        if let Some(file) = slot.file.as_mut() {
            write_nonce(file, fresh)?;
        }
        slot.nonce = Some(fresh);
        tracing::warn!(old_nonce = old, new_nonce = fresh, "Nonce resynchronized from chain");
        Ok(fresh)
    }

    /// Release the lock. Safe to call more than once.
    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        Self::release(&mut slot, &self.path);
    }

    fn current(slot: &Slot) -> Result<u64> {
        slot.nonce
            .filter(|_| slot.file.is_some())
            .ok_or_else(|| Error::NonceStore("nonce manager not initialized".into()))
    }

    fn advance(slot: &mut Slot) -> Result<u64> {
        let next = Self::current(slot)? + 1;
        if let Some(file) = slot.file.as_mut() {
            write_nonce(file, next)?;
        }
        slot.nonce = Some(next);
        tracing::debug!(nonce = next, "Nonce bumped");
        Ok(next)
    }

    fn release(slot: &mut Slot, path: &Path) {
        if let Some(file) = slot.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                tracing::warn!(error = %e, "Failed to unlock nonce file");
            }
            slot.nonce = None;
            tracing::info!(path = %path.display(), "Nonce lock released");
        }
    }
}

impl Drop for NonceManager {
    fn drop(&mut self) {
        // The OS releases the lock on process death; this covers normal exits.
        Self::release(self.slot.get_mut(), &self.path);
    }
}

/// Exclusive hold on the account nonce. See [`NonceManager::lease`].
pub struct NonceLease<'a> {
    slot: MutexGuard<'a, Slot>,
    nonce: u64,
}

impl NonceLease<'_> {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Persist `nonce + 1`. Only call after a successful broadcast.
    pub fn commit(mut self) -> Result<u64> {
        NonceManager::advance(&mut self.slot)
    }
}

fn write_nonce(file: &mut File, nonce: u64) -> Result<()> {
    let io = |e: std::io::Error| Error::NonceStore(format!("persist nonce {}: {}", nonce, e));
    file.seek(SeekFrom::Start(0)).map_err(io)?;
    file.set_len(0).map_err(io)?;
    file.write_all(nonce.to_string().as_bytes()).map_err(io)?;
    file.sync_data().map_err(io)?;
    Ok(())
}
