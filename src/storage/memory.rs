//! In-process object store for dry runs and tests

use super::{validate_key, ObjectStore};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

const SCHEME: &str = "memory://";

/// Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    objects: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails until re-enabled.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn guard(&self, key: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!("store unavailable ({})", key)));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_new(&self, key: &str, bytes: &[u8]) -> Result<bool> {
        validate_key(key)?;
        self.guard(key)?;
        let mut objects = self.objects.write().await;
        if objects.contains_key(key) {
            return Ok(false);
        }
        objects.insert(key.to_string(), bytes.to_vec());
        Ok(true)
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.guard(key)?;
        self.objects
            .write()
            .await
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.guard(key)?;
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.guard(key)?;
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.guard(key)?;
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.guard(prefix)?;
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn locate(&self, key: &str) -> String {
        format!("{}{}", SCHEME, key)
    }

    fn key_for(&self, location: &str) -> Option<String> {
        location.strip_prefix(SCHEME).map(str::to_owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outage_fails_every_call() {
        let store = MemoryStore::new();
        store.put("a", b"1").await.unwrap();
        store.set_unavailable(true);
        assert!(store.get("a").await.is_err());
        assert!(store.exists("a").await.is_err());
        store.set_unavailable(false);
        assert!(store.exists("a").await.unwrap());
    }
}
