//! Durable key/value object storage
//!
//! The DRP snapshot store and the kill switch both sit on top of this trait so
//! that the same code runs against a local directory or a shared remote
//! bucket. Keys are `/`-separated relative paths.

mod http;
mod local;
mod memory;

pub use http::HttpStore;
pub use local::LocalStore;
pub use memory::MemoryStore;

use crate::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `bytes` under `key` only if nothing is stored there yet.
    /// Returns `Ok(false)` when the key already exists.
    async fn put_new(&self, key: &str, bytes: &[u8]) -> Result<bool>;

    /// Write `bytes` under `key`, replacing any previous value atomically.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Read the value under `key`, `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete `key`. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Human-readable location of `key` (path or URL), used in logs and
    /// returned to operators as the snapshot address.
    fn locate(&self, key: &str) -> String;

    /// Inverse of [`ObjectStore::locate`]. `None` if `location` does not
    /// belong to this store.
    fn key_for(&self, location: &str) -> Option<String>;
}

/// Reject keys that could escape the store root.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|part| part.is_empty() || part == "..")
    {
        return Err(crate::Error::Storage(format!("invalid object key: {:?}", key)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation() {
        assert!(validate_key("drp/abc_20250101T000000Z.json").is_ok());
        assert!(validate_key("kill.flag").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("drp/../../secret").is_err());
        assert!(validate_key("drp//x").is_err());
    }
}
