//! Filesystem-backed object store

use super::{validate_key, ObjectStore};
use crate::Result;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Stores each object as a file under `root`.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put_new(&self, key: &str, bytes: &[u8]) -> Result<bool> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path).await?;

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok(true)
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path).await?;

        // Write-then-rename so readers never observe a torn file.
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        match fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // Only the directory part of the prefix is walked; no recursion.
        let (dir, name_prefix) = match prefix.rfind('/') {
            Some(idx) => (&prefix[..idx], &prefix[idx + 1..]),
            None => ("", prefix),
        };
        let dir_path = if dir.is_empty() {
            self.root.clone()
        } else {
            self.path_for(dir)?
        };

        let mut entries = match fs::read_dir(&dir_path).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name.contains(".tmp-") || !name.starts_with(name_prefix) {
                continue;
            }
            keys.push(if dir.is_empty() {
                name
            } else {
                format!("{}/{}", dir, name)
            });
        }
        keys.sort();
        Ok(keys)
    }

    fn locate(&self, key: &str) -> String {
        self.root.join(key).display().to_string()
    }

    fn key_for(&self, location: &str) -> Option<String> {
        let rel = Path::new(location).strip_prefix(&self.root).ok()?;
        let key = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?
            .join("/");
        validate_key(&key).ok()?;
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn put_new_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());

        assert!(store.put_new("drp/a.json", b"first").await.unwrap());
        assert!(!store.put_new("drp/a.json", b"second").await.unwrap());
        assert_eq!(
            store.get("drp/a.json").await.unwrap().as_deref(),
            Some(&b"first"[..])
        );
    }

    #[tokio::test]
    async fn put_replaces_and_list_filters_by_prefix() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());

        store.put("drp/s1_1.json", b"1").await.unwrap();
        store.put("drp/s1_2.json", b"2").await.unwrap();
        store.put("drp/s2_1.json", b"3").await.unwrap();
        store.put("drp/s1_2.json", b"2b").await.unwrap();

        let keys = store.list("drp/s1_").await.unwrap();
        assert_eq!(keys, vec!["drp/s1_1.json", "drp/s1_2.json"]);
        assert_eq!(
            store.get("drp/s1_2.json").await.unwrap().as_deref(),
            Some(&b"2b"[..])
        );
    }

    #[tokio::test]
    async fn missing_objects() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path());

        assert!(store.get("nope").await.unwrap().is_none());
        assert!(!store.exists("nope").await.unwrap());
        store.delete("nope").await.unwrap();
        assert!(store.list("drp/").await.unwrap().is_empty());
    }

    #[test]
    fn locate_round_trips() {
        let store = LocalStore::new("/var/lib/agent");
        let loc = store.locate("drp/x.json");
        assert_eq!(store.key_for(&loc).as_deref(), Some("drp/x.json"));
        assert!(store.key_for("/elsewhere/x.json").is_none());
    }
}
