//! Object storage for processed images
//!
//! The worker only needs `put` and a temporary link; `get` and link
//! verification back the `/api/results` download route, and the queue's
//! retention sweep uses `delete`.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::{Error, Result};

/// Trait for result storage
///
/// Implementations:
/// - `LocalObjectStore`: local filesystem with signed download links
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes and return their key
    async fn put(&self, data: &[u8], content_type: &str) -> Result<String>;

    /// Read stored bytes
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Remove stored bytes; a missing key is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Link that allows downloading `key` until `ttl` has passed
    fn temporary_link(&self, key: &str, ttl: Duration) -> Result<String>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}

/// Filesystem object store
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: String,
    signing_secret: String,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: &str, signing_secret: &str) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            signing_secret: signing_secret.to_string(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.root, &config.public_base_url, &config.signing_secret)
    }

    /// Check a link's expiry and signature
    pub fn verify_link(&self, key: &str, expires: i64, signature: &str) -> Result<()> {
        if self.sign(key, expires) != signature {
            return Err(Error::InvalidSignature);
        }
        if chrono::Utc::now().timestamp() > expires {
            return Err(Error::LinkExpired);
        }
        Ok(())
    }

    /// MIME type of a stored key
    pub fn content_type(key: &str) -> String {
        mime_guess::from_path(key).first_or_octet_stream().to_string()
    }

    fn sign(&self, key: &str, expires: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.signing_secret.as_bytes());
        hasher.update(b"\n");
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
        hasher.update(expires.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(Error::storage(format!("invalid object key '{}'", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, data: &[u8], content_type: &str) -> Result<String> {
        let extension = mime_guess::get_mime_extensions_str(content_type)
            .and_then(|exts| exts.first())
            .copied()
            .unwrap_or("bin");
        let key = format!("results/{}.{}", Uuid::new_v4(), extension);
        let path = self.path_for(&key)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage(format!("Failed to create {}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| Error::storage(format!("Failed to write {}: {}", key, e)))?;

        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| Error::storage(format!("Failed to read {}: {}", key, e)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage(format!("Failed to delete {}: {}", key, e))),
        }
    }

    fn temporary_link(&self, key: &str, ttl: Duration) -> Result<String> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::storage(format!("invalid link ttl: {}", e)))?;
        let expires = (chrono::Utc::now() + ttl).timestamp();
        Ok(format!(
            "{}/api/results/{}?expires={}&signature={}",
            self.public_base_url,
            key,
            expires,
            self.sign(key, expires)
        ))
    }

    fn name(&self) -> &str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_param<'a>(url: &'a str, name: &str) -> &'a str {
        url.split(['?', '&'])
            .find_map(|pair| pair.strip_prefix(&format!("{}=", name)))
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_get_and_signed_link() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "http://localhost:8080/", "secret");

        let key = store.put(b"png-bytes", "image/png").await.unwrap();
        assert!(key.starts_with("results/"));
        assert!(key.ends_with(".png"));
        assert_eq!(store.get(&key).await.unwrap(), b"png-bytes");

        let url = store.temporary_link(&key, Duration::from_secs(60)).unwrap();
        assert!(url.starts_with(&format!("http://localhost:8080/api/results/{}?", key)));

        let expires: i64 = query_param(&url, "expires").parse().unwrap();
        let signature = query_param(&url, "signature");
        assert!(store.verify_link(&key, expires, signature).is_ok());
        assert!(matches!(
            store.verify_link(&key, expires + 1, signature),
            Err(Error::InvalidSignature)
        ));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "http://localhost", "secret");

        let key = store.put(b"png-bytes", "image/png").await.unwrap();
        store.delete(&key).await.unwrap();
        assert!(!dir.path().join(&key).exists());
        assert!(matches!(store.get(&key).await, Err(Error::Storage(_))));

        store.delete(&key).await.unwrap();
        assert!(matches!(store.delete("../outside.png").await, Err(Error::Storage(_))));
    }

    #[test]
    fn test_expired_link_is_rejected() {
        let store = LocalObjectStore::new("/tmp/unused", "http://localhost", "secret");
        let expires = chrono::Utc::now().timestamp() - 10;
        let signature = store.sign("results/a.png", expires);
        assert!(matches!(
            store.verify_link("results/a.png", expires, &signature),
            Err(Error::LinkExpired)
        ));
    }

    #[tokio::test]
    async fn test_path_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "http://localhost", "secret");
        assert!(matches!(store.get("../etc/passwd").await, Err(Error::Storage(_))));
        assert!(matches!(store.get("/etc/passwd").await, Err(Error::Storage(_))));
    }
}
