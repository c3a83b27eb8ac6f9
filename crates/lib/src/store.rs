//! Idempotency store: dedup markers keyed by upstream update id.
//!
//! A marker's presence is its only meaning. Creating a marker that already exists is not an error,
//! so callers can write redundantly under at-least-once delivery.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("marker store io error for key {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("marker store unavailable: {0}")]
    Unavailable(String),
}

/// Ledger of processed update ids.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Create the marker. Succeeds whether it was inserted or already present.
    async fn create(&self, key: &str) -> Result<(), StoreError>;

    /// Remove the marker (maintenance and tests). Removing an absent marker succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Create-if-absent. Returns true when this call created the marker.
    ///
    /// The default is a plain check-then-write; stores with an atomic conditional write override it
    /// so concurrent duplicates cannot both see the key as new.
    async fn claim(&self, key: &str) -> Result<bool, StoreError> {
        if self.exists(key).await? {
            return Ok(false);
        }
        self.create(key).await?;
        Ok(true)
    }
}

/// One file per marker under a directory. Exclusive create makes `claim` atomic across processes.
pub struct FileMarkerStore {
    dir: PathBuf,
}

impl FileMarkerStore {
    /// Open the store, creating the directory if needed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Keys are hashed so any string maps to a safe file name.
    fn marker_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        let name: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        self.dir.join(format!("{}.json", name))
    }

    /// Write the marker with `create_new`. Ok(false) when it already existed.
    async fn write_exclusive(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.marker_path(key);
        let io_err = |source: std::io::Error| StoreError::Io {
            key: key.to_string(),
            source,
        };
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(io_err(e)),
        };
        let record = serde_json::json!({
            "key": key,
            "createdAt": chrono::Utc::now().to_rfc3339(),
        });
        file.write_all(record.to_string().as_bytes())
            .await
            .map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(true)
    }
}

#[async_trait]
impl IdempotencyStore for FileMarkerStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        tokio::fs::try_exists(self.marker_path(key))
            .await
            .map_err(|source| StoreError::Io {
                key: key.to_string(),
                source,
            })
    }

    async fn create(&self, key: &str) -> Result<(), StoreError> {
        self.write_exclusive(key).await.map(|_| ())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.marker_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn claim(&self, key: &str) -> Result<bool, StoreError> {
        self.write_exclusive(key).await
    }
}

/// In-process marker set. Markers are lost on restart.
#[derive(Default)]
pub struct MemoryMarkerStore {
    keys: RwLock<HashSet<String>>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.keys.read().await.len()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryMarkerStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.keys.read().await.contains(key))
    }

    async fn create(&self, key: &str) -> Result<(), StoreError> {
        self.keys.write().await.insert(key.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.keys.write().await.remove(key);
        Ok(())
    }

    async fn claim(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.keys.write().await.insert(key.to_string()))
    }
}
