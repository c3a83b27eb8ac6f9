//! Offload queue: image-delivery jobs handed from the request path to the worker.
//!
//! [`SpoolQueue`] is a durable at-least-once spool on the local filesystem:
//!
//! ```text
//! <dir>/tmp/                jobs being written (renamed into pending/ when complete)
//! <dir>/pending/            published, not yet claimed
//! <dir>/inflight/<owner>/   claimed by one queue handle, removed on ack
//! <dir>/inflight/<owner>.lock  held (fs2) for as long as that handle lives
//! <dir>/.lock               fs2 lock serialising claims across worker processes
//! ```
//!
//! [`SpoolQueue::recover`] only returns jobs whose owner lock is free, so a live worker's
//! in-flight jobs are never handed to another worker.

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One image to deliver to a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OffloadJob {
    pub chat_id: String,
    pub image_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("queue encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("queue task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Publish side of the queue, as seen by the dispatcher.
#[async_trait]
pub trait OffloadQueue: Send + Sync {
    async fn publish(&self, job: &OffloadJob) -> Result<(), QueueError>;
}

/// A claimed job. `id` is the spool file name, passed back to [`SpoolQueue::ack`].
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: String,
    pub job: OffloadJob,
}

/// Ownership of one `inflight/<owner>/` directory. The fs2 lock is released on drop
/// (or by the OS when the process dies), which makes the directory recoverable.
#[derive(Debug)]
struct OwnerLease {
    dir: PathBuf,
    lock_path: PathBuf,
    file: std::fs::File,
}

impl OwnerLease {
    fn acquire(inflight: &Path) -> std::io::Result<Self> {
        let owner = uuid::Uuid::new_v4().to_string();
        let dir = inflight.join(&owner);
        let lock_path = inflight.join(format!("{}.lock", owner));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        file.lock_exclusive()?;
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock_path,
            file,
        })
    }
}

impl Drop for OwnerLease {
    fn drop(&mut self) {
        // Only an empty directory is removed; unacked jobs stay for recover().
        if std::fs::remove_dir(&self.dir).is_ok() {
            let _ = std::fs::remove_file(&self.lock_path);
        }
        let _ = self.file.unlock();
    }
}

/// Handle on a spool directory. Clones share one in-flight lease.
#[derive(Debug, Clone)]
pub struct SpoolQueue {
    dir: PathBuf,
    lease: Arc<OwnerLease>,
}

impl SpoolQueue {
    /// Open the spool, creating its directories if needed, and take a fresh in-flight lease.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, QueueError> {
        let dir = dir.as_ref().to_path_buf();
        for sub in ["tmp", "pending", "inflight"] {
            tokio::fs::create_dir_all(dir.join(sub)).await?;
        }
        let inflight = dir.join("inflight");
        let lease = tokio::task::spawn_blocking(move || OwnerLease::acquire(&inflight)).await??;
        Ok(Self {
            dir,
            lease: Arc::new(lease),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn pending_dir(&self) -> PathBuf {
        self.dir.join("pending")
    }

    fn owned_dir(&self) -> PathBuf {
        self.lease.dir.clone()
    }

    /// Number of published, unclaimed jobs.
    pub async fn len(&self) -> Result<usize, QueueError> {
        let dir = self.pending_dir();
        let names = tokio::task::spawn_blocking(move || sorted_json_names(&dir)).await??;
        Ok(names.len())
    }

    /// Move up to `max` oldest pending jobs into this handle's in-flight directory and return them.
    ///
    /// Files that do not parse as a job are discarded with a warning. Files that cannot be read
    /// are returned to pending; the rest of the batch is still delivered.
    pub async fn claim(&self, max: usize) -> Result<Vec<ClaimedJob>, QueueError> {
        let dir = self.dir.clone();
        let owned = self.owned_dir();
        let max = max.max(1);
        let claimed =
            tokio::task::spawn_blocking(move || claim_blocking(&dir, &owned, max)).await??;

        let mut jobs = Vec::with_capacity(claimed.len());
        for id in claimed {
            let path = self.owned_dir().join(&id);
            let raw = match tokio::fs::read(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    log::warn!("queue: reading job {} failed, returning it: {}", id, e);
                    if let Err(e) = tokio::fs::rename(&path, self.pending_dir().join(&id)).await {
                        log::warn!("queue: returning job {} to pending failed: {}", id, e);
                    }
                    continue;
                }
            };
            match serde_json::from_slice::<OffloadJob>(&raw) {
                Ok(job) => jobs.push(ClaimedJob { id, job }),
                Err(e) => {
                    log::warn!("queue: dropping malformed job {}: {}", id, e);
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        log::warn!("queue: removing malformed job {} failed: {}", id, e);
                    }
                }
            }
        }
        Ok(jobs)
    }

    /// Acknowledge a claimed job; it is removed from the spool.
    pub async fn ack(&self, id: &str) -> Result<(), QueueError> {
        match tokio::fs::remove_file(self.owned_dir().join(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Return in-flight jobs of dead owners to pending. Jobs held by a live handle
    /// (this one included) are left alone.
    pub async fn recover(&self) -> Result<usize, QueueError> {
        let dir = self.dir.clone();
        let own = self.owned_dir();
        let n = tokio::task::spawn_blocking(move || recover_blocking(&dir, &own)).await??;
        if n > 0 {
            log::info!("queue: returned {} in-flight job(s) to pending", n);
        }
        Ok(n)
    }
}

#[async_trait]
impl OffloadQueue for SpoolQueue {
    async fn publish(&self, job: &OffloadJob) -> Result<(), QueueError> {
        let body = serde_json::to_vec(job)?;
        // Millisecond prefix keeps claims roughly in publish order.
        let name = format!(
            "{:013}-{}.json",
            chrono::Utc::now().timestamp_millis(),
            uuid::Uuid::new_v4()
        );
        let tmp = self.dir.join("tmp").join(&name);
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, self.pending_dir().join(&name)).await?;
        log::debug!("queue: published {} for chat {}", name, job.chat_id);
        Ok(())
    }
}

/// Exclusive lock on `<dir>/.lock`, released on drop.
struct SpoolLock {
    file: std::fs::File,
}

impl SpoolLock {
    fn acquire(dir: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(".lock"))?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for SpoolLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn sorted_json_names(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(".json"))
        .collect();
    names.sort();
    Ok(names)
}

fn claim_blocking(dir: &Path, owned: &Path, max: usize) -> Result<Vec<String>, QueueError> {
    let _lock = SpoolLock::acquire(dir)?;
    let pending = dir.join("pending");
    let mut claimed = Vec::new();
    for name in sorted_json_names(&pending)?.into_iter().take(max) {
        match std::fs::rename(pending.join(&name), owned.join(&name)) {
            Ok(()) => claimed.push(name),
            // Another process without the lock (e.g. a manual cleanup) removed it.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(claimed)
}

/// Move `names` from `from` into pending. Returns how many were moved.
fn return_to_pending(dir: &Path, from: &Path, names: &[String]) -> std::io::Result<usize> {
    let pending = dir.join("pending");
    let mut moved = 0;
    for name in names {
        match std::fs::rename(from.join(name), pending.join(name)) {
            Ok(()) => moved += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(moved)
}

fn recover_blocking(dir: &Path, own: &Path) -> Result<usize, QueueError> {
    let _lock = SpoolLock::acquire(dir)?;
    let inflight = dir.join("inflight");
    // Jobs claimed before in-flight directories were per-owner.
    let mut recovered = return_to_pending(dir, &inflight, &sorted_json_names(&inflight)?)?;

    let owners: Vec<PathBuf> = std::fs::read_dir(&inflight)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() && path.as_path() != own)
        .collect();
    for owner_dir in owners {
        let lock_path = owner_dir.with_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                continue;
            }
            return Err(e.into());
        }
        let names = match sorted_json_names(&owner_dir) {
            Ok(names) => names,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        recovered += return_to_pending(dir, &owner_dir, &names)?;
        let _ = std::fs::remove_dir(&owner_dir);
        let _ = std::fs::remove_file(&lock_path);
        let _ = file.unlock();
    }
    Ok(recovered)
}
