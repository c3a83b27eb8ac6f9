//! Offload worker: drains the image-delivery queue, fetching each image and uploading it as a photo.

use crate::channels::{photo_file_name, ChatApi, ChatError, TelegramClient, TextFormat};
use crate::config::{self, Config, OffloadConfig};
use crate::gateway::shutdown_signal;
use crate::init;
use crate::queue::{ClaimedJob, QueueError, SpoolQueue};
use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("fetch failed: {0}")]
    Fetch(reqwest::Error),
    #[error("fetch returned status {0}")]
    Status(u16),
    #[error("image exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("upload failed: {0}")]
    Upload(#[from] ChatError),
}

// Provider-hosted image URLs may carry signed query parameters.
impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        DeliveryError::Fetch(e.without_url())
    }
}

/// Retrieves image bytes for a job.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, DeliveryError>;
}

/// HTTP GET with a timeout and a size bound.
pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_bytes: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("worker: client builder failed ({}), using defaults", e);
                reqwest::Client::new()
            });
        Self { client, max_bytes }
    }

    pub fn from_config(config: &OffloadConfig) -> Self {
        Self::new(
            Duration::from_secs(config.fetch_timeout_secs.max(1)),
            config.max_image_bytes,
        )
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, DeliveryError> {
        let res = self.client.get(url).send().await?;
        if !res.status().is_success() {
            return Err(DeliveryError::Status(res.status().as_u16()));
        }
        if let Some(len) = res.content_length() {
            if exceeds_limit(len, self.max_bytes) {
                return Err(DeliveryError::TooLarge {
                    limit: self.max_bytes,
                });
            }
        }
        let mut body = Vec::new();
        let mut stream = res.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if body.len() + chunk.len() > self.max_bytes {
                return Err(DeliveryError::TooLarge {
                    limit: self.max_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

/// Declared body length against the byte bound; lengths beyond `usize` always exceed it.
fn exceeds_limit(len: u64, max_bytes: usize) -> bool {
    usize::try_from(len).map_or(true, |n| n > max_bytes)
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub poll_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &OffloadConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            poll_interval: config.poll_interval(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&OffloadConfig::default())
    }
}

pub struct OffloadWorker {
    queue: SpoolQueue,
    chat: Arc<dyn ChatApi>,
    fetcher: Arc<dyn ArtifactFetcher>,
    settings: WorkerSettings,
}

impl OffloadWorker {
    pub fn new(
        queue: SpoolQueue,
        chat: Arc<dyn ChatApi>,
        fetcher: Arc<dyn ArtifactFetcher>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            chat,
            fetcher,
            settings,
        }
    }

    async fn deliver(&self, claimed: &ClaimedJob) -> Result<(), DeliveryError> {
        let job = &claimed.job;
        let bytes = self.fetcher.fetch(&job.image_url).await?;
        let file_name = photo_file_name(&job.image_url);
        self.chat.send_photo(&job.chat_id, &file_name, bytes).await?;
        Ok(())
    }

    /// Claim and process one batch. Returns the number of jobs handled.
    ///
    /// Every claimed job is acked, delivered or not; failures are reported to the chat instead.
    pub async fn drain_once(&self) -> Result<usize, QueueError> {
        let batch = self.queue.claim(self.settings.batch_size).await?;
        for claimed in &batch {
            let job = &claimed.job;
            if job.image_url.is_empty() {
                log::warn!("worker: job {} has no image url, skipping", claimed.id);
            } else if let Err(e) = self.deliver(claimed).await {
                log::warn!("worker: delivering {} failed: {}", job.image_url, e);
                let notice = format!("Error while sending image: {}", e);
                if let Err(e) = self
                    .chat
                    .send_message(&job.chat_id, &notice, TextFormat::Plain)
                    .await
                {
                    log::warn!("worker: failure notice to {} failed: {}", job.chat_id, e);
                }
            }
            // A failed ack leaves the job in flight under this worker; it is redelivered once the
            // worker exits. The rest of the batch still proceeds.
            if let Err(e) = self.queue.ack(&claimed.id).await {
                log::warn!("worker: ack {} failed: {}", claimed.id, e);
            }
        }
        Ok(batch.len())
    }

    /// Run until `shutdown` flips to true. In-flight jobs left by workers that are gone are
    /// recovered first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        self.queue.recover().await?;
        log::info!(
            "worker: draining {} (batch {}, poll {:?})",
            self.queue.dir().display(),
            self.settings.batch_size,
            self.settings.poll_interval
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let handled = match self.drain_once().await {
                Ok(n) => n,
                Err(e) => {
                    log::error!("worker: queue error: {}", e);
                    0
                }
            };
            if handled > 0 {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        log::info!("worker: stopped");
        Ok(())
    }
}

/// Standalone worker process (`gpt-talk worker`). With `once`, drains a single batch and returns.
pub async fn run_worker(config: Config, config_path: PathBuf, once: bool) -> anyhow::Result<()> {
    init::require_initialized(&config_path, &config)?;
    let queue_dir = config::resolve_queue_dir(&config, &config_path);
    let queue = SpoolQueue::open(&queue_dir)
        .await
        .with_context(|| format!("opening offload queue {}", queue_dir.display()))?;
    let worker = OffloadWorker::new(
        queue,
        Arc::new(TelegramClient::from_config(&config)),
        Arc::new(HttpFetcher::from_config(&config.offload)),
        WorkerSettings::from_config(&config.offload),
    );
    if once {
        worker.queue.recover().await?;
        let n = worker.drain_once().await?;
        log::info!("worker: processed {} job(s)", n);
        return Ok(());
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        log::info!("shutdown signal received, stopping worker");
        let _ = stop_tx.send(true);
    });
    worker.run(stop_rx).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{OffloadJob, OffloadQueue};
    use std::sync::Mutex;

    fn temp_dir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("gpt-talk-worker-test-{}", uuid::Uuid::new_v4()))
    }

    #[derive(Default)]
    struct FakeChat {
        photos: Mutex<Vec<(String, String, usize)>>,
        messages: Mutex<Vec<(String, String)>>,
        fail_upload: bool,
    }

    #[async_trait]
    impl ChatApi for FakeChat {
        async fn send_message(
            &self,
            chat_id: &str,
            text: &str,
            _format: TextFormat,
        ) -> Result<(), ChatError> {
            self.messages
                .lock()
                .unwrap()
                .push((chat_id.to_string(), text.to_string()));
            Ok(())
        }

        async fn send_photo(
            &self,
            chat_id: &str,
            file_name: &str,
            bytes: Vec<u8>,
        ) -> Result<(), ChatError> {
            if self.fail_upload {
                return Err(ChatError::Api("sendPhoto failed: 400".to_string()));
            }
            self.photos.lock().unwrap().push((
                chat_id.to_string(),
                file_name.to_string(),
                bytes.len(),
            ));
            Ok(())
        }

        async fn answer_callback(&self, _callback_id: &str) -> Result<(), ChatError> {
            Ok(())
        }
    }

    /// Serves fixed bytes, except for URLs containing "missing".
    struct FakeFetcher;

    #[async_trait]
    impl ArtifactFetcher for FakeFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, DeliveryError> {
            if url.contains("missing") {
                return Err(DeliveryError::Status(404));
            }
            Ok(vec![0u8; 16])
        }
    }

    async fn worker_with(chat: Arc<FakeChat>) -> (OffloadWorker, SpoolQueue) {
        let queue = SpoolQueue::open(temp_dir()).await.unwrap();
        let worker = OffloadWorker::new(
            queue.clone(),
            chat,
            Arc::new(FakeFetcher),
            WorkerSettings {
                batch_size: 10,
                poll_interval: Duration::from_millis(10),
            },
        );
        (worker, queue)
    }

    fn job(url: &str) -> OffloadJob {
        OffloadJob {
            chat_id: "7".to_string(),
            image_url: url.to_string(),
        }
    }

    #[tokio::test]
    async fn drain_uploads_each_image() {
        let chat = Arc::new(FakeChat::default());
        let (worker, queue) = worker_with(chat.clone()).await;
        queue.publish(&job("https://img.example/1.png")).await.unwrap();
        queue.publish(&job("https://img.example/2.png")).await.unwrap();

        assert_eq!(worker.drain_once().await.unwrap(), 2);
        let photos = chat.photos.lock().unwrap().clone();
        assert_eq!(photos.len(), 2);
        assert!(photos.iter().all(|(c, _, n)| c == "7" && *n == 16));
        assert_eq!(worker.drain_once().await.unwrap(), 0);
        assert_eq!(queue.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fetch_failure_notifies_chat_and_acks() {
        let chat = Arc::new(FakeChat::default());
        let (worker, queue) = worker_with(chat.clone()).await;
        queue.publish(&job("https://img.example/missing.png")).await.unwrap();

        assert_eq!(worker.drain_once().await.unwrap(), 1);
        let messages = chat.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.starts_with("Error while sending image:"));
        assert!(chat.photos.lock().unwrap().is_empty());
        assert_eq!(queue.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn upload_failure_notifies_chat() {
        let chat = Arc::new(FakeChat {
            fail_upload: true,
            ..Default::default()
        });
        let (worker, queue) = worker_with(chat.clone()).await;
        queue.publish(&job("https://img.example/1.png")).await.unwrap();
        worker.drain_once().await.unwrap();
        let messages = chat.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.contains("sendPhoto failed"));
    }

    #[tokio::test]
    async fn empty_url_is_skipped_silently() {
        let chat = Arc::new(FakeChat::default());
        let (worker, queue) = worker_with(chat.clone()).await;
        queue.publish(&job("")).await.unwrap();
        assert_eq!(worker.drain_once().await.unwrap(), 1);
        assert!(chat.photos.lock().unwrap().is_empty());
        assert!(chat.messages.lock().unwrap().is_empty());
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_recovers_inflight_and_stops_on_signal() {
        let chat = Arc::new(FakeChat::default());
        let (worker, queue) = worker_with(chat.clone()).await;
        // A worker that claimed the job and then went away.
        let crashed = SpoolQueue::open(queue.dir()).await.unwrap();
        crashed.publish(&job("https://img.example/1.png")).await.unwrap();
        assert_eq!(crashed.claim(1).await.unwrap().len(), 1);
        drop(crashed);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });
        for _ in 0..100 {
            if !chat.photos.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(chat.photos.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_worker_does_not_take_jobs_in_flight() {
        let chat = Arc::new(FakeChat::default());
        let (worker, queue) = worker_with(chat.clone()).await;
        let other = SpoolQueue::open(queue.dir()).await.unwrap();
        other.publish(&job("https://img.example/1.png")).await.unwrap();
        let held = other.claim(1).await.unwrap();
        assert_eq!(held.len(), 1);

        worker.queue.recover().await.unwrap();
        assert_eq!(worker.drain_once().await.unwrap(), 0);
        assert!(chat.photos.lock().unwrap().is_empty());
        other.ack(&held[0].id).await.unwrap();
    }

    /// Uploads through a real Telegram client; failure notices are recorded locally.
    struct UnreachableTelegram {
        upload: TelegramClient,
        notices: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatApi for UnreachableTelegram {
        async fn send_message(
            &self,
            _chat_id: &str,
            text: &str,
            _format: TextFormat,
        ) -> Result<(), ChatError> {
            self.notices.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn send_photo(
            &self,
            chat_id: &str,
            file_name: &str,
            bytes: Vec<u8>,
        ) -> Result<(), ChatError> {
            self.upload.send_photo(chat_id, file_name, bytes).await
        }

        async fn answer_callback(&self, _callback_id: &str) -> Result<(), ChatError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn upload_transport_failure_does_not_leak_bot_token() {
        let token = "123456:SECRET-BOT-TOKEN";
        let chat = Arc::new(UnreachableTelegram {
            upload: TelegramClient::new(
                Some(token.to_string()),
                Some("http://127.0.0.1:1".to_string()),
                Some(Duration::from_secs(2)),
            ),
            notices: Mutex::new(Vec::new()),
        });
        let queue = SpoolQueue::open(temp_dir()).await.unwrap();
        let worker = OffloadWorker::new(
            queue.clone(),
            chat.clone(),
            Arc::new(FakeFetcher),
            WorkerSettings::default(),
        );
        queue.publish(&job("https://img.example/1.png")).await.unwrap();

        assert_eq!(worker.drain_once().await.unwrap(), 1);
        let notices = chat.notices.lock().unwrap().clone();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].starts_with("Error while sending image:"));
        assert!(!notices[0].contains("SECRET-BOT-TOKEN"), "{}", notices[0]);
    }

    #[test]
    fn declared_length_limit() {
        assert!(!exceeds_limit(10, 10));
        assert!(exceeds_limit(11, 10));
        assert!(exceeds_limit(u64::MAX, usize::MAX - 1));
    }
}
