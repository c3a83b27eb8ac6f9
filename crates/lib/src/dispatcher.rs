//! Webhook dispatcher: authenticate, deduplicate, classify, invoke the provider, reply or offload.
//!
//! One call to [`Dispatcher::handle_webhook`] walks a single update through
//! `Received → Authenticated → Deduplicated → Classified → Invoked → Replied | Offloaded | Failed`.
//! Steps are strictly sequential; the dispatcher keeps no per-event state between calls.

use crate::channels::{ChatApi, InboundEvent, TelegramUpdate, TextFormat};
use crate::command::{self, Command};
use crate::config::{self, Config};
use crate::llm::{Completion, ProviderError, ResponseProvider};
use crate::queue::{OffloadJob, OffloadQueue};
use crate::store::{IdempotencyStore, StoreError};
use axum::http::StatusCode;
use std::fmt;
use std::sync::Arc;

/// Header carrying the webhook shared secret.
pub const WEBHOOK_SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

pub const PROVIDER_FAILURE_NOTICE: &str = "Something went wrong while talking to the provider.";
pub const NO_COMPLETION_NOTICE: &str = "No Chat GPT response";
pub const NO_IMAGES_NOTICE: &str = "No images were created";

/// Dispatcher settings, taken from [`Config`] once at startup.
#[derive(Debug, Clone, Default)]
pub struct DispatcherSettings {
    /// Expected webhook secret. None accepts every request (loopback-only deployments).
    pub webhook_secret: Option<String>,
    /// Reply generated images as URL text instead of queueing photo uploads.
    pub send_image_by_url: bool,
}

impl DispatcherSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            webhook_secret: config::resolve_webhook_secret(config),
            send_image_by_url: config.offload.send_image_by_url,
        }
    }
}

/// Processing stage of one update (logged on each transition).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Authenticated,
    Deduplicated,
    Classified,
    Invoked,
    Replied,
    Offloaded,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Received => "received",
            Stage::Authenticated => "authenticated",
            Stage::Deduplicated => "deduplicated",
            Stage::Classified => "classified",
            Stage::Invoked => "invoked",
            Stage::Replied => "replied",
            Stage::Offloaded => "offloaded",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Successful end states of a webhook delivery. All map to 200.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The update id was already processed; nothing was done.
    Duplicate,
    /// Nothing to answer (no chat to reply to, or no text).
    Ignored,
    /// Text replies sent inline.
    Replied { messages: usize },
    /// Image results: URLs replied inline, jobs queued, and per-image publish failures.
    Images {
        inline: usize,
        offloaded: usize,
        failed: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("malformed update: {0}")]
    MalformedUpdate(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("{0}")]
    NoResult(&'static str),
}

impl DispatchError {
    /// HTTP status reported to the webhook caller.
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::Unauthorized => StatusCode::UNAUTHORIZED,
            DispatchError::NoResult(_) => StatusCode::NOT_FOUND,
            DispatchError::MalformedUpdate(_)
            | DispatchError::Store(_)
            | DispatchError::Provider(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// How one generated image reaches the chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageDelivery {
    /// Reply with the URL as text.
    Inline(String),
    /// Queue a photo upload for the worker.
    Offload(String),
}

/// Delivery plan for generated images: a function of configuration and the artifacts only.
pub fn plan_deliveries(send_image_by_url: bool, urls: &[String]) -> Vec<ImageDelivery> {
    urls.iter()
        .map(|u| {
            if send_image_by_url {
                ImageDelivery::Inline(u.clone())
            } else {
                ImageDelivery::Offload(u.clone())
            }
        })
        .collect()
}

/// Compare secrets without short-circuiting on the first differing byte.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let len_diff = a.len() ^ b.len();
    let mut byte_diff = 0u8;
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        byte_diff |= x ^ y;
    }
    len_diff == 0 && byte_diff == 0
}

pub struct Dispatcher {
    settings: DispatcherSettings,
    store: Arc<dyn IdempotencyStore>,
    provider: Arc<dyn ResponseProvider>,
    queue: Arc<dyn OffloadQueue>,
    chat: Arc<dyn ChatApi>,
}

impl Dispatcher {
    pub fn new(
        settings: DispatcherSettings,
        store: Arc<dyn IdempotencyStore>,
        provider: Arc<dyn ResponseProvider>,
        queue: Arc<dyn OffloadQueue>,
        chat: Arc<dyn ChatApi>,
    ) -> Self {
        Self {
            settings,
            store,
            provider,
            queue,
            chat,
        }
    }

    fn authenticate(&self, provided: Option<&str>) -> Result<(), DispatchError> {
        match self.settings.webhook_secret.as_deref() {
            None => Ok(()),
            Some(expected) => match provided {
                Some(p) if constant_time_eq(p, expected) => Ok(()),
                _ => Err(DispatchError::Unauthorized),
            },
        }
    }

    /// Send a reply; failures are logged, never propagated.
    async fn reply(&self, chat_id: &str, text: &str, format: TextFormat) {
        if let Err(e) = self.chat.send_message(chat_id, text, format).await {
            log::warn!("dispatch: send_message to {} failed: {}", chat_id, e);
        }
    }

    /// Process one webhook delivery.
    ///
    /// `provided_secret` is the value of [`WEBHOOK_SECRET_HEADER`]; `body` is the raw update JSON.
    pub async fn handle_webhook(
        &self,
        provided_secret: Option<&str>,
        body: &[u8],
    ) -> Result<DispatchOutcome, DispatchError> {
        if let Err(e) = self.authenticate(provided_secret) {
            log::warn!("dispatch: {} (bad or missing webhook secret)", Stage::Failed);
            return Err(e);
        }
        let update: TelegramUpdate = serde_json::from_slice(body)?;
        let event = InboundEvent::from(update);
        log::debug!("dispatch: update {} {}", event.update_id, Stage::Authenticated);

        let key = event.dedup_key();
        if !self.store.claim(&key).await? {
            log::info!("dispatch: update {} already processed, skipping", key);
            return Ok(DispatchOutcome::Duplicate);
        }
        log::debug!("dispatch: update {} {}", key, Stage::Deduplicated);

        if let Some(ref callback_id) = event.callback_id {
            if let Err(e) = self.chat.answer_callback(callback_id).await {
                log::warn!("dispatch: answer_callback {} failed: {}", callback_id, e);
            }
        }
        let Some(chat_id) = event.chat_id.clone() else {
            log::debug!("dispatch: update {} has no chat, ignoring", key);
            return Ok(DispatchOutcome::Ignored);
        };
        if event.raw_text.trim().is_empty() {
            log::debug!("dispatch: update {} has no text, ignoring", key);
            return Ok(DispatchOutcome::Ignored);
        }

        let command = command::classify(&event.raw_text);
        log::debug!(
            "dispatch: update {} {} as {}",
            key,
            Stage::Classified,
            command.tag()
        );
        if let Some(usage) = command.missing_argument_usage() {
            log::info!("dispatch: update {} {} without argument", key, command.tag());
            self.reply(&chat_id, usage, TextFormat::Plain).await;
            return Ok(DispatchOutcome::Ignored);
        }

        let result = match command {
            Command::CreateImage { prompt } => self.create_images(&chat_id, &prompt).await,
            Command::Edit { instruction, text } => {
                let res = self.provider.revise_with_instruction(&instruction, &text).await;
                self.reply_completion(&chat_id, res).await
            }
            Command::Talk { text } => {
                let res = self.provider.converse(&text).await;
                self.reply_completion(&chat_id, res).await
            }
            Command::None => {
                let res = self.provider.converse(&event.raw_text).await;
                self.reply_completion(&chat_id, res).await
            }
        };
        match &result {
            Ok(DispatchOutcome::Images { offloaded, .. }) if *offloaded > 0 => {
                log::info!("dispatch: update {} {} ({} job(s))", key, Stage::Offloaded, offloaded)
            }
            Ok(_) => log::info!("dispatch: update {} {}", key, Stage::Replied),
            Err(e) => log::warn!("dispatch: update {} {}: {}", key, Stage::Failed, e),
        }
        result
    }

    /// Turn a provider completion into chat replies (one HTML message per choice).
    async fn reply_completion(
        &self,
        chat_id: &str,
        res: Result<Completion, ProviderError>,
    ) -> Result<DispatchOutcome, DispatchError> {
        log::debug!("dispatch: chat {} {}", chat_id, Stage::Invoked);
        let completion = match res {
            Ok(c) => c,
            Err(e) => {
                self.reply(chat_id, PROVIDER_FAILURE_NOTICE, TextFormat::Plain)
                    .await;
                return Err(e.into());
            }
        };
        if completion.choices.is_empty() {
            self.reply(chat_id, NO_COMPLETION_NOTICE, TextFormat::Plain)
                .await;
            return Err(DispatchError::NoResult(NO_COMPLETION_NOTICE));
        }
        for choice in &completion.choices {
            self.reply(chat_id, choice, TextFormat::Html).await;
        }
        Ok(DispatchOutcome::Replied {
            messages: completion.choices.len(),
        })
    }

    /// Generate images and deliver each inline or through the offload queue.
    async fn create_images(
        &self,
        chat_id: &str,
        prompt: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        let images = match self.provider.generate_images(prompt).await {
            Ok(images) => images,
            Err(e) => {
                self.reply(chat_id, PROVIDER_FAILURE_NOTICE, TextFormat::Plain)
                    .await;
                return Err(e.into());
            }
        };
        log::debug!("dispatch: chat {} {}", chat_id, Stage::Invoked);
        if images.urls.is_empty() {
            self.reply(chat_id, NO_IMAGES_NOTICE, TextFormat::Plain).await;
            return Err(DispatchError::NoResult(NO_IMAGES_NOTICE));
        }

        self.reply(
            chat_id,
            &format!("Number of generated images: {}", images.urls.len()),
            TextFormat::Html,
        )
        .await;

        let (mut inline, mut offloaded, mut failed) = (0, 0, 0);
        for delivery in plan_deliveries(self.settings.send_image_by_url, &images.urls) {
            match delivery {
                ImageDelivery::Inline(url) => {
                    self.reply(chat_id, &format!("Image url: {}", url), TextFormat::Html)
                        .await;
                    inline += 1;
                }
                ImageDelivery::Offload(url) => {
                    let job = OffloadJob {
                        chat_id: chat_id.to_string(),
                        image_url: url,
                    };
                    match self.queue.publish(&job).await {
                        Ok(()) => offloaded += 1,
                        Err(e) => {
                            log::warn!("dispatch: publishing {} failed: {}", job.image_url, e);
                            self.reply(
                                chat_id,
                                &format!("Error while sending image: {}", e),
                                TextFormat::Plain,
                            )
                            .await;
                            failed += 1;
                        }
                    }
                }
            }
        }
        Ok(DispatchOutcome::Images {
            inline,
            offloaded,
            failed,
        })
    }

    /// Direct completion for `POST /gpt`: the first choice's text.
    pub async fn complete(&self, message: &str) -> Result<String, DispatchError> {
        let completion = self.provider.converse(message).await?;
        completion
            .choices
            .into_iter()
            .next()
            .ok_or(DispatchError::NoResult(NO_COMPLETION_NOTICE))
    }
}
