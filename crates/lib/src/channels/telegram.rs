//! Telegram Bot API: webhook update payloads and the outbound client (sendMessage, sendPhoto, ...).

use crate::channels::{ChatApi, ChatError, TextFormat};
use crate::config::{self, Config};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Telegram update payload (webhook POST body).
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    #[serde(default)]
    pub chat: Option<TelegramChat>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramCallbackQuery {
    pub id: String,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub data: Option<String>,
}

/// Bot API client. Every call is bounded by the client timeout.
#[derive(Clone)]
pub struct TelegramClient {
    token: Option<String>,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramClient {
    pub fn new(token: Option<String>, api_base: Option<String>, timeout: Option<Duration>) -> Self {
        let api_base = api_base
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| TELEGRAM_API_BASE.to_string());
        let client = reqwest::Client::builder()
            .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()
            .unwrap_or_else(|e| {
                log::warn!("telegram: client builder failed ({}), using defaults", e);
                reqwest::Client::new()
            });
        Self {
            token,
            api_base,
            client,
        }
    }

    /// Build from config; the bot token honours the TELEGRAM_BOT_TOKEN override.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config::resolve_telegram_token(config),
            Some(config.telegram.api_base.clone()),
            Some(Duration::from_secs(config.telegram.timeout_secs.max(1))),
        )
    }

    fn method_url(&self, method: &str) -> Result<String, ChatError> {
        let token = self
            .token
            .as_ref()
            .ok_or(ChatError::NotConfigured("telegram bot token"))?;
        Ok(format!("{}/bot{}/{}", self.api_base, token, method))
    }

    async fn check(res: reqwest::Response, method: &str) -> Result<(), ChatError> {
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ChatError::Api(format!("{} failed: {} {}", method, status, body)));
        }
        Ok(())
    }

    /// GET a Bot API method with query parameters.
    async fn call(&self, method: &str, params: &[(&str, &str)]) -> Result<(), ChatError> {
        let url = self.method_url(method)?;
        let res = self.client.get(&url).query(params).send().await?;
        Self::check(res, method).await
    }

    /// Register the webhook URL and the secret Telegram will echo in X-Telegram-Bot-Api-Secret-Token.
    pub async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<(), ChatError> {
        let mut params = vec![("url", url)];
        if let Some(s) = secret {
            params.push(("secret_token", s));
        }
        self.call("setWebhook", &params).await
    }

    /// Remove the webhook registration.
    pub async fn delete_webhook(&self) -> Result<(), ChatError> {
        self.call("deleteWebhook", &[]).await
    }
}

#[async_trait]
impl ChatApi for TelegramClient {
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        format: TextFormat,
    ) -> Result<(), ChatError> {
        let mut params = vec![("chat_id", chat_id), ("text", text)];
        if format == TextFormat::Html {
            params.push(("parse_mode", "html"));
        }
        self.call("sendMessage", &params).await
    }

    async fn send_photo(
        &self,
        chat_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), ChatError> {
        let url = self.method_url("sendPhoto")?;
        let part = Part::bytes(bytes).file_name(file_name.to_string());
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part("photo", part);
        let res = self.client.post(&url).multipart(form).send().await?;
        Self::check(res, "sendPhoto").await?;
        log::info!("telegram: photo sent to {}: {}", chat_id, file_name);
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), ChatError> {
        self.call("answerCallbackQuery", &[("callback_query_id", callback_id)])
            .await
    }
}

/// Upload file name for an image URL: last path segment, or `image.png`.
pub fn photo_file_name(image_url: &str) -> String {
    let path = image_url.split(['?', '#']).next().unwrap_or("");
    let after_scheme = path.split_once("://").map(|(_, rest)| rest).unwrap_or(path);
    match after_scheme.split_once('/') {
        Some((_, p)) => p
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| "image.png".to_string()),
        None => "image.png".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::InboundEvent;

    fn parse(body: &str) -> InboundEvent {
        serde_json::from_str::<TelegramUpdate>(body).unwrap().into()
    }

    #[test]
    fn message_update_becomes_event() {
        let ev = parse(r#"{"update_id":42,"message":{"text":"/createimage a cat","chat":{"id":7}}}"#);
        assert_eq!(ev.update_id, 42);
        assert_eq!(ev.dedup_key(), "42");
        assert_eq!(ev.chat_id.as_deref(), Some("7"));
        assert_eq!(ev.raw_text, "/createimage a cat");
        assert_eq!(ev.callback_id, None);
    }

    #[test]
    fn callback_update_uses_callback_chat_and_data() {
        let ev = parse(
            r#"{"update_id":5,"callback_query":{"id":"cb-1","data":"/talk again","message":{"chat":{"id":-100}}}}"#,
        );
        assert_eq!(ev.chat_id.as_deref(), Some("-100"));
        assert_eq!(ev.raw_text, "/talk again");
        assert_eq!(ev.callback_id.as_deref(), Some("cb-1"));
    }

    #[test]
    fn update_without_text_has_empty_raw_text() {
        let ev = parse(r#"{"update_id":9,"message":{"chat":{"id":1},"photo":[]}}"#);
        assert_eq!(ev.raw_text, "");
        let ev = parse(r#"{"update_id":10}"#);
        assert_eq!(ev.chat_id, None);
    }

    #[test]
    fn photo_file_name_from_url() {
        assert_eq!(
            photo_file_name("https://cdn.example/a/b/img-1.png?sig=abc"),
            "img-1.png"
        );
        assert_eq!(photo_file_name("https://cdn.example/"), "image.png");
        assert_eq!(photo_file_name("https://cdn.example"), "image.png");
    }

    #[tokio::test]
    async fn calls_without_token_fail_before_network() {
        let client = TelegramClient::new(None, None, None);
        let err = client
            .send_message("1", "hi", TextFormat::Plain)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn transport_errors_omit_the_tokenized_url() {
        let client = TelegramClient::new(
            Some("123456:SECRET-BOT-TOKEN".to_string()),
            Some("http://127.0.0.1:1".to_string()),
            Some(Duration::from_secs(2)),
        );
        let err = client
            .send_message("1", "hi", TextFormat::Plain)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Request(_)));
        assert!(!err.to_string().contains("SECRET-BOT-TOKEN"), "{}", err);

        let err = client.send_photo("1", "a.png", vec![1, 2, 3]).await.unwrap_err();
        assert!(!err.to_string().contains("SECRET-BOT-TOKEN"), "{}", err);
    }
}
