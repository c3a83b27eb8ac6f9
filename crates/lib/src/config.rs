//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.gpt-talk/config.json`) and environment.
//! Secrets (bot token, webhook secret, provider key) may come from env so the file can stay out of the secret store.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Telegram bot and webhook settings.
    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Generative provider (OpenAI-compatible API).
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Image offload queue and worker.
    #[serde(default)]
    pub offload: OffloadConfig,

    /// Idempotency store.
    #[serde(default)]
    pub store: StoreConfig,
}

/// Gateway bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP (default 8080).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    8080
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

/// Telegram bot config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// Shared secret Telegram sends in X-Telegram-Bot-Api-Secret-Token. Overridden by TELEGRAM_WEBHOOK_TOKEN env.
    pub webhook_secret: Option<String>,
    /// Public URL registered with setWebhook on `serve` (optional; `set-webhook` can do it once instead).
    pub webhook_url: Option<String>,
    /// Bot API base URL (default https://api.telegram.org).
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
    /// Per-call timeout for Bot API requests.
    #[serde(default = "default_telegram_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_telegram_timeout_secs() -> u64 {
    10
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            webhook_secret: None,
            webhook_url: None,
            api_base: default_telegram_api_base(),
            timeout_secs: default_telegram_timeout_secs(),
        }
    }
}

/// Provider config: model names, generation parameters and timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// API key. Overridden by GPT_API_KEY env when set.
    pub api_key: Option<String>,
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_edit_model")]
    pub edit_model: String,
    /// Images requested per /createimage.
    #[serde(default = "default_image_count")]
    pub image_count: u32,
    #[serde(default = "default_image_size")]
    pub image_size: String,
    /// Absolute per-call timeout. Generation is slow, so this is minutes rather than seconds.
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_chat_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_edit_model() -> String {
    "text-davinci-edit-001".to_string()
}

fn default_image_count() -> u32 {
    2
}

fn default_image_size() -> String {
    "1024x1024".to_string()
}

fn default_provider_timeout_secs() -> u64 {
    300
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_provider_base_url(),
            chat_model: default_chat_model(),
            edit_model: default_edit_model(),
            image_count: default_image_count(),
            image_size: default_image_size(),
            timeout_secs: default_provider_timeout_secs(),
        }
    }
}

/// Offload queue and worker config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OffloadConfig {
    /// When true, generated images are replied as URL text and nothing is queued.
    #[serde(default)]
    pub send_image_by_url: bool,
    /// Spool directory. Relative paths are resolved against the config file's parent. Default: `queue`.
    pub queue_dir: Option<PathBuf>,
    /// Jobs claimed per drain. Small batches limit the damage one bad job can do.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Idle sleep between drains when the queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Timeout for downloading an image before upload.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Images larger than this are refused instead of uploaded.
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,
    /// Run the worker inside the `serve` process. Set false when running `gpt-talk worker` separately.
    #[serde(default = "default_embedded_worker")]
    pub embedded_worker: bool,
}

fn default_batch_size() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_fetch_timeout_secs() -> u64 {
    60
}

fn default_max_image_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_embedded_worker() -> bool {
    true
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            send_image_by_url: false,
            queue_dir: None,
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_image_bytes: default_max_image_bytes(),
            embedded_worker: default_embedded_worker(),
        }
    }
}

impl OffloadConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

/// Idempotency store config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Marker directory. Relative paths are resolved against the config file's parent. Default: `store`.
    pub dir: Option<PathBuf>,
}

/// Read a non-empty trimmed env var.
fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    env_non_empty("TELEGRAM_BOT_TOKEN").or_else(|| trimmed(&config.telegram.bot_token))
}

/// Resolve the webhook secret: env TELEGRAM_WEBHOOK_TOKEN overrides config.
pub fn resolve_webhook_secret(config: &Config) -> Option<String> {
    env_non_empty("TELEGRAM_WEBHOOK_TOKEN").or_else(|| trimmed(&config.telegram.webhook_secret))
}

/// Resolve the provider API key: env GPT_API_KEY overrides config.
pub fn resolve_provider_key(config: &Config) -> Option<String> {
    env_non_empty("GPT_API_KEY").or_else(|| trimmed(&config.provider.api_key))
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("GPT_TALK_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".gpt-talk").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, the default path, or GPT_TALK_CONFIG_PATH. Missing file => default config.
/// Returns the config and the path that was used (for resolving relative directories).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

fn config_parent(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn resolve_dir(configured: Option<&PathBuf>, config_path: &Path, default_name: &str) -> PathBuf {
    let parent = config_parent(config_path);
    match configured {
        Some(d) if !d.as_os_str().is_empty() => {
            if d.is_absolute() {
                d.clone()
            } else {
                parent.join(d)
            }
        }
        _ => parent.join(default_name),
    }
}

/// Resolve the spool directory for offload jobs.
pub fn resolve_queue_dir(config: &Config, config_path: &Path) -> PathBuf {
    resolve_dir(config.offload.queue_dir.as_ref(), config_path, "queue")
}

/// Resolve the idempotency marker directory.
pub fn resolve_store_dir(config: &Config, config_path: &Path) -> PathBuf {
    resolve_dir(config.store.dir.as_ref(), config_path, "store")
}
