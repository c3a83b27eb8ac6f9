//! Initialize the configuration directory: create ~/.gpt-talk, a default config with a fresh webhook
//! secret, and the marker store and offload queue directories.

use anyhow::{Context, Result};
use base64::Engine;
use std::path::{Path, PathBuf};

use crate::config;

/// Ensure the configuration directory has been initialized (config file, store and queue directories exist).
pub fn require_initialized(config_path: &Path, config: &config::Config) -> Result<()> {
    if !config_path.exists() {
        anyhow::bail!(
            "configuration not initialized; run `gpt-talk init` first (config file not found: {})",
            config_path.display()
        );
    }
    for (what, dir) in [
        ("store", config::resolve_store_dir(config, config_path)),
        ("queue", config::resolve_queue_dir(config, config_path)),
    ] {
        if !dir.exists() {
            anyhow::bail!(
                "configuration not initialized; run `gpt-talk init` first ({} directory not found: {})",
                what,
                dir.display()
            );
        }
    }
    Ok(())
}

/// Random URL-safe secret for `telegram.webhookSecret` (Telegram allows `A-Z a-z 0-9 _ -`).
pub fn generate_webhook_secret() -> Result<String> {
    let mut bytes = [0u8; 32];
    getrandom::getrandom(&mut bytes)
        .map_err(|e| anyhow::anyhow!("generating webhook secret: {}", e))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Create the config directory and default files if they do not exist.
/// - Creates the config directory (parent of config file path).
/// - Writes `config.json` with defaults and a generated webhook secret if missing.
/// - Creates the store and queue directories named by the (possibly pre-existing) config.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        let mut default_config = config::Config::default();
        default_config.telegram.webhook_secret = Some(generate_webhook_secret()?);
        let body = serde_json::to_string_pretty(&default_config)
            .context("serializing default config")?;
        std::fs::write(config_path, body)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    } else {
        log::debug!("config already exists at {}, keeping it", config_path.display());
    }

    let (config, _) = config::load_config(Some(config_path.to_path_buf()))?;
    for dir in [
        config::resolve_store_dir(&config, config_path),
        config::resolve_queue_dir(&config, config_path),
    ] {
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating directory {}", dir.display()))?;
            log::info!("created directory {}", dir.display());
        }
    }

    Ok(config_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("gpt-talk-init-test-{}", uuid::Uuid::new_v4()))
            .join("config.json")
    }

    #[test]
    fn init_creates_layout_and_secret() {
        let path = temp_config_path();
        let (config, _) = config::load_config(Some(path.clone())).unwrap();
        assert!(require_initialized(&path, &config).is_err());

        let dir = init_config_dir(&path).unwrap();
        assert!(dir.join("store").is_dir());
        assert!(dir.join("queue").is_dir());

        let (config, _) = config::load_config(Some(path.clone())).unwrap();
        let secret = config.telegram.webhook_secret.clone().unwrap();
        assert_eq!(secret.len(), 43);
        assert!(secret
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        require_initialized(&path, &config).unwrap();
    }

    #[test]
    fn init_keeps_existing_config() {
        let path = temp_config_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"gateway":{"port":9999}}"#).unwrap();
        init_config_dir(&path).unwrap();
        let (config, _) = config::load_config(Some(path)).unwrap();
        assert_eq!(config.gateway.port, 9999);
        assert_eq!(config.telegram.webhook_secret, None);
    }

    #[test]
    fn generated_secrets_differ() {
        assert_ne!(
            generate_webhook_secret().unwrap(),
            generate_webhook_secret().unwrap()
        );
    }
}
