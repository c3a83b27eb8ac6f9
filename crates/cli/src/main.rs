use clap::{Parser, Subcommand};
use gpt_talk::channels::TelegramClient;
use gpt_talk::config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gpt-talk")]
#[command(about = "Telegram bot gateway for a generative text and image provider", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory: config.json with a generated webhook secret, plus the store and queue directories.
    Init {
        /// Config file path (default: GPT_TALK_CONFIG_PATH or ~/.gpt-talk/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the webhook gateway (and the embedded offload worker unless disabled in config).
    Serve {
        /// Config file path (default: GPT_TALK_CONFIG_PATH or ~/.gpt-talk/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// HTTP port (default from config or 8080)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Run the offload worker on its own, delivering queued images as photos.
    Worker {
        /// Config file path (default: GPT_TALK_CONFIG_PATH or ~/.gpt-talk/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Drain one batch and exit.
        #[arg(long)]
        once: bool,
    },

    /// Register the webhook URL (and secret) with Telegram.
    SetWebhook {
        /// Config file path (default: GPT_TALK_CONFIG_PATH or ~/.gpt-talk/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Public URL of POST /telegram-bot (default: telegram.webhookUrl)
        #[arg(long, value_name = "URL")]
        url: Option<String>,
    },

    /// Remove the Telegram webhook registration.
    DeleteWebhook {
        /// Config file path (default: GPT_TALK_CONFIG_PATH or ~/.gpt-talk/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("gpt-talk {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Serve { config, port }) => {
            if let Err(e) = run_serve(config, port).await {
                log::error!("serve failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Worker { config, once }) => {
            if let Err(e) = run_worker(config, once).await {
                log::error!("worker failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::SetWebhook { config, url }) => {
            if let Err(e) = run_set_webhook(config, url).await {
                log::error!("set-webhook failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::DeleteWebhook { config }) => {
            if let Err(e) = run_delete_webhook(config).await {
                log::error!("delete-webhook failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(config::default_config_path);
    let dir = gpt_talk::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_serve(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    gpt_talk::gateway::run_gateway(config, path).await
}

async fn run_worker(config_path: Option<PathBuf>, once: bool) -> anyhow::Result<()> {
    let (config, path) = config::load_config(config_path)?;
    gpt_talk::worker::run_worker(config, path, once).await
}

async fn run_set_webhook(config_path: Option<PathBuf>, url: Option<String>) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    let url = url
        .or_else(|| config.telegram.webhook_url.clone())
        .ok_or_else(|| anyhow::anyhow!("no webhook url (pass --url or set telegram.webhookUrl)"))?;
    let secret = config::resolve_webhook_secret(&config);
    TelegramClient::from_config(&config)
        .set_webhook(&url, secret.as_deref())
        .await?;
    println!("webhook set to {}", url);
    Ok(())
}

async fn run_delete_webhook(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    TelegramClient::from_config(&config).delete_webhook().await?;
    println!("webhook deleted");
    Ok(())
}
