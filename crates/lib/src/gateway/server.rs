//! Gateway HTTP server: webhook intake, direct completions, and the embedded offload worker.

use crate::channels::{ChatApi, TelegramClient};
use crate::config::{self, Config};
use crate::dispatcher::{DispatchOutcome, Dispatcher, DispatcherSettings, WEBHOOK_SECRET_HEADER};
use crate::init;
use crate::llm::OpenAiClient;
use crate::queue::SpoolQueue;
use crate::store::FileMarkerStore;
use crate::worker::{HttpFetcher, OffloadWorker, WorkerSettings};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

/// POST /gpt body.
#[derive(Debug, Deserialize)]
struct GptRequest {
    #[serde(default)]
    message: String,
}

/// HTTP routes over a dispatcher. Unknown paths and methods answer 405.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/ping", get(ping).fallback(method_not_allowed))
        .route("/gpt", post(gpt).fallback(method_not_allowed))
        .route(
            "/telegram-bot",
            post(telegram_webhook).fallback(method_not_allowed),
        )
        .fallback(method_not_allowed)
        .with_state(dispatcher)
}

async fn ping() -> &'static str {
    "Pong!"
}

async fn method_not_allowed() -> (StatusCode, &'static str) {
    (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
}

/// POST /gpt: one completion for `{"message": ...}`, answered as plain text.
async fn gpt(State(dispatcher): State<Arc<Dispatcher>>, body: Bytes) -> impl IntoResponse {
    let req: GptRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            log::warn!("gpt: bad request body: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };
    match dispatcher.complete(&req.message).await {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            log::warn!("gpt: {}", e);
            (e.status(), e.to_string())
        }
    }
}

/// POST /telegram-bot: one Telegram update.
async fn telegram_webhook(
    State(dispatcher): State<Arc<Dispatcher>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let provided = headers
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    match dispatcher.handle_webhook(provided, &body).await {
        Ok(DispatchOutcome::Duplicate) => {
            log::debug!("telegram-bot: duplicate update acknowledged");
            StatusCode::OK
        }
        Ok(_) => StatusCode::OK,
        Err(e) => e.status(),
    }
}

/// Run the gateway server; binds to config.gateway.bind:config.gateway.port.
/// When bind is not loopback, a webhook secret must be configured or startup fails.
/// Blocks until shutdown (Ctrl+C or SIGTERM), then stops and awaits the embedded worker.
/// Requires the configuration directory to be initialized (`gpt-talk init`).
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    init::require_initialized(&config_path, &config)?;
    let bind = config.gateway.bind.trim();
    let secret = config::resolve_webhook_secret(&config);
    if !config::is_loopback_bind(bind) && secret.is_none() {
        anyhow::bail!(
            "refusing to bind gateway to {} without a webhook secret (set telegram.webhookSecret or TELEGRAM_WEBHOOK_TOKEN)",
            bind
        );
    }
    if secret.is_none() {
        log::warn!("no webhook secret configured; accepting unauthenticated updates on {}", bind);
    }

    let store_dir = config::resolve_store_dir(&config, &config_path);
    let store = FileMarkerStore::open(&store_dir)
        .await
        .with_context(|| format!("opening marker store {}", store_dir.display()))?;
    let queue_dir = config::resolve_queue_dir(&config, &config_path);
    let queue = SpoolQueue::open(&queue_dir)
        .await
        .with_context(|| format!("opening offload queue {}", queue_dir.display()))?;
    let telegram = Arc::new(TelegramClient::from_config(&config));
    let provider_key = config::resolve_provider_key(&config);
    if provider_key.is_none() {
        log::warn!("no provider api key configured; completions will fail");
    }
    let provider = OpenAiClient::new(&config.provider, provider_key);

    let dispatcher = Arc::new(Dispatcher::new(
        DispatcherSettings::from_config(&config),
        Arc::new(store),
        Arc::new(provider),
        Arc::new(queue.clone()),
        telegram.clone(),
    ));

    if let Some(ref url) = config.telegram.webhook_url {
        if let Err(e) = telegram.set_webhook(url, secret.as_deref()).await {
            log::warn!("telegram set_webhook failed: {}", e);
        } else {
            log::info!("telegram webhook registered: {}", url);
        }
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let worker_task = if config.offload.embedded_worker {
        let chat: Arc<dyn ChatApi> = telegram.clone();
        let worker = OffloadWorker::new(
            queue,
            chat,
            Arc::new(HttpFetcher::from_config(&config.offload)),
            WorkerSettings::from_config(&config.offload),
        );
        Some(tokio::spawn(async move {
            if let Err(e) = worker.run(stop_rx).await {
                log::error!("embedded worker exited: {}", e);
            }
        }))
    } else {
        log::info!("embedded worker disabled; run `gpt-talk worker` to deliver images");
        None
    };

    let app = router(dispatcher);
    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            log::info!("shutdown signal received, draining connections");
            let _ = stop_tx.send(true);
        })
        .await
        .context("gateway server exited")?;

    if let Some(handle) = worker_task {
        let _ = handle.await;
        log::info!("embedded worker finished");
    }
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
