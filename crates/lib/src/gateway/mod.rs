//! Gateway: HTTP front door for Telegram webhooks and direct completions.
//!
//! Routes: `GET /ping`, `POST /gpt`, `POST /telegram-bot`; everything else answers 405.

mod server;

pub(crate) use server::shutdown_signal;
pub use server::{router, run_gateway};
