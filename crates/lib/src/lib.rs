//! gpt-talk core library: Telegram webhook dispatcher, generative provider client,
//! idempotency store, image offload queue and worker, used by the CLI.

pub mod channels;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod gateway;
pub mod init;
pub mod llm;
pub mod queue;
pub mod store;
pub mod worker;
