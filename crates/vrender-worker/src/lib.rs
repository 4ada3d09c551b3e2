//! Video render worker.
//!
//! This crate provides:
//! - The render orchestrator (compile, encode, upload, notify)
//! - Retry policy with terminal-state guarantees
//! - Webhook notifications
//! - Job executor with bounded concurrency and graceful shutdown

pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod notifier;
pub mod orchestrator;

#[cfg(test)]
mod testing;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use executor::{DeliveryHandler, JobExecutor};
pub use logging::JobLogger;
pub use notifier::{Notifier, WebhookNotifier};
pub use orchestrator::{AttemptOutcome, RenderOrchestrator};
