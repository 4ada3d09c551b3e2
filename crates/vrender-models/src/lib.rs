//! Shared data models for the video render pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Timelines and clips
//! - Render jobs and their lifecycle status
//! - Normalized job errors and error codes
//! - Webhook payloads
//! - Process-wide encoding, storage and retry constants

pub mod encoding;
pub mod error;
pub mod job;
pub mod timeline;
pub mod webhook;

// Re-export common types
pub use error::{ErrorCode, JobError};
pub use job::{AttemptRecord, InvalidTransition, Job, JobId, JobStatus, JobStatusResponse};
pub use timeline::{Clip, Timeline, TimelineError};
pub use webhook::WebhookPayload;
