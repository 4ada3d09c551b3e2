//! Redis Streams render queue and job record store.
//!
//! This crate provides:
//! - Job enqueueing via Redis Streams with job-id deduplication
//! - Consumer-group delivery, delayed retries with exponential backoff, DLQ
//! - Recovery of deliveries abandoned by crashed workers
//! - The `JobRepository` persistence seam (Redis and in-memory)

pub mod error;
pub mod job;
pub mod queue;
pub mod store;

pub use error::{QueueError, QueueResult};
pub use job::{Delivery, RenderJob};
pub use queue::{BackoffPolicy, DeliveryQueue, JobQueue, QueueConfig, QueueStats};
pub use store::{JobRepository, MemoryJobStore, RedisJobStore, Transition};
