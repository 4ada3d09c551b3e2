//! S3-compatible object storage for rendered outputs.
//!
//! This crate provides:
//! - Lazy, idempotent bucket provisioning
//! - File upload with content type
//! - Presigned GET URLs and plain public URLs
//! - The `ObjectStore` seam used by the render pipeline

pub mod client;
pub mod error;

pub use client::{ObjectStore, S3Config, S3Store};
pub use error::{StorageError, StorageResult};
