//! Timeline compilation and supervised FFmpeg execution.
//!
//! This crate provides:
//! - Type-safe FFmpeg command building
//! - Asset fetching into job-scoped workspaces
//! - Timeline → filter graph compilation with drawtext escaping
//! - A process supervisor with hard timeouts and stderr diagnosis

pub mod command;
pub mod compiler;
pub mod error;
pub mod fetch;
pub mod supervisor;

pub use command::{ffmpeg_version, FfmpegCommand, ProcessCommand};
pub use compiler::{escape_drawtext, image_extension, remove_workspace, CompilationResult, TimelineCompiler};
pub use error::{MediaError, MediaResult};
pub use fetch::{AssetFetcher, HttpAssetFetcher};
pub use supervisor::{FailureKind, ProcessSupervisor, RenderRunner, RunFailure, RunReport};
