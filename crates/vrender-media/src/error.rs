//! Error types for media operations.

use thiserror::Error;
use vrender_models::ErrorCode;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur while preparing or running a render.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("FFmpeg command failed: {message}")]
    FfmpegFailed {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("Failed to download image {url}: {message}")]
    DownloadFailed { url: String, message: String },

    #[error("Invalid asset URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MediaError {
    /// Create an FFmpeg failure error.
    pub fn ffmpeg_failed(
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::FfmpegFailed {
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    /// Create a download failure error.
    pub fn download_failed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DownloadFailed {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn invalid_url(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Source URL involved in the failure, if any.
    pub fn url(&self) -> Option<&str> {
        match self {
            MediaError::DownloadFailed { url, .. } | MediaError::InvalidUrl { url, .. } => Some(url),
            _ => None,
        }
    }

    /// Error code this failure maps to when it ends a render attempt.
    pub fn code(&self) -> ErrorCode {
        match self {
            MediaError::DownloadFailed { .. } | MediaError::InvalidUrl { .. } => {
                ErrorCode::ImageDownloadFailed
            }
            MediaError::FfmpegFailed { .. } => ErrorCode::FfmpegError,
            MediaError::Io(_) | MediaError::Internal(_) => ErrorCode::UnknownError,
        }
    }
}
