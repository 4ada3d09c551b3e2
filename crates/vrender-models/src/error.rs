//! Normalized job error model.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured error details attached to a job error.
pub type ErrorDetails = serde_json::Map<String, serde_json::Value>;

/// Error codes for standardized error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (rejected before a job reaches the worker)
    InvalidTimeline,
    InvalidClip,
    TimelineTooLong,
    TooManyClips,

    // Processing errors (retryable)
    ImageDownloadFailed,
    FfmpegError,
    FfmpegTimeout,
    StorageUploadFailed,

    // System errors
    JobNotFound,
    QueueError,
    DatabaseError,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidTimeline => "INVALID_TIMELINE",
            ErrorCode::InvalidClip => "INVALID_CLIP",
            ErrorCode::TimelineTooLong => "TIMELINE_TOO_LONG",
            ErrorCode::TooManyClips => "TOO_MANY_CLIPS",
            ErrorCode::ImageDownloadFailed => "IMAGE_DOWNLOAD_FAILED",
            ErrorCode::FfmpegError => "FFMPEG_ERROR",
            ErrorCode::FfmpegTimeout => "FFMPEG_TIMEOUT",
            ErrorCode::StorageUploadFailed => "STORAGE_UPLOAD_FAILED",
            ErrorCode::JobNotFound => "JOB_NOT_FOUND",
            ErrorCode::QueueError => "QUEUE_ERROR",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Validation codes never reach the render pipeline.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ErrorCode::InvalidTimeline
                | ErrorCode::InvalidClip
                | ErrorCode::TimelineTooLong
                | ErrorCode::TooManyClips
        )
    }

    /// Pipeline-internal failures that the queue retries with backoff.
    pub fn is_pipeline(&self) -> bool {
        matches!(
            self,
            ErrorCode::ImageDownloadFailed
                | ErrorCode::FfmpegError
                | ErrorCode::FfmpegTimeout
                | ErrorCode::StorageUploadFailed
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Job error structure stored on a job in its terminal FAILED state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl JobError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            stack: None,
        }
    }

    /// Attach a single detail entry.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details
            .get_or_insert_with(ErrorDetails::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnknownError, message)
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for JobError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::ImageDownloadFailed).unwrap();
        assert_eq!(json, "\"IMAGE_DOWNLOAD_FAILED\"");

        let code: ErrorCode = serde_json::from_str("\"FFMPEG_TIMEOUT\"").unwrap();
        assert_eq!(code, ErrorCode::FfmpegTimeout);
        assert_eq!(code.as_str(), "FFMPEG_TIMEOUT");
    }

    #[test]
    fn test_job_error_omits_empty_fields() {
        let err = JobError::new(ErrorCode::FfmpegError, "boom");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "FFMPEG_ERROR");
        assert!(json.get("details").is_none());
        assert!(json.get("stack").is_none());
    }

    #[test]
    fn test_job_error_details() {
        let err = JobError::new(ErrorCode::ImageDownloadFailed, "404")
            .with_detail("url", "https://x/a.jpg")
            .with_detail("index", 2);
        let details = err.details.unwrap();
        assert_eq!(details["url"], "https://x/a.jpg");
        assert_eq!(details["index"], 2);
    }

    #[test]
    fn test_code_categories() {
        assert!(ErrorCode::TooManyClips.is_validation());
        assert!(!ErrorCode::TooManyClips.is_pipeline());
        assert!(ErrorCode::StorageUploadFailed.is_pipeline());
        assert!(!ErrorCode::DatabaseError.is_pipeline());
    }
}
