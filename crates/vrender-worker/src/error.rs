//! Worker error types.

use thiserror::Error;
use vrender_media::{FailureKind, RunFailure};
use vrender_models::{ErrorCode, JobError};
use vrender_queue::QueueError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{}", .0.message)]
    Render(RunFailure),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    Storage(#[from] vrender_storage::StorageError),

    #[error("Media error: {0}")]
    Media(#[from] vrender_media::MediaError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Code for this failure when it ends a render attempt. Each pipeline
    /// step fails with its own variant, so the variant identifies the step.
    pub fn code(&self) -> ErrorCode {
        match self {
            WorkerError::Media(e) => e.code(),
            WorkerError::Render(f) if f.kind == FailureKind::Timeout => ErrorCode::FfmpegTimeout,
            WorkerError::Render(_) => ErrorCode::FfmpegError,
            WorkerError::Storage(_) => ErrorCode::StorageUploadFailed,
            WorkerError::Queue(QueueError::JobNotFound(_)) => ErrorCode::JobNotFound,
            WorkerError::Queue(_) => ErrorCode::DatabaseError,
            WorkerError::ConfigError(_) | WorkerError::Io(_) => ErrorCode::UnknownError,
        }
    }

    /// Normalize into the error persisted on the job and sent to webhooks.
    pub fn to_job_error(&self) -> JobError {
        let mut error = JobError::new(self.code(), self.to_string());

        match self {
            WorkerError::Media(e) => {
                if let Some(url) = e.url() {
                    error = error.with_detail("url", url);
                }
            }
            WorkerError::Render(f) => {
                if let Some(code) = f.exit_code {
                    error = error.with_detail("exitCode", code);
                }
                if let Some(tail) = f.stderr_tail.as_deref().filter(|t| !t.is_empty()) {
                    error = error.with_detail("stderr", tail);
                }
            }
            _ => {}
        }

        error.with_stack(format!("{:?}", self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vrender_media::MediaError;
    use vrender_storage::StorageError;

    #[test]
    fn test_codes_follow_failing_step() {
        let download = WorkerError::from(MediaError::download_failed("https://x/a.jpg", "HTTP 404"));
        assert_eq!(download.code(), ErrorCode::ImageDownloadFailed);

        let timeout = WorkerError::Render(RunFailure {
            kind: FailureKind::Timeout,
            message: "FFmpeg timeout after 300000ms".into(),
            exit_code: None,
            stderr_tail: None,
        });
        assert_eq!(timeout.code(), ErrorCode::FfmpegTimeout);

        let upload = WorkerError::from(StorageError::upload_failed("503"));
        assert_eq!(upload.code(), ErrorCode::StorageUploadFailed);

        let db = WorkerError::from(QueueError::connection_failed("refused"));
        assert_eq!(db.code(), ErrorCode::DatabaseError);

        let io = WorkerError::from(std::io::Error::other("disk full"));
        assert_eq!(io.code(), ErrorCode::UnknownError);
    }

    #[test]
    fn test_job_error_carries_details_and_stack() {
        let err = WorkerError::from(MediaError::download_failed("https://x/a.jpg", "HTTP 404"));
        let job_error = err.to_job_error();
        assert_eq!(job_error.code, ErrorCode::ImageDownloadFailed);
        assert_eq!(job_error.details.as_ref().unwrap()["url"], "https://x/a.jpg");
        assert!(job_error.stack.unwrap().contains("DownloadFailed"));

        let exit = WorkerError::Render(RunFailure {
            kind: FailureKind::Exit,
            message: "FFmpeg exited with code 1: Invalid data".into(),
            exit_code: Some(1),
            stderr_tail: Some("Invalid data".into()),
        });
        let job_error = exit.to_job_error();
        assert_eq!(job_error.message, "FFmpeg exited with code 1: Invalid data");
        assert_eq!(job_error.details.as_ref().unwrap()["exitCode"], 1);
    }
}
