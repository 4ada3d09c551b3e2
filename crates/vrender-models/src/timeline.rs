//! Timeline and clip definitions.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::encoding::{
    MAX_CLIPS, MAX_CLIP_DURATION_SECS, MAX_CLIP_TEXT_CHARS, MAX_TOTAL_DURATION_SECS,
    MIN_CLIP_DURATION_SECS,
};
use crate::error::{ErrorCode, JobError};

/// A single still-image segment of the rendered video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Clip {
    /// URL of the source image
    pub image: String,
    /// Text overlay drawn near the bottom of the frame
    pub text: String,
    /// Whole seconds this clip stays on screen
    pub duration: u32,
}

impl Clip {
    pub fn new(image: impl Into<String>, text: impl Into<String>, duration: u32) -> Self {
        Self {
            image: image.into(),
            text: text.into(),
            duration,
        }
    }
}

/// Ordered sequence of clips. Immutable once accepted into a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Timeline {
    pub clips: Vec<Clip>,
}

/// Reasons a timeline is rejected at submission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimelineError {
    #[error("Timeline must contain at least one clip")]
    Empty,

    #[error("Timeline has {count} clips (max {max})")]
    TooManyClips { count: usize, max: usize },

    #[error("Timeline lasts {total}s (max {max}s)")]
    TooLong { total: u32, max: u32 },

    #[error("Clip {index}: {reason}")]
    InvalidClip { index: usize, reason: String },
}

impl TimelineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TimelineError::Empty => ErrorCode::InvalidTimeline,
            TimelineError::TooManyClips { .. } => ErrorCode::TooManyClips,
            TimelineError::TooLong { .. } => ErrorCode::TimelineTooLong,
            TimelineError::InvalidClip { .. } => ErrorCode::InvalidClip,
        }
    }
}

impl From<TimelineError> for JobError {
    fn from(err: TimelineError) -> Self {
        let code = err.code();
        let job_error = JobError::new(code, err.to_string());
        match err {
            TimelineError::InvalidClip { index, .. } => job_error.with_detail("clipIndex", index),
            _ => job_error,
        }
    }
}

impl Timeline {
    pub fn new(clips: Vec<Clip>) -> Self {
        Self { clips }
    }

    pub fn len(&self) -> usize {
        self.clips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }

    /// Sum of all clip durations in seconds.
    pub fn total_duration(&self) -> u32 {
        self.clips.iter().map(|c| c.duration).sum()
    }

    /// Validate the timeline against the submission limits.
    ///
    /// The render pipeline assumes this already passed; it is run by the
    /// submission path before a job is created.
    pub fn validate(&self) -> Result<(), TimelineError> {
        if self.clips.is_empty() {
            return Err(TimelineError::Empty);
        }
        if self.clips.len() > MAX_CLIPS {
            return Err(TimelineError::TooManyClips {
                count: self.clips.len(),
                max: MAX_CLIPS,
            });
        }

        for (index, clip) in self.clips.iter().enumerate() {
            validate_clip(clip).map_err(|reason| TimelineError::InvalidClip { index, reason })?;
        }

        let total = self.total_duration();
        if total > MAX_TOTAL_DURATION_SECS {
            return Err(TimelineError::TooLong {
                total,
                max: MAX_TOTAL_DURATION_SECS,
            });
        }

        Ok(())
    }
}

fn validate_clip(clip: &Clip) -> Result<(), String> {
    match url::Url::parse(&clip.image) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {}
        Ok(url) => return Err(format!("unsupported image URL scheme '{}'", url.scheme())),
        Err(e) => return Err(format!("invalid image URL: {}", e)),
    }

    let chars = clip.text.chars().count();
    if chars > MAX_CLIP_TEXT_CHARS {
        return Err(format!(
            "text is {} characters (max {})",
            chars, MAX_CLIP_TEXT_CHARS
        ));
    }

    if !(MIN_CLIP_DURATION_SECS..=MAX_CLIP_DURATION_SECS).contains(&clip.duration) {
        return Err(format!(
            "duration {}s outside {}..={}s",
            clip.duration, MIN_CLIP_DURATION_SECS, MAX_CLIP_DURATION_SECS
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip(duration: u32) -> Clip {
        Clip::new("https://example.com/a.jpg", "Hello", duration)
    }

    #[test]
    fn test_valid_timeline() {
        let timeline = Timeline::new(vec![clip(3), clip(5)]);
        assert!(timeline.validate().is_ok());
        assert_eq!(timeline.total_duration(), 8);
    }

    #[test]
    fn test_empty_timeline_rejected() {
        let err = Timeline::new(vec![]).validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTimeline);
    }

    #[test]
    fn test_too_many_clips() {
        let timeline = Timeline::new((0..11).map(|_| clip(1)).collect());
        let err = timeline.validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::TooManyClips);
    }

    #[test]
    fn test_total_duration_limit() {
        // 5 x 25s = 125s > 120s
        let timeline = Timeline::new((0..5).map(|_| clip(25)).collect());
        let err = timeline.validate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::TimelineTooLong);

        // Exactly 120s is allowed
        let timeline = Timeline::new((0..4).map(|_| clip(30)).collect());
        assert!(timeline.validate().is_ok());
    }

    #[test]
    fn test_invalid_clip_fields() {
        let zero = Timeline::new(vec![clip(0)]);
        assert_eq!(zero.validate().unwrap_err().code(), ErrorCode::InvalidClip);

        let long_text = Timeline::new(vec![Clip::new(
            "https://example.com/a.jpg",
            "x".repeat(201),
            2,
        )]);
        assert_eq!(long_text.validate().unwrap_err().code(), ErrorCode::InvalidClip);

        let bad_url = Timeline::new(vec![Clip::new("ftp://example.com/a.jpg", "hi", 2)]);
        let err = bad_url.validate().unwrap_err();
        assert_eq!(err, TimelineError::InvalidClip {
            index: 0,
            reason: "unsupported image URL scheme 'ftp'".to_string(),
        });
    }

    #[test]
    fn test_timeline_error_into_job_error() {
        let err: JobError = TimelineError::InvalidClip {
            index: 3,
            reason: "bad".into(),
        }
        .into();
        assert_eq!(err.code, ErrorCode::InvalidClip);
        assert_eq!(err.details.unwrap()["clipIndex"], 3);
    }

    #[test]
    fn test_timeline_json_shape() {
        let json = r#"{"clips":[{"image":"https://x/a.jpg","text":"Hi","duration":3}]}"#;
        let timeline: Timeline = serde_json::from_str(json).unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline.clips[0].duration, 3);
    }
}
