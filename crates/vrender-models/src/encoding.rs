//! Process-wide rendering constants.
//!
//! Every job is encoded with the same settings; none of these are
//! per-job configuration.

/// Output width in pixels
pub const OUTPUT_WIDTH: u32 = 1920;
/// Output height in pixels
pub const OUTPUT_HEIGHT: u32 = 1080;
/// Output frame rate
pub const FRAME_RATE: u32 = 30;
/// Output video codec (H.264)
pub const VIDEO_CODEC: &str = "libx264";
/// Encoding preset
pub const PRESET: &str = "medium";
/// Constant Rate Factor (lower is better)
pub const CRF: u8 = 23;
/// Output pixel format
pub const PIXEL_FORMAT: &str = "yuv420p";

/// Text overlay settings
pub const TEXT_FONT_SIZE: u32 = 64;
pub const TEXT_FONT_COLOR: &str = "white";
pub const TEXT_BORDER_WIDTH: u32 = 3;
pub const TEXT_BORDER_COLOR: &str = "black";
/// Distance of the text baseline box from the bottom edge
pub const TEXT_BOTTOM_MARGIN: u32 = 100;

/// Name of the rendered artifact inside a job workspace
pub const OUTPUT_FILE_NAME: &str = "output.mp4";

/// Image extensions kept as-is when materializing clip assets
pub const KNOWN_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];
/// Extension used when the source URL has no recognizable image extension
pub const DEFAULT_IMAGE_EXTENSION: &str = "jpg";

/// Timeline limits (enforced by the submission path)
pub const MAX_CLIPS: usize = 10;
pub const MAX_TOTAL_DURATION_SECS: u32 = 120;
pub const MIN_CLIP_DURATION_SECS: u32 = 1;
pub const MAX_CLIP_DURATION_SECS: u32 = 30;
pub const MAX_CLIP_TEXT_CHARS: usize = 200;

/// Storage settings
pub const OUTPUT_BUCKET: &str = "video-outputs";
pub const OUTPUT_PREFIX: &str = "outputs/";
pub const OUTPUT_CONTENT_TYPE: &str = "video/mp4";
pub const SIGNED_URL_TTL_SECS: u64 = 3600;

/// Job processing defaults
pub const MAX_RETRIES: u32 = 3;
pub const INITIAL_BACKOFF_MS: u64 = 1000;
pub const BACKOFF_MULTIPLIER: u32 = 2;
pub const JOB_TIMEOUT_MS: u64 = 300_000;
pub const ASSET_FETCH_TIMEOUT_MS: u64 = 30_000;
pub const WEBHOOK_TIMEOUT_MS: u64 = 10_000;

/// User-Agent sent on outbound asset fetches and webhooks
pub const USER_AGENT: &str = "VideoRenderPlatform/1.0";

/// Workspace settings
pub const DEFAULT_WORK_DIR: &str = "/tmp/video-render";
pub const JOB_DIR_PREFIX: &str = "job-";

/// Deterministic object key for a job's rendered video.
pub fn output_key(job_id: &str) -> String {
    format!("{}{}.mp4", OUTPUT_PREFIX, job_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_key_is_deterministic() {
        assert_eq!(output_key("abc"), "outputs/abc.mp4");
        assert_eq!(output_key("abc"), output_key("abc"));
    }
}
