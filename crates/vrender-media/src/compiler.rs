//! Timeline compiler.
//!
//! Turns a timeline into locally materialized clip images plus one FFmpeg
//! command that:
//! - loops each still image for exactly its clip duration
//! - letterboxes it into the fixed output resolution
//! - draws the clip text centered near the bottom
//! - concatenates every clip into a single video-only stream

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use vrender_models::encoding::{
    CRF, DEFAULT_IMAGE_EXTENSION, FRAME_RATE, JOB_DIR_PREFIX, KNOWN_IMAGE_EXTENSIONS,
    OUTPUT_FILE_NAME, OUTPUT_HEIGHT, OUTPUT_WIDTH, PIXEL_FORMAT, PRESET, TEXT_BORDER_COLOR,
    TEXT_BORDER_WIDTH, TEXT_BOTTOM_MARGIN, TEXT_FONT_COLOR, TEXT_FONT_SIZE, VIDEO_CODEC,
};
use vrender_models::{JobId, Timeline};

use crate::command::{FfmpegCommand, ProcessCommand};
use crate::error::{MediaError, MediaResult};
use crate::fetch::AssetFetcher;

/// Output of one compilation. Lives only as long as one attempt.
#[derive(Debug, Clone)]
pub struct CompilationResult {
    /// Encode command; its output path is `work_dir/output.mp4`
    pub command: ProcessCommand,
    /// Job-scoped workspace holding inputs and output
    pub work_dir: PathBuf,
    /// Materialized clip images, in timeline order
    pub input_asset_paths: Vec<PathBuf>,
}

/// Compiles timelines into FFmpeg invocations.
#[derive(Clone)]
pub struct TimelineCompiler {
    work_root: PathBuf,
    ffmpeg_program: String,
    fetcher: Arc<dyn AssetFetcher>,
}

impl TimelineCompiler {
    pub fn new(work_root: impl Into<PathBuf>, fetcher: Arc<dyn AssetFetcher>) -> Self {
        Self {
            work_root: work_root.into(),
            ffmpeg_program: "ffmpeg".to_string(),
            fetcher,
        }
    }

    /// Use a specific FFmpeg binary instead of `ffmpeg` from PATH.
    pub fn with_ffmpeg_program(mut self, program: impl Into<String>) -> Self {
        self.ffmpeg_program = program.into();
        self
    }

    /// Workspace directory for a job. Deterministic, so callers can clean it
    /// up even when compilation fails half-way.
    pub fn work_dir_for(&self, job_id: &JobId) -> PathBuf {
        let safe: String = job_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.work_root.join(format!("{}{}", JOB_DIR_PREFIX, safe))
    }

    /// Compile a timeline into an FFmpeg command.
    ///
    /// Assets are fetched one at a time in clip order so that input index N
    /// is always clip N.
    pub async fn compile(&self, job_id: &JobId, timeline: &Timeline) -> MediaResult<CompilationResult> {
        if timeline.is_empty() {
            return Err(MediaError::internal("Cannot compile an empty timeline"));
        }

        let work_dir = self.work_dir_for(job_id);
        tokio::fs::create_dir_all(&work_dir).await?;

        let mut input_asset_paths = Vec::with_capacity(timeline.len());
        for (index, clip) in timeline.clips.iter().enumerate() {
            let ext = image_extension(&clip.image)?;
            let dest = work_dir.join(format!("clip_{}.{}", index, ext));

            debug!(job_id = %job_id, "Downloading image {}: {}", index, clip.image);
            self.fetcher.fetch(&clip.image, &dest).await?;
            input_asset_paths.push(dest);
        }

        let output_path = work_dir.join(OUTPUT_FILE_NAME);
        let command = build_render_command(timeline, &input_asset_paths, &output_path)
            .into_process(self.ffmpeg_program.clone());

        info!(
            job_id = %job_id,
            clips = timeline.len(),
            "Compiled timeline ({}s total)",
            timeline.total_duration()
        );

        Ok(CompilationResult {
            command,
            work_dir,
            input_asset_paths,
        })
    }

    /// Remove a workspace recursively. Never fails; problems are logged.
    pub async fn cleanup(&self, work_dir: &Path) {
        remove_workspace(work_dir).await
    }
}

/// Remove a workspace directory; missing directories are fine.
pub async fn remove_workspace(work_dir: &Path) {
    match tokio::fs::remove_dir_all(work_dir).await {
        Ok(()) => info!("Cleaned up work directory: {}", work_dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Work directory already gone: {}", work_dir.display());
        }
        Err(e) => warn!("Failed to cleanup {}: {}", work_dir.display(), e),
    }
}

/// Build the encode command for clips already materialized at `inputs`.
pub fn build_render_command(timeline: &Timeline, inputs: &[PathBuf], output_path: &Path) -> FfmpegCommand {
    let mut cmd = FfmpegCommand::new(output_path);

    for (clip, input) in timeline.clips.iter().zip(inputs) {
        cmd = cmd.input_with_args(
            [
                "-loop".to_string(),
                "1".to_string(),
                "-framerate".to_string(),
                FRAME_RATE.to_string(),
                "-t".to_string(),
                clip.duration.to_string(),
            ],
            input,
        );
    }

    cmd.filter_complex(build_filter_graph(timeline))
        .map("[outv]")
        .video_codec(VIDEO_CODEC)
        .preset(PRESET)
        .crf(CRF)
        .pixel_format(PIXEL_FORMAT)
        .frame_rate(FRAME_RATE)
        .output_args(["-movflags", "+faststart"])
}

/// Per-clip scale/pad/drawtext chains followed by one concat over all clips.
pub fn build_filter_graph(timeline: &Timeline) -> String {
    let mut parts = Vec::with_capacity(timeline.len() + 1);
    let mut concat_inputs = String::new();

    for (i, clip) in timeline.clips.iter().enumerate() {
        parts.push(format!(
            "[{i}:v]scale={w}:{h}:force_original_aspect_ratio=decrease,\
             pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1,\
             drawtext=text='{text}':fontsize={size}:fontcolor={color}:\
             borderw={bw}:bordercolor={bc}:x=(w-text_w)/2:y=h-th-{margin},\
             setpts=PTS-STARTPTS[v{i}]",
            w = OUTPUT_WIDTH,
            h = OUTPUT_HEIGHT,
            text = escape_drawtext(&clip.text),
            size = TEXT_FONT_SIZE,
            color = TEXT_FONT_COLOR,
            bw = TEXT_BORDER_WIDTH,
            bc = TEXT_BORDER_COLOR,
            margin = TEXT_BOTTOM_MARGIN,
        ));
        concat_inputs.push_str(&format!("[v{}]", i));
    }

    parts.push(format!(
        "{}concat=n={}:v=1:a=0[outv]",
        concat_inputs,
        timeline.len()
    ));

    parts.join(";")
}

/// Escape text for embedding inside `drawtext=text='...'`.
///
/// The value passes three parsers: the filter graph (quoted, so only `'`
/// matters), the option parser (`\`, `'`, `:`, brackets) and drawtext's own
/// expansion (`\` and `%`).
pub fn escape_drawtext(text: &str) -> String {
    let expansion = escape_chars(text, &['\\', '%']);
    let option = escape_chars(&expansion, &['\\', '\'', ':', '[', ']']);
    option.replace('\'', "'\\''")
}

fn escape_chars(text: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Extension (without dot) for a clip image, from the URL path.
pub fn image_extension(image_url: &str) -> MediaResult<String> {
    let url = url::Url::parse(image_url).map_err(|e| MediaError::invalid_url(image_url, e.to_string()))?;

    let ext = Path::new(url.path())
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    Ok(match ext {
        Some(e) if KNOWN_IMAGE_EXTENSIONS.contains(&e.as_str()) => e,
        _ => DEFAULT_IMAGE_EXTENSION.to_string(),
    })
}
