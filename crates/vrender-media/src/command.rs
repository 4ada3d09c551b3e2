//! FFmpeg command builder.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::debug;

use crate::error::{MediaError, MediaResult};

/// One `-i` input with the arguments that precede it.
#[derive(Debug, Clone)]
struct FfmpegInput {
    args: Vec<String>,
    path: PathBuf,
}

/// Builder for FFmpeg commands.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    /// Inputs in `-i` order (index N is `[N:v]` in filter graphs)
    inputs: Vec<FfmpegInput>,
    /// Output file path
    output: PathBuf,
    /// Output arguments (after all inputs)
    output_args: Vec<String>,
    /// Whether to overwrite output
    overwrite: bool,
}

impl FfmpegCommand {
    /// Create a new FFmpeg command writing to `output`.
    pub fn new(output: impl AsRef<Path>) -> Self {
        Self {
            inputs: Vec::new(),
            output: output.as_ref().to_path_buf(),
            output_args: Vec::new(),
            overwrite: true,
        }
    }

    /// Add an input with no per-input arguments.
    pub fn input(self, path: impl AsRef<Path>) -> Self {
        self.input_with_args(Vec::<String>::new(), path)
    }

    /// Add an input preceded by its own arguments (e.g. `-loop 1 -t 3`).
    pub fn input_with_args<I, S>(mut self, args: I, path: impl AsRef<Path>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.push(FfmpegInput {
            args: args.into_iter().map(Into::into).collect(),
            path: path.as_ref().to_path_buf(),
        });
        self
    }

    /// Add output arguments (after all inputs).
    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    /// Add multiple output arguments.
    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set filter complex.
    pub fn filter_complex(self, filter: impl Into<String>) -> Self {
        self.output_arg("-filter_complex").output_arg(filter)
    }

    /// Map a stream or filter label into the output.
    pub fn map(self, label: impl Into<String>) -> Self {
        self.output_arg("-map").output_arg(label)
    }

    /// Set video codec.
    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:v").output_arg(codec)
    }

    /// Set CRF (quality).
    pub fn crf(self, crf: u8) -> Self {
        self.output_arg("-crf").output_arg(crf.to_string())
    }

    /// Set preset.
    pub fn preset(self, preset: impl Into<String>) -> Self {
        self.output_arg("-preset").output_arg(preset)
    }

    /// Set output pixel format.
    pub fn pixel_format(self, pix_fmt: impl Into<String>) -> Self {
        self.output_arg("-pix_fmt").output_arg(pix_fmt)
    }

    /// Set output frame rate.
    pub fn frame_rate(self, fps: u32) -> Self {
        self.output_arg("-r").output_arg(fps.to_string())
    }

    /// Number of `-i` inputs.
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Build the command arguments.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if self.overwrite {
            args.push("-y".to_string());
        }

        args.push("-hide_banner".to_string());
        args.push("-v".to_string());
        args.push("error".to_string());

        for input in &self.inputs {
            args.extend(input.args.iter().cloned());
            args.push("-i".to_string());
            args.push(input.path.to_string_lossy().to_string());
        }

        args.extend(self.output_args.iter().cloned());
        args.push(self.output.to_string_lossy().to_string());

        args
    }

    /// Freeze into a runnable command for `program` (usually `ffmpeg`).
    pub fn into_process(self, program: impl Into<String>) -> ProcessCommand {
        ProcessCommand {
            program: program.into(),
            args: self.build_args(),
            output_path: self.output,
        }
    }
}

/// A fully specified external command plus the artifact it must produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub output_path: PathBuf,
}

impl ProcessCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I, output_path: impl AsRef<Path>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            output_path: output_path.as_ref().to_path_buf(),
        }
    }

    /// Value following the first occurrence of `flag`, if any.
    pub fn arg_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// Report the version string of the given FFmpeg binary.
pub async fn ffmpeg_version(program: &str) -> MediaResult<String> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .await
        .map_err(|e| MediaError::ffmpeg_failed(format!("{} not runnable: {}", program, e), None, None))?;

    if !output.status.success() {
        return Err(MediaError::ffmpeg_failed(
            "ffmpeg -version failed",
            Some(String::from_utf8_lossy(&output.stderr).into_owned()),
            output.status.code(),
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let version = parse_version(&stdout).unwrap_or("unknown").to_string();
    debug!("Detected {} version {}", program, version);
    Ok(version)
}

fn parse_version(output: &str) -> Option<&str> {
    output
        .lines()
        .next()?
        .strip_prefix("ffmpeg version ")?
        .split_whitespace()
        .next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builder() {
        let cmd = FfmpegCommand::new("/work/output.mp4")
            .input_with_args(["-loop", "1", "-t", "3"], "/work/clip_0.jpg")
            .input("/work/clip_1.png")
            .video_codec("libx264")
            .crf(23);

        let args = cmd.build_args();
        assert_eq!(&args[..4], &["-y", "-hide_banner", "-v", "error"]);
        assert_eq!(cmd.input_count(), 2);

        let first_input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(&args[first_input - 4..first_input], &["-loop", "1", "-t", "3"]);
        assert_eq!(args[first_input + 1], "/work/clip_0.jpg");
        assert!(args.contains(&"-c:v".to_string()));
        assert_eq!(args.last().unwrap(), "/work/output.mp4");
    }

    #[test]
    fn test_into_process_keeps_output_path() {
        let process = FfmpegCommand::new("/work/output.mp4")
            .input("/work/clip_0.jpg")
            .map("[outv]")
            .into_process("ffmpeg");

        assert_eq!(process.program, "ffmpeg");
        assert_eq!(process.output_path, PathBuf::from("/work/output.mp4"));
        assert_eq!(process.arg_value("-map"), Some("[outv]"));
        assert_eq!(process.arg_value("-missing"), None);
    }

    #[test]
    fn test_parse_version() {
        let out = "ffmpeg version 6.1.1-3ubuntu5 Copyright (c) 2000-2023\nbuilt with gcc";
        assert_eq!(parse_version(out), Some("6.1.1-3ubuntu5"));
        assert_eq!(parse_version("something else"), None);
    }
}
