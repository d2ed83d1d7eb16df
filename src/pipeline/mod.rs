//! Pipeline orchestrators.
//!
//! Each job type runs as one straight-line task that validates, admits,
//! acquires, processes, packages and terminates, polling its process handle
//! for cancellation at every stage boundary. Progress flows through a
//! [`ProgressSink`] so the same acquisition code can feed either the SSE hub
//! (streaming jobs) or a job record (poll-style jobs).

pub mod compress;
pub mod convert;
pub mod download;
pub mod playlist;
pub mod transcribe;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config;
use crate::error::Result;
use crate::jobs::{JobRecord, JobState};
use crate::media::{ffmpeg, runner};
use crate::process::ProcessHandle;
use crate::progress::ProgressHub;

/// Where pipeline progress goes. Emission must be non-blocking and lossy;
/// coalescing is the consumer's business.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, stage: &str, message: &str, progress: Option<f64>, speed: &str, eta: &str);
}

/// Sink feeding the SSE hub and the pending-job table.
pub struct HubSink {
    pub hub: Arc<ProgressHub>,
    pub job_id: String,
}

impl ProgressSink for HubSink {
    fn emit(&self, stage: &str, message: &str, progress: Option<f64>, speed: &str, eta: &str) {
        let mut extra = Map::new();
        if !speed.is_empty() {
            extra.insert("speed".to_string(), Value::from(speed));
        }
        if !eta.is_empty() {
            extra.insert("eta".to_string(), Value::from(eta));
        }
        self.hub.send(
            &self.job_id,
            stage,
            message,
            progress,
            if extra.is_empty() { None } else { Some(extra) },
        );
        if let Some(progress) = progress {
            self.hub.update_pending(&self.job_id, progress, stage);
        }
    }
}

/// Sink feeding a poll-style job record.
pub struct RecordSink {
    pub record: Arc<JobRecord>,
}

impl ProgressSink for RecordSink {
    fn emit(&self, stage: &str, message: &str, progress: Option<f64>, speed: &str, eta: &str) {
        match stage {
            "downloading" => self.record.set_state(JobState::Downloading),
            "processing" => self.record.set_state(JobState::Processing),
            "compressing" => self.record.set_state(JobState::Compressing),
            "zipping" => self.record.set_state(JobState::Zipping),
            _ => {}
        }
        match progress {
            Some(progress) => self.record.set_progress_message(progress, message),
            None => self.record.set_message(message),
        }
        if !speed.is_empty() || !eta.is_empty() {
            self.record.set_speed_eta(speed, eta);
        }
    }
}

/// A sink that discards everything (internal steps that report elsewhere).
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _: &str, _: &str, _: Option<f64>, _: &str, _: &str) {}
}

/// Post-acquisition processing options.
#[derive(Debug, Clone, Default)]
pub struct ProcessOpts {
    pub is_audio: bool,
    pub is_gif: bool,
    pub audio_format: String,
    pub audio_bitrate: String,
    pub container: String,
}

#[derive(Debug, Clone)]
pub struct Processed {
    pub path: PathBuf,
    pub ext: String,
    pub skipped: bool,
}

/// Turn a downloaded file into the requested output: remux-free copy when
/// the container already matches, audio extraction, GIF conversion, or a
/// container change.
pub async fn process_media(
    input: &Path,
    output: &Path,
    opts: &ProcessOpts,
    process: Option<Arc<ProcessHandle>>,
) -> Result<Processed> {
    let input_ext = input
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let output_ext = if opts.is_gif {
        "gif".to_string()
    } else if opts.is_audio {
        opts.audio_format.clone()
    } else {
        opts.container.clone()
    };

    if !opts.is_audio && !opts.is_gif && input_ext == output_ext {
        tracing::debug!(ext = %input_ext, "Format match, skipping ffmpeg");
        return Ok(Processed { path: input.to_path_buf(), ext: input_ext, skipped: true });
    }

    let args = if opts.is_audio {
        ffmpeg::audio_extract_args(input, output, &opts.audio_format, &opts.audio_bitrate)
    } else if opts.is_gif {
        ffmpeg::gif_args(input, output)
    } else {
        ffmpeg::remux_args(input, output, &opts.container)
    };

    runner::run_ffmpeg(&args, runner::RunOptions { process, on_time: None, timeout: None }).await?;
    Ok(Processed { path: output.to_path_buf(), ext: output_ext, skipped: false })
}

/// Output extension a request resolves to.
pub fn output_ext(is_audio: bool, container: &str, audio_format: &str) -> String {
    if is_audio { audio_format.to_string() } else { container.to_string() }
}

/// Derive the served filename from an original name and a new extension.
pub fn output_filename(original_name: &str, new_ext: &str) -> String {
    let base = Path::new(original_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| original_name.to_string());
    format!("{}.{new_ext}", crate::utils::fs::sanitize_filename(&base))
}

/// Shared request knobs for the download-family pipelines.
#[derive(Debug, Clone)]
pub struct DownloadParams {
    pub is_audio: bool,
    pub audio_format: String,
    pub audio_bitrate: String,
    pub quality: String,
    pub container: String,
    pub playlist: bool,
}

impl Default for DownloadParams {
    fn default() -> Self {
        Self {
            is_audio: false,
            audio_format: "mp3".to_string(),
            audio_bitrate: "320".to_string(),
            quality: "1080p".to_string(),
            container: "mp4".to_string(),
            playlist: false,
        }
    }
}

impl DownloadParams {
    pub fn output_ext(&self) -> String {
        output_ext(self.is_audio, &self.container, &self.audio_format)
    }

    pub fn mime_type(&self, ext: &str, is_gif: bool) -> &'static str {
        config::mime_for(ext, self.is_audio, is_gif)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_ext_prefers_audio_format() {
        assert_eq!(output_ext(true, "mp4", "opus"), "opus");
        assert_eq!(output_ext(false, "mkv", "mp3"), "mkv");
    }

    #[test]
    fn output_filename_sanitizes_and_swaps_ext() {
        assert_eq!(output_filename("My Video.webm", "mp4"), "My Video.mp4");
        assert_eq!(output_filename("weird/..name.mov", "mp3"), "..name.mp3");
        assert_eq!(output_filename("noext", "mp4"), "noext.mp4");
    }

    #[tokio::test]
    async fn matching_container_skips_processing() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.mp4");
        std::fs::write(&input, b"not really video").unwrap();

        let opts = ProcessOpts { container: "mp4".into(), ..Default::default() };
        let out = dir.path().join("out.mp4");
        let processed = process_media(&input, &out, &opts, None).await.unwrap();
        assert!(processed.skipped);
        assert_eq!(processed.path, input);
        assert_eq!(processed.ext, "mp4");
    }

    #[test]
    fn record_sink_updates_record() {
        let record = Arc::new(JobRecord::new(None, None, None));
        let sink = RecordSink { record: record.clone() };
        sink.emit("downloading", "Downloading... 40%", Some(40.0), "1 MiB/s", "00:10");
        assert_eq!(record.state(), JobState::Downloading);
        assert_eq!(record.progress(), 40.0);
        let snap = record.playlist_snapshot();
        assert_eq!(snap.speed, "1 MiB/s");
        assert_eq!(snap.eta, "00:10");
    }
}
