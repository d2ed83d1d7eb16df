//! Transcribe pipeline.
//!
//! Extracts a 16 kHz mono WAV, hands it to the transcription worker (a
//! python script wrapping whisper), and turns the result into a transcript,
//! a subtitle file, or a caption burn-in. The worker reports per-segment
//! progress as JSON lines on stderr and a final JSON verdict on stdout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::{JobType, TempDir};
use crate::error::{Error, Result};
use crate::jobs::{JobOutput, JobRecord};
use crate::media::{ffmpeg, probe, runner};
use crate::process::ProcessHandle;
use crate::services::ServiceContainer;
use crate::utils::short_id;

const LOCAL_MODELS: [&str; 4] = ["tiny", "base", "small", "medium"];
const API_MODELS: [&str; 1] = ["large"];
const OUTPUT_MODES: [&str; 3] = ["subtitles", "captions", "text"];
const SUBTITLE_FORMATS: [&str; 2] = ["srt", "ass"];

/// The caption burn-in re-encode gets a hard wall-clock bound.
const CAPTION_BURN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct TranscribeRequest {
    pub output_mode: String,
    pub model: String,
    pub subtitle_format: String,
    pub language: String,
    pub caption_size: u32,
    pub max_words_per_caption: u32,
    pub max_chars_per_line: u32,
    pub min_duration: f64,
    pub caption_gap: f64,
}

impl Default for TranscribeRequest {
    fn default() -> Self {
        Self {
            output_mode: "text".to_string(),
            model: "base".to_string(),
            subtitle_format: "srt".to_string(),
            language: String::new(),
            caption_size: 72,
            max_words_per_caption: 0,
            max_chars_per_line: 0,
            min_duration: 0.0,
            caption_gap: 0.0,
        }
    }
}

/// Validate modes, models and caption styling bounds.
pub fn validate_request(
    request: &TranscribeRequest,
    has_api_key: bool,
) -> std::result::Result<(), String> {
    if !OUTPUT_MODES.contains(&request.output_mode.as_str()) {
        return Err(format!("Invalid output mode. Allowed: {}", OUTPUT_MODES.join(", ")));
    }
    let is_api_model = API_MODELS.contains(&request.model.as_str());
    if !LOCAL_MODELS.contains(&request.model.as_str()) && !is_api_model {
        return Err(format!(
            "Invalid model. Allowed: {}, {}",
            LOCAL_MODELS.join(", "),
            API_MODELS.join(", ")
        ));
    }
    if is_api_model && !has_api_key {
        return Err(
            "Large model requires API configuration. Use a local model (tiny/base/small/medium)."
                .to_string(),
        );
    }
    if request.output_mode == "subtitles"
        && !SUBTITLE_FORMATS.contains(&request.subtitle_format.as_str())
    {
        return Err(format!(
            "Invalid subtitle format. Allowed: {}",
            SUBTITLE_FORMATS.join(", ")
        ));
    }
    if !request.language.is_empty()
        && !(request.language.len() >= 2
            && request.language.len() <= 5
            && request.language.chars().all(|c| c.is_ascii_alphabetic()))
    {
        return Err("Invalid language code. Use 2-5 letter code (e.g. en, es, ja).".to_string());
    }

    if request.output_mode != "text" {
        if request.caption_size != 72 && !(40..=120).contains(&request.caption_size) {
            return Err("captionSize must be an integer between 40 and 120.".to_string());
        }
        if request.max_words_per_caption != 0 && !(1..=20).contains(&request.max_words_per_caption)
        {
            return Err("maxWordsPerCaption must be an integer between 1 and 20.".to_string());
        }
        if request.max_chars_per_line != 0 && !(10..=80).contains(&request.max_chars_per_line) {
            return Err("maxCharsPerLine must be an integer between 10 and 80.".to_string());
        }
        if request.min_duration != 0.0 && !(0.1..=5.0).contains(&request.min_duration) {
            return Err("minDuration must be between 0.1 and 5 seconds.".to_string());
        }
        if request.caption_gap != 0.0 && !(0.0..=1.0).contains(&request.caption_gap) {
            return Err("captionGap must be between 0 and 1 seconds.".to_string());
        }
    }
    Ok(())
}

/// Run a transcribe job to its terminal state. Admission for `transcribe`
/// has already happened; this owns release and cleanup.
pub async fn run(
    services: Arc<ServiceContainer>,
    job_id: String,
    record: Arc<JobRecord>,
    input_path: PathBuf,
    original_name: String,
    request: TranscribeRequest,
) {
    let handle = Arc::new(ProcessHandle::new(JobType::Transcribe));
    services.processes.insert(&job_id, handle.clone());

    info!(
        job = %short_id(&job_id),
        mode = %request.output_mode,
        model = %request.model,
        "Transcribing"
    );

    let whisper_format = match request.output_mode.as_str() {
        "text" => "txt",
        "subtitles" => request.subtitle_format.as_str(),
        _ => "ass",
    };
    let wav_path = TempDir::Transcribe.path().join(format!("{job_id}.wav"));
    let worker_output = TempDir::Transcribe.path().join(format!("{job_id}.{whisper_format}"));
    let captioned_path = TempDir::Transcribe.path().join(format!("{job_id}-captioned.mp4"));

    let result = run_inner(
        &services,
        &job_id,
        &record,
        &input_path,
        &wav_path,
        &worker_output,
        &captioned_path,
        &original_name,
        &request,
        &handle,
    )
    .await;

    if let Err(e) = result {
        let cancelled = e.is_cancelled();
        warn!(job = %short_id(&job_id), error = %e, "Transcription failed");
        if cancelled {
            record.cancel(e.user_message());
        } else {
            services.alerts.transcription_failed(&job_id, &e.to_string());
            record.fail(e.user_message(), e.to_string());
        }
        for path in [&input_path, &wav_path, &worker_output, &captioned_path] {
            let _ = tokio::fs::remove_file(path).await;
        }
    }

    services.release_job(&job_id);
}

#[derive(Debug, Deserialize)]
struct WorkerProgress {
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct WorkerResult {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: String,
    #[serde(default, rename = "segmentCount")]
    segment_count: usize,
    #[serde(default)]
    language: String,
}

#[allow(clippy::too_many_arguments)]
async fn run_inner(
    services: &ServiceContainer,
    job_id: &str,
    record: &Arc<JobRecord>,
    input_path: &Path,
    wav_path: &Path,
    worker_output: &Path,
    captioned_path: &Path,
    original_name: &str,
    request: &TranscribeRequest,
    handle: &Arc<ProcessHandle>,
) -> Result<()> {
    record.set_progress_message(1.0, "Analyzing file...");

    let has_video = probe::has_stream(input_path, "v:0", "video").await;
    let has_audio = probe::has_stream(input_path, "a:0", "audio").await;
    if !has_audio {
        return Err(Error::Validation("No audio found in file".to_string()));
    }
    if request.output_mode == "captions" && !has_video {
        return Err(Error::Validation(
            "Captions mode requires a video file (no video stream found)".to_string(),
        ));
    }

    record.set_progress_message(2.0, "Extracting audio...");
    let wav_args = ffmpeg::wav_extract_args(input_path, wav_path);
    runner::run_ffmpeg(
        &wav_args,
        runner::RunOptions { process: Some(handle.clone()), on_time: None, timeout: None },
    )
    .await
    .map_err(|e| match e {
        Error::Cancelled => Error::Cancelled,
        _ => Error::Encoding("Audio extraction failed".to_string()),
    })?;

    if crate::utils::fs::file_size(wav_path).await < 1000 {
        return Err(Error::Validation("No audio found in file".to_string()));
    }

    record.set_progress_message(5.0, "Starting transcription...");
    let worker = run_worker(services, job_id, record, wav_path, worker_output, request, handle).await?;
    info!(
        job = %short_id(job_id),
        segments = worker.segment_count,
        language = %worker.language,
        "Transcription worker done"
    );

    let base = Path::new(original_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| original_name.to_string());
    let safe_name = crate::utils::fs::sanitize_filename(&base);

    match request.output_mode.as_str() {
        "text" => {
            record.set_progress_message(90.0, "Preparing transcript...");
            let text = tokio::fs::read_to_string(worker_output)
                .await
                .map_err(|e| Error::Other(format!("Failed to read transcript: {e}")))?;
            record.set_text_content(text);
            record.complete(
                JobOutput {
                    path: Some(worker_output.to_path_buf()),
                    filename: format!("{safe_name}_transcript.txt"),
                    mime_type: "text/plain".to_string(),
                },
                "Transcription complete!",
            );
        }
        "subtitles" => {
            record.set_progress_message(90.0, "Preparing subtitles...");
            let mime_type = if request.subtitle_format == "ass" {
                "text/x-ssa"
            } else {
                "application/x-subrip"
            };
            record.complete(
                JobOutput {
                    path: Some(worker_output.to_path_buf()),
                    filename: format!("{safe_name}.{}", request.subtitle_format),
                    mime_type: mime_type.to_string(),
                },
                "Transcription complete!",
            );
        }
        _ => {
            record.set_progress_message(86.0, "Burning captions into video...");
            let duration = probe::probe_duration(input_path).await;

            let args = ffmpeg::caption_burn_args(input_path, worker_output, captioned_path);
            let record_progress = record.clone();
            let on_time: runner::TimeProgressFn = Arc::new(move |secs, _| {
                if duration > 0.0 {
                    let progress = (86.0 + (secs / duration) * 13.0).min(99.0);
                    record_progress.set_progress_message(
                        progress,
                        format!("Burning captions... {}%", (secs / duration * 100.0) as u32),
                    );
                }
            });
            runner::run_ffmpeg(
                &args,
                runner::RunOptions {
                    process: Some(handle.clone()),
                    on_time: Some(on_time),
                    timeout: Some(CAPTION_BURN_TIMEOUT),
                },
            )
            .await
            .map_err(|e| match e {
                Error::Cancelled => Error::Cancelled,
                _ => Error::Encoding("Caption burn-in failed".to_string()),
            })?;

            record.complete(
                JobOutput {
                    path: Some(captioned_path.to_path_buf()),
                    filename: format!("{safe_name}_captioned.mp4"),
                    mime_type: "video/mp4".to_string(),
                },
                "Captions burned in!",
            );
        }
    }

    let _ = tokio::fs::remove_file(wav_path).await;
    let _ = tokio::fs::remove_file(input_path).await;
    if request.output_mode == "captions" {
        let _ = tokio::fs::remove_file(worker_output).await;
    }
    Ok(())
}

/// Invoke the transcription worker, mapping its 0..95 progress into the
/// job's 5..85 band.
async fn run_worker(
    services: &ServiceContainer,
    job_id: &str,
    record: &Arc<JobRecord>,
    wav_path: &Path,
    worker_output: &Path,
    request: &TranscribeRequest,
    handle: &Arc<ProcessHandle>,
) -> Result<WorkerResult> {
    let whisper_format = worker_output
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "txt".to_string());

    let mut args = vec![
        services.config.whisper_script.clone(),
        "--input".to_string(),
        wav_path.to_string_lossy().into_owned(),
        "--model".to_string(),
        request.model.clone(),
        "--output-format".to_string(),
        whisper_format,
        "--output".to_string(),
        worker_output.to_string_lossy().into_owned(),
    ];
    if !request.language.is_empty() {
        args.push("--language".to_string());
        args.push(request.language.clone());
    }
    if API_MODELS.contains(&request.model.as_str()) {
        args.push("--use-api".to_string());
    }
    if request.output_mode != "text" {
        if request.caption_size != 72 {
            args.push("--font-size".to_string());
            args.push(request.caption_size.to_string());
        }
        if request.max_words_per_caption > 0 {
            args.push("--max-words-per-caption".to_string());
            args.push(request.max_words_per_caption.to_string());
        }
        if request.max_chars_per_line > 0 {
            args.push("--max-chars-per-line".to_string());
            args.push(request.max_chars_per_line.to_string());
        }
        if request.min_duration > 0.0 {
            args.push("--min-duration".to_string());
            args.push(format!("{:.2}", request.min_duration));
        }
        if request.caption_gap > 0.0 {
            args.push("--gap".to_string());
            args.push(format!("{:.2}", request.caption_gap));
        }
    }

    let mut child = Command::new("python3")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Other(format!("Failed to start transcription worker: {e}")))?;

    handle.set_pid(child.id());

    // stderr: one JSON progress object per line.
    let stderr = child.stderr.take();
    let record_progress = record.clone();
    let progress_task = tokio::spawn(async move {
        let Some(stderr) = stderr else { return };
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            if let Ok(progress) = serde_json::from_str::<WorkerProgress>(&line) {
                if progress.progress > 0.0 {
                    let mapped = (5.0 + (progress.progress / 95.0) * 80.0).min(85.0);
                    let message = if progress.message.is_empty() {
                        "Transcribing...".to_string()
                    } else {
                        progress.message
                    };
                    record_progress.set_progress_message(mapped, message);
                }
            }
        }
    });

    let mut stdout = child.stdout.take();
    let stdout_task = tokio::spawn(async move {
        let mut collected = Vec::new();
        if let Some(stdout) = stdout.as_mut() {
            let _ = stdout.read_to_end(&mut collected).await;
        }
        collected
    });

    let cancel = handle.token();
    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            None
        }
    };

    let _ = progress_task.await;
    let stdout_bytes = stdout_task.await.unwrap_or_default();

    handle.set_pid(None);
    if handle.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let worker_result: WorkerResult = serde_json::from_slice(&stdout_bytes).unwrap_or_default();
    if !worker_result.success {
        let message = if !worker_result.error.is_empty() {
            worker_result.error.clone()
        } else if let Some(Ok(status)) = status {
            format!("Whisper process exited with error: {status}")
        } else {
            "Transcription failed".to_string()
        };
        return Err(Error::Upstream(message));
    }
    Ok(worker_result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> TranscribeRequest {
        TranscribeRequest::default()
    }

    #[test]
    fn validates_modes_and_models() {
        assert!(validate_request(&request(), false).is_ok());

        let mut r = request();
        r.output_mode = "karaoke".into();
        assert!(validate_request(&r, false).is_err());

        let mut r = request();
        r.model = "huge".into();
        assert!(validate_request(&r, false).is_err());
    }

    #[test]
    fn api_model_requires_key() {
        let mut r = request();
        r.model = "large".into();
        assert!(validate_request(&r, false).unwrap_err().contains("API configuration"));
        assert!(validate_request(&r, true).is_ok());
    }

    #[test]
    fn subtitle_format_checked_in_subtitles_mode() {
        let mut r = request();
        r.output_mode = "subtitles".into();
        r.subtitle_format = "vtt".into();
        assert!(validate_request(&r, false).is_err());
        r.subtitle_format = "ass".into();
        assert!(validate_request(&r, false).is_ok());
    }

    #[test]
    fn language_codes() {
        let mut r = request();
        r.language = "en".into();
        assert!(validate_request(&r, false).is_ok());
        r.language = "yue".into();
        assert!(validate_request(&r, false).is_ok());
        r.language = "e".into();
        assert!(validate_request(&r, false).is_err());
        r.language = "en-US".into();
        assert!(validate_request(&r, false).is_err());
    }

    #[test]
    fn caption_bounds_only_apply_outside_text_mode() {
        let mut r = request();
        r.output_mode = "captions".into();
        r.caption_size = 30;
        assert!(validate_request(&r, false).is_err());
        r.caption_size = 40;
        assert!(validate_request(&r, false).is_ok());
        r.max_words_per_caption = 21;
        assert!(validate_request(&r, false).is_err());
        r.max_words_per_caption = 20;
        r.min_duration = 5.5;
        assert!(validate_request(&r, false).is_err());
        r.min_duration = 0.5;
        r.caption_gap = 1.5;
        assert!(validate_request(&r, false).is_err());

        // Text mode ignores styling entirely.
        let mut r = request();
        r.caption_size = 10;
        assert!(validate_request(&r, false).is_ok());
    }

    #[test]
    fn worker_result_parses_loosely() {
        let ok: WorkerResult =
            serde_json::from_str(r#"{"success":true,"segmentCount":42,"language":"en"}"#).unwrap();
        assert!(ok.success);
        assert_eq!(ok.segment_count, 42);

        let bad: WorkerResult = serde_json::from_slice(b"garbage").unwrap_or_default();
        assert!(!bad.success);
    }
}
