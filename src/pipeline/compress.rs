//! Compress pipeline.
//!
//! Two modes. Quality mode runs a single CRF pass picked from the preset
//! table. Size mode computes the video bitrate that fits the target (95% of
//! the byte budget minus audio), walks the resolution ladder, and runs a
//! two-pass encode with maxrate 1.5x / bufsize 2x; sources already under the
//! target are stream-copied. Progress maps pass 1 to 0..45 and pass 2 to
//! 50..95, deduplicated below 2-point deltas.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::{self, JobType, TempDir};
use crate::error::{Error, Result};
use crate::jobs::{JobOutput, JobRecord, JobState};
use crate::media::{ffmpeg, probe, runner};
use crate::process::ProcessHandle;
use crate::services::ServiceContainer;
use crate::utils::short_id;

#[derive(Debug, Clone)]
pub struct CompressRequest {
    /// "quality" or "size".
    pub mode: String,
    pub quality: String,
    pub preset: String,
    pub denoise: String,
    pub target_mb: f64,
    /// Client-supplied duration hint; probed when missing.
    pub duration_secs: f64,
    pub downscale: bool,
}

/// Validate the knobs against the allow-lists.
pub fn validate_request(request: &CompressRequest) -> std::result::Result<(), String> {
    if !config::ALLOWED_MODES.contains(&request.mode.as_str()) {
        return Err("Invalid mode".to_string());
    }
    if !config::ALLOWED_QUALITIES.contains(&request.quality.as_str()) {
        return Err("Invalid quality".to_string());
    }
    if !config::ALLOWED_PRESETS.contains(&request.preset.as_str()) {
        return Err("Invalid preset".to_string());
    }
    if !config::ALLOWED_DENOISE.contains(&request.denoise.as_str()) {
        return Err("Invalid denoise option".to_string());
    }
    if request.mode == "size" && (request.target_mb.is_nan() || request.target_mb <= 0.0) {
        return Err("Invalid target size".to_string());
    }
    Ok(())
}

/// Run a compress job to its terminal state. Admission for `compress` has
/// already happened; this owns release and cleanup.
pub async fn run(
    services: Arc<ServiceContainer>,
    job_id: String,
    record: Arc<JobRecord>,
    input_path: PathBuf,
    original_name: String,
    request: CompressRequest,
) {
    let output_path = TempDir::Compress.path().join(format!("{job_id}-compressed.mp4"));
    let pass_log = TempDir::Compress.path().join(format!("{job_id}-pass"));
    let handle = Arc::new(
        ProcessHandle::new(JobType::Compress).with_temp_file(output_path.clone()),
    );
    services.processes.insert(&job_id, handle.clone());

    info!(
        job = %short_id(&job_id),
        mode = %request.mode,
        preset = %request.preset,
        "Compressing"
    );

    let result =
        run_inner(&job_id, &record, &input_path, &output_path, &pass_log, &original_name, &request, &handle)
            .await;

    // Pass logs are droppings either way.
    let _ = tokio::fs::remove_file(format!("{}-0.log", pass_log.display())).await;
    let _ = tokio::fs::remove_file(format!("{}-0.log.mbtree", pass_log.display())).await;

    if let Err(e) = result {
        let cancelled = e.is_cancelled();
        warn!(job = %short_id(&job_id), error = %e, "Compression failed");
        if cancelled {
            record.cancel(e.user_message());
        } else {
            services.alerts.compression_failed(&job_id, &e.to_string());
            record.fail(e.user_message(), e.to_string());
        }
        let _ = tokio::fs::remove_file(&input_path).await;
        let _ = tokio::fs::remove_file(&output_path).await;
        services.schedule_file_cleanup(&job_id, std::time::Duration::from_secs(2));
    }

    services.release_job(&job_id);
}

#[allow(clippy::too_many_arguments)]
async fn run_inner(
    job_id: &str,
    record: &Arc<JobRecord>,
    input_path: &Path,
    output_path: &Path,
    pass_log: &Path,
    original_name: &str,
    request: &CompressRequest,
    handle: &Arc<ProcessHandle>,
) -> Result<()> {
    record.set_state(JobState::Compressing);
    record.set_message("Analyzing video...");

    if !probe::is_valid_video(input_path).await {
        return Err(Error::Validation("File does not contain valid video".to_string()));
    }

    let probe_info = probe::probe_video(input_path).await;
    let duration = if request.duration_secs > 0.0 { request.duration_secs } else { probe_info.duration };
    let source_mb = crate::utils::fs::file_size(input_path).await as f64 / (1024.0 * 1024.0);
    let source_bitrate_mbps = source_mb * 8.0 / duration;

    let preset = config::compression_preset(&request.preset);
    let denoise_filter = ffmpeg::resolve_denoise_filter(
        &request.denoise,
        probe_info.height,
        source_bitrate_mbps,
        preset.denoise,
    );
    let downscale_width = if request.downscale {
        ffmpeg::downscale_resolution(probe_info.width, probe_info.height)
    } else {
        0
    };

    if request.mode == "quality" {
        let crf = preset.crf(&request.quality);
        let vf = ffmpeg::build_video_filters(denoise_filter, downscale_width, probe_info.width);

        record.set_progress_message(5.0, format!("Encoding ({})...", request.preset));

        let args = ffmpeg::crf_encode_args(
            input_path,
            output_path,
            crf,
            preset.ffmpeg_preset,
            &vf,
            preset.x264_params,
        );
        run_pass(&args, handle, record, duration, 0.0, 95.0, "Encoding").await?;
    } else if source_mb <= request.target_mb {
        // Already small enough: remux only.
        record.set_progress_message(50.0, "Already under target...");
        let args = remux_copy_args(input_path, output_path);
        runner::run_ffmpeg(
            &args,
            runner::RunOptions { process: Some(handle.clone()), on_time: None, timeout: None },
        )
        .await
        .map_err(|e| match e {
            Error::Cancelled => Error::Cancelled,
            _ => Error::Encoding("Remux failed".to_string()),
        })?;
    } else {
        let video_bitrate_k = ffmpeg::calculate_target_bitrate(request.target_mb, duration, 96);
        let resolution = ffmpeg::select_resolution(probe_info.width, probe_info.height, video_bitrate_k);
        let scale_width = if downscale_width == 0 && resolution.needs_scale {
            resolution.width
        } else {
            downscale_width
        };
        let vf = ffmpeg::build_video_filters(denoise_filter, scale_width, probe_info.width);

        record.set_progress_message(5.0, "Pass 1/2 - Analyzing...");
        let pass1 = ffmpeg::two_pass_args(
            1,
            input_path,
            output_path,
            pass_log,
            video_bitrate_k,
            preset.ffmpeg_preset,
            &vf,
            preset.x264_params,
        );
        run_pass(&pass1, handle, record, duration, 0.0, 45.0, "Pass 1/2").await?;
        if handle.is_cancelled() {
            return Err(Error::Cancelled);
        }

        record.set_progress_message(50.0, "Pass 2/2 - Encoding...");
        let pass2 = ffmpeg::two_pass_args(
            2,
            input_path,
            output_path,
            pass_log,
            video_bitrate_k,
            preset.ffmpeg_preset,
            &vf,
            preset.x264_params,
        );
        run_pass(&pass2, handle, record, duration, 50.0, 45.0, "Pass 2/2").await?;
    }

    let _ = tokio::fs::remove_file(input_path).await;

    let size = runner::check_output(output_path, 1)
        .await
        .map_err(|_| Error::Encoding("output file not found after compression".to_string()))?;

    let base = Path::new(original_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| original_name.to_string());
    let output_filename = format!("{}_compressed.mp4", crate::utils::fs::sanitize_filename(&base));

    info!(
        job = %short_id(job_id),
        mb = %format!("{:.2}", size as f64 / (1024.0 * 1024.0)),
        "Compression complete"
    );
    record.complete(
        JobOutput {
            path: Some(output_path.to_path_buf()),
            filename: output_filename,
            mime_type: "video/mp4".to_string(),
        },
        "Complete!",
    );
    Ok(())
}

/// One encode pass mapped onto `[base, base+range]` of the job's progress,
/// emitting only on >=2-point movement.
async fn run_pass(
    args: &[String],
    handle: &Arc<ProcessHandle>,
    record: &Arc<JobRecord>,
    duration: f64,
    base: f64,
    range: f64,
    label: &'static str,
) -> Result<()> {
    let record = record.clone();
    let last_reported = Mutex::new(base);
    let on_time: runner::TimeProgressFn = Arc::new(move |secs, speed| {
        let progress = (base + (secs / duration) * range).min(base + range);
        {
            let mut last = last_reported.lock();
            if progress <= *last + 2.0 {
                return;
            }
            *last = progress;
        }
        let pct = ((progress - base) / range * 100.0) as u32;
        let eta = speed
            .filter(|s| *s > 0.0)
            .map(|s| crate::utils::format_eta((duration - secs) / s))
            .unwrap_or_default();
        let message = if eta.is_empty() {
            format!("{label} - {pct}%")
        } else {
            format!("{label} - {pct}% (ETA: {eta})")
        };
        record.set_progress_message(progress.round(), message);
    });

    runner::run_ffmpeg(
        args,
        runner::RunOptions { process: Some(handle.clone()), on_time: Some(on_time), timeout: None },
    )
    .await
}

fn remux_copy_args(input: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-c:v".to_string(),
        "copy".to_string(),
        "-c:a".to_string(),
        "copy".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CompressRequest {
        CompressRequest {
            mode: "size".into(),
            quality: "medium".into(),
            preset: "balanced".into(),
            denoise: "auto".into(),
            target_mb: 25.0,
            duration_secs: 60.0,
            downscale: false,
        }
    }

    #[test]
    fn validates_allow_lists() {
        assert!(validate_request(&request()).is_ok());

        let mut r = request();
        r.mode = "crush".into();
        assert!(validate_request(&r).is_err());

        let mut r = request();
        r.preset = "turbo".into();
        assert!(validate_request(&r).is_err());

        let mut r = request();
        r.denoise = "max".into();
        assert!(validate_request(&r).is_err());
    }

    #[test]
    fn size_mode_requires_positive_target() {
        let mut r = request();
        r.target_mb = 0.0;
        assert!(validate_request(&r).is_err());
        r.target_mb = f64::NAN;
        assert!(validate_request(&r).is_err());

        // Quality mode ignores the target.
        r.mode = "quality".into();
        assert!(validate_request(&r).is_ok());
    }

    #[test]
    fn remux_args_copy_both_streams() {
        let args = remux_copy_args(Path::new("/in.mp4"), Path::new("/out.mp4"));
        let joined = args.join(" ");
        assert!(joined.contains("-c:v copy"));
        assert!(joined.contains("-c:a copy"));
        assert!(joined.contains("+faststart"));
    }
}
