//! Convert pipeline.
//!
//! Takes an uploaded (or URL-fetched) file to a target container or audio
//! format. Stream-copies when `reencode=auto` finds the source codec
//! already compatible; otherwise re-encodes at a quality-mapped CRF.
//! Supports trim windows, center crops (ratio allow-list or raw box) and
//! multi-segment extraction with a concat-demux join.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{self, JobType, TempDir};
use crate::error::{Error, Result};
use crate::jobs::{JobOutput, JobRecord};
use crate::media::{ffmpeg, probe, runner};
use crate::process::ProcessHandle;
use crate::services::ServiceContainer;
use crate::utils::short_id;
use crate::utils::url::validate_time_param;

/// One extraction window.
#[derive(Debug, Clone, Copy, serde::Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ConvertRequest {
    pub format: String,
    pub quality: String,
    pub reencode: String,
    pub start_time: String,
    pub end_time: String,
    pub audio_bitrate: String,
    pub crop_ratio: String,
    pub raw_crop: Option<(u32, u32, u32, u32)>,
    pub segments: Vec<Segment>,
}

/// Validate the parts of a convert request that do not need the input file.
/// Returns the user-facing reason on failure.
pub fn validate_request(request: &ConvertRequest) -> std::result::Result<(), String> {
    if !config::ALLOWED_FORMATS.contains(&request.format.as_str()) {
        return Err(format!(
            "Invalid format. Allowed: {}",
            config::ALLOWED_FORMATS.join(", ")
        ));
    }
    if !request.reencode.is_empty() && !config::ALLOWED_REENCODES.contains(&request.reencode.as_str())
    {
        return Err("Invalid reencode option".to_string());
    }
    if !request.crop_ratio.is_empty()
        && !config::ALLOWED_CROP_RATIOS.contains(&request.crop_ratio.as_str())
    {
        return Err("Invalid crop ratio".to_string());
    }
    if let Some((_, _, w, h)) = request.raw_crop {
        if w == 0 || h == 0 || w % 2 != 0 || h % 2 != 0 {
            return Err("Invalid crop dimensions".to_string());
        }
    }
    if !request.start_time.is_empty() && validate_time_param(&request.start_time).is_none() {
        return Err("Invalid startTime format".to_string());
    }
    if !request.end_time.is_empty() && validate_time_param(&request.end_time).is_none() {
        return Err("Invalid endTime format".to_string());
    }
    if request.segments.len() > config::MAX_SEGMENTS {
        return Err(format!("Too many segments (max {})", config::MAX_SEGMENTS));
    }
    for segment in &request.segments {
        if segment.end <= segment.start || segment.start < 0.0 {
            return Err("Invalid segment range".to_string());
        }
    }
    Ok(())
}

/// Run a convert job to its terminal state. Admission for `convert` has
/// already happened; this owns release and input cleanup.
pub async fn run(
    services: Arc<ServiceContainer>,
    job_id: String,
    record: Arc<JobRecord>,
    input_path: PathBuf,
    original_name: String,
    request: ConvertRequest,
) {
    let output_path = TempDir::Convert.path().join(format!("{job_id}-converted.{}", request.format));
    let handle = Arc::new(
        ProcessHandle::new(JobType::Convert).with_temp_file(output_path.clone()),
    );
    services.processes.insert(&job_id, handle.clone());

    info!(job = %short_id(&job_id), format = %request.format, "Converting");

    match run_inner(&job_id, &record, &input_path, &output_path, &original_name, &request, &handle).await
    {
        Ok(()) => {}
        Err(e) => {
            let cancelled = e.is_cancelled();
            warn!(job = %short_id(&job_id), error = %e, "Conversion failed");
            if cancelled {
                record.cancel(e.user_message());
            } else {
                services.alerts.conversion_failed(&job_id, &request.format, &e.to_string());
                record.fail(e.user_message(), e.to_string());
            }
            let _ = tokio::fs::remove_file(&input_path).await;
            let _ = tokio::fs::remove_file(&output_path).await;
            // The output is gone; sweep whatever intermediates remain.
            services.schedule_file_cleanup(&job_id, std::time::Duration::from_secs(2));
        }
    }

    services.release_job(&job_id);
}

#[allow(clippy::too_many_arguments)]
async fn run_inner(
    job_id: &str,
    record: &Arc<JobRecord>,
    input_path: &Path,
    output_path: &Path,
    original_name: &str,
    request: &ConvertRequest,
    handle: &Arc<ProcessHandle>,
) -> Result<()> {
    let is_audio = config::is_audio_format(&request.format);
    let has_segments = request.segments.len() > 1;

    record.set_progress_message(5.0, "Analyzing file...");

    let mut duration = probe::probe_duration(input_path).await;
    if duration <= 0.0 {
        duration = 60.0;
    }

    let probe_info = probe::probe_video(input_path).await;
    let crop_filter = if request.raw_crop.is_some() || !request.crop_ratio.is_empty() {
        let ratio = if request.crop_ratio.is_empty() { None } else { Some(request.crop_ratio.as_str()) };
        let filter = ffmpeg::build_crop_filter(&probe_info, ratio, request.raw_crop);
        if !filter.is_empty() {
            info!(job = %short_id(job_id), filter = %filter, "Applying crop");
        }
        filter
    } else {
        String::new()
    };
    let has_crop = !crop_filter.is_empty();

    // reencode=auto falls back to stream copy only when the source codec is
    // at home in the target container; crops and segments always re-encode.
    let needs_reencode = request.reencode == "always" || has_crop || has_segments || {
        if !is_audio && request.reencode != "never" {
            !ffmpeg::codec_compatible(&request.format, &probe_info.codec)
        } else {
            false
        }
    };

    let crf = match request.quality.as_str() {
        "high" => 18,
        "low" => 28,
        _ => 23,
    };

    let build_args = |seg_start: f64, seg_end: f64, out_file: &Path| -> Vec<String> {
        let mut args = vec!["-y".to_string()];
        if seg_start > 0.0 {
            args.push("-ss".to_string());
            args.push(format!("{seg_start:.3}"));
        }
        if seg_end < duration {
            args.push("-to".to_string());
            args.push(format!("{seg_end:.3}"));
        }
        args.push("-i".to_string());
        args.push(input_path.to_string_lossy().into_owned());
        args.push("-threads".to_string());
        args.push("0".to_string());

        if is_audio {
            args.extend(ffmpeg::audio_codec_args(&request.format, &request.audio_bitrate));
            args.push("-vn".to_string());
        } else if needs_reencode {
            if has_crop {
                args.push("-vf".to_string());
                args.push(crop_filter.clone());
            }
            args.extend(ffmpeg::video_codec_args(&request.format, crf));
        } else {
            args.push("-codec".to_string());
            args.push("copy".to_string());
        }

        if !is_audio && (request.format == "mp4" || request.format == "mov") {
            args.push("-movflags".to_string());
            args.push("+faststart".to_string());
        }
        args.push(out_file.to_string_lossy().into_owned());
        args
    };

    if has_segments {
        info!(job = %short_id(job_id), segments = request.segments.len(), "Processing segments");
        record.set_progress_message(10.0, format!("Processing segment 1/{}...", request.segments.len()));

        let total_duration: f64 = request.segments.iter().map(|s| s.end - s.start).sum();
        let mut processed_duration = 0.0f64;
        let mut clip_paths: Vec<PathBuf> = Vec::new();

        for (i, segment) in request.segments.iter().enumerate() {
            let clip_path =
                TempDir::Convert.path().join(format!("{job_id}-clip{i}.{}", request.format));
            clip_paths.push(clip_path.clone());

            let seg_duration = segment.end - segment.start;
            let args = build_args(segment.start, segment.end, &clip_path);

            record.set_message(format!("Processing segment {}/{}...", i + 1, request.segments.len()));

            let record_progress = record.clone();
            let seg_count = request.segments.len();
            let done_before = processed_duration;
            let on_time: runner::TimeProgressFn = Arc::new(move |secs, _| {
                let seg_progress = (secs / seg_duration).min(1.0);
                let overall =
                    (10.0 + ((done_before + seg_duration * seg_progress) / total_duration) * 75.0)
                        .min(85.0);
                record_progress.set_progress_message(
                    overall.round(),
                    format!(
                        "Segment {}/{}... {}%",
                        i + 1,
                        seg_count,
                        (seg_progress * 100.0) as u32
                    ),
                );
            });

            runner::run_ffmpeg(
                &args,
                runner::RunOptions {
                    process: Some(handle.clone()),
                    on_time: Some(on_time),
                    timeout: None,
                },
            )
            .await
            .map_err(|e| match e {
                Error::Cancelled => Error::Cancelled,
                _ => {
                    for clip in &clip_paths {
                        let _ = std::fs::remove_file(clip);
                    }
                    Error::Encoding(format!("Segment {} failed", i + 1))
                }
            })?;
            processed_duration += seg_duration;
        }

        // Join with stream copy via the concat demuxer.
        let concat_list = TempDir::Convert.path().join(format!("{job_id}-concat.txt"));
        let mut list_content = String::new();
        for clip in &clip_paths {
            let escaped = clip.to_string_lossy().replace('\'', "'\\''");
            list_content.push_str(&format!("file '{escaped}'\n"));
        }
        tokio::fs::write(&concat_list, list_content).await?;

        record.set_progress_message(90.0, "Joining segments...");
        let concat_args = ffmpeg::concat_args(&concat_list, output_path, &request.format);
        let concat_result = runner::run_ffmpeg(
            &concat_args,
            runner::RunOptions { process: Some(handle.clone()), on_time: None, timeout: None },
        )
        .await;

        for clip in &clip_paths {
            let _ = tokio::fs::remove_file(clip).await;
        }
        let _ = tokio::fs::remove_file(&concat_list).await;

        concat_result.map_err(|e| match e {
            Error::Cancelled => Error::Cancelled,
            _ => Error::Encoding("Failed to join segments".to_string()),
        })?;
    } else {
        let start = validate_time_param(&request.start_time)
            .and_then(|t| parse_time_secs(t))
            .unwrap_or(0.0);
        let end = validate_time_param(&request.end_time)
            .and_then(|t| parse_time_secs(t))
            .unwrap_or(duration);

        let args = build_args(start, end, output_path);
        record.set_progress_message(10.0, "Converting...");

        let record_progress = record.clone();
        let on_time: runner::TimeProgressFn = Arc::new(move |secs, speed| {
            let progress = (10.0 + (secs / duration) * 85.0).min(95.0);
            let eta = speed
                .filter(|s| *s > 0.0)
                .map(|s| crate::utils::format_eta((duration - secs) / s))
                .unwrap_or_default();
            let message = if eta.is_empty() {
                format!("Converting... {}%", progress as u32)
            } else {
                format!("Converting... {}% (ETA: {eta})", progress as u32)
            };
            record_progress.set_progress_message(progress.round(), message);
        });

        runner::run_ffmpeg(
            &args,
            runner::RunOptions {
                process: Some(handle.clone()),
                on_time: Some(on_time),
                timeout: None,
            },
        )
        .await
        .map_err(|e| match e {
            Error::Cancelled => Error::Cancelled,
            _ => Error::Encoding("Conversion failed".to_string()),
        })?;
    }

    let _ = tokio::fs::remove_file(input_path).await;
    runner::check_output(output_path, 1).await?;

    let output_filename = super::output_filename(original_name, &request.format);
    let mime_type = config::mime_for(&request.format, is_audio, false).to_string();

    info!(job = %short_id(job_id), "Conversion complete");
    record.complete(
        JobOutput {
            path: Some(output_path.to_path_buf()),
            filename: output_filename,
            mime_type,
        },
        "Conversion complete!",
    );
    Ok(())
}

/// Seconds from either a bare number or a clock string.
fn parse_time_secs(value: &str) -> Option<f64> {
    if let Ok(secs) = value.parse::<f64>() {
        return Some(secs);
    }
    let parts: Vec<&str> = value.split(':').collect();
    let mut secs = 0.0;
    for part in &parts {
        secs = secs * 60.0 + part.parse::<f64>().ok()?;
    }
    Some(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ConvertRequest {
        ConvertRequest {
            format: "mp4".into(),
            quality: "medium".into(),
            reencode: "auto".into(),
            audio_bitrate: "128".into(),
            ..Default::default()
        }
    }

    #[test]
    fn validates_format_allow_list() {
        let mut r = request();
        assert!(validate_request(&r).is_ok());
        r.format = "avi".into();
        assert!(validate_request(&r).unwrap_err().contains("Invalid format"));
    }

    #[test]
    fn validates_crop() {
        let mut r = request();
        r.crop_ratio = "16:9".into();
        assert!(validate_request(&r).is_ok());
        r.crop_ratio = "21:9".into();
        assert!(validate_request(&r).is_err());

        let mut r = request();
        r.raw_crop = Some((0, 0, 1280, 720));
        assert!(validate_request(&r).is_ok());
        r.raw_crop = Some((0, 0, 1281, 720));
        assert!(validate_request(&r).is_err());
        r.raw_crop = Some((0, 0, 0, 720));
        assert!(validate_request(&r).is_err());
    }

    #[test]
    fn validates_times_and_segments() {
        let mut r = request();
        r.start_time = "1:30".into();
        r.end_time = "95.5".into();
        assert!(validate_request(&r).is_ok());
        r.start_time = "abc".into();
        assert!(validate_request(&r).is_err());

        let mut r = request();
        r.segments = vec![Segment { start: 0.0, end: 5.0 }, Segment { start: 10.0, end: 8.0 }];
        assert!(validate_request(&r).unwrap_err().contains("Invalid segment range"));

        let mut r = request();
        r.segments = (0..21).map(|i| Segment { start: i as f64, end: i as f64 + 1.0 }).collect();
        assert!(validate_request(&r).unwrap_err().contains("max 20"));
        r.segments.truncate(20);
        assert!(validate_request(&r).is_ok());
    }

    #[test]
    fn parses_clock_times() {
        assert_eq!(parse_time_secs("90"), Some(90.0));
        assert_eq!(parse_time_secs("1:30"), Some(90.0));
        assert_eq!(parse_time_secs("1:01:30.5"), Some(3690.5));
        assert_eq!(parse_time_secs("x"), None);
    }
}
