//! Convert and compress surfaces.
//!
//! The multipart variants run the pipeline within the request and stream
//! the result straight back; the `-chunked` variants take a previously
//! assembled upload token, return a job id immediately and let the client
//! poll `/api/job/{id}/status`.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Multipart, State};
use axum::response::Response;
use serde::Deserialize;
use serde_json::{Value, json};

use super::helpers::{UploadedForm, file_response, resolve_file_path, save_uploaded_file};
use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::config::{self, JobType};
use crate::jobs::{JobRecord, JobState};
use crate::pipeline::compress::CompressRequest;
use crate::pipeline::convert::{ConvertRequest, Segment};
use crate::services::ServiceContainer;

fn check_client_cap(services: &ServiceContainer, client_id: &str) -> Result<(), ApiError> {
    if !client_id.is_empty()
        && services.sessions.active_job_count(client_id) >= config::MAX_JOBS_PER_CLIENT
    {
        return Err(ApiError::client_cap());
    }
    Ok(())
}

fn admit_and_link(
    services: &ServiceContainer,
    job_type: JobType,
    job_id: &str,
    client_id: &str,
) -> Result<(), ApiError> {
    services
        .governor
        .admit(job_type)
        .map_err(|rejected| ApiError::service_unavailable(rejected.reason))?;
    if !client_id.is_empty() {
        services.sessions.register(client_id);
        services.sessions.link_job(job_id, client_id);
    }
    Ok(())
}

/// The bot convert endpoint reuses the web field mapping.
pub(super) fn bot_convert_request(form: &UploadedForm) -> ConvertRequest {
    convert_request_from_form(form)
}

/// The bot compress endpoint reuses the web field mapping.
pub(super) fn bot_compress_request(form: &UploadedForm) -> CompressRequest {
    compress_request_from_fields(
        form.field_or("mode", "size"),
        form.field_or("quality", "medium"),
        form.field_or("preset", "balanced"),
        form.field_or("denoise", "auto"),
        &form.field_or("targetSize", "50"),
        &form.field_or("duration", "0"),
        form.field("shouldDownscale"),
    )
}

fn convert_request_from_form(form: &UploadedForm) -> ConvertRequest {
    ConvertRequest {
        format: form.field_or("format", "mp4"),
        quality: form.field_or("quality", "medium"),
        reencode: form.field_or("reencode", "auto"),
        start_time: form.field("startTime").to_string(),
        end_time: form.field("endTime").to_string(),
        audio_bitrate: {
            let v = form.field_or("audioBitrate", "192");
            if config::ALLOWED_AUDIO_BITRATES.contains(&v.as_str()) { v } else { "192".into() }
        },
        crop_ratio: form.field("cropRatio").to_string(),
        raw_crop: None,
        segments: Vec::new(),
    }
}

/// POST /api/convert (multipart): convert and stream the result back.
pub async fn convert(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Response> {
    let services = state.services.clone();
    let form = save_uploaded_file(multipart, "file").await?;
    let client_id = form.field("clientId").to_string();
    let request = convert_request_from_form(&form);

    if let Err(e) = check_client_cap(&services, &client_id) {
        let _ = tokio::fs::remove_file(&form.file_path).await;
        return Err(e);
    }
    if let Err(reason) = crate::pipeline::convert::validate_request(&request) {
        let _ = tokio::fs::remove_file(&form.file_path).await;
        return Err(ApiError::bad_request(reason));
    }
    let job_id = uuid::Uuid::new_v4().to_string();
    if let Err(e) = admit_and_link(&services, JobType::Convert, &job_id, &client_id) {
        let _ = tokio::fs::remove_file(&form.file_path).await;
        return Err(e);
    }

    let record = Arc::new(JobRecord::new(Some(JobType::Convert), None, Some(request.format.clone())));
    services.jobs.insert(&job_id, record.clone());

    // Run as a task so a client disconnect cannot abandon the pipeline
    // mid-flight; the work runs to its terminal state regardless.
    let run = tokio::spawn(crate::pipeline::convert::run(
        services.clone(),
        job_id.clone(),
        record.clone(),
        form.file_path,
        form.original_name,
        request,
    ));
    run.await
        .map_err(|_| ApiError::internal("Conversion failed"))?;

    respond_with_output(services, job_id, record).await
}

/// POST /api/convert-chunked (json): convert a previously uploaded file.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertChunkedBody {
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub quality: String,
    #[serde(default)]
    pub reencode: String,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default)]
    pub audio_bitrate: String,
    #[serde(default)]
    pub crop_ratio: String,
    #[serde(default)]
    pub crop_x: Option<u32>,
    #[serde(default)]
    pub crop_y: Option<u32>,
    #[serde(default)]
    pub crop_w: Option<u32>,
    #[serde(default)]
    pub crop_h: Option<u32>,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

pub async fn convert_chunked(
    State(state): State<AppState>,
    Json(body): Json<ConvertChunkedBody>,
) -> ApiResult<Json<Value>> {
    let services = state.services.clone();

    let (input_path, ref_name) = resolve_file_path(&services, &body.file_path)
        .await
        .ok_or_else(|| ApiError::bad_request("Invalid file path"))?;
    if tokio::fs::metadata(&input_path).await.is_err() {
        return Err(ApiError::bad_request("File not found. Complete chunked upload first."));
    }

    let original_name = if !body.file_name.is_empty() {
        body.file_name.clone()
    } else {
        ref_name.unwrap_or_else(|| "media".to_string())
    };

    let raw_crop = match (body.crop_x, body.crop_y, body.crop_w, body.crop_h) {
        (Some(x), Some(y), Some(w), Some(h)) => Some((x, y, w, h)),
        _ => None,
    };
    let request = ConvertRequest {
        format: default_str(&body.format, "mp4"),
        quality: default_str(&body.quality, "medium"),
        reencode: default_str(&body.reencode, "auto"),
        start_time: body.start_time,
        end_time: body.end_time,
        audio_bitrate: {
            let v = default_str(&body.audio_bitrate, "192");
            if config::ALLOWED_AUDIO_BITRATES.contains(&v.as_str()) { v } else { "192".into() }
        },
        crop_ratio: body.crop_ratio,
        raw_crop,
        segments: body.segments,
    };

    check_client_cap(&services, &body.client_id)?;
    crate::pipeline::convert::validate_request(&request).map_err(ApiError::bad_request)?;

    let job_id = uuid::Uuid::new_v4().to_string();
    admit_and_link(&services, JobType::Convert, &job_id, &body.client_id)?;

    let record = Arc::new(JobRecord::new(Some(JobType::Convert), None, Some(request.format.clone())));
    services.jobs.insert(&job_id, record.clone());

    let task_services = services.clone();
    let task_job_id = job_id.clone();
    tokio::spawn(async move {
        crate::pipeline::convert::run(
            task_services,
            task_job_id,
            record,
            input_path,
            original_name,
            request,
        )
        .await;
    });

    Ok(Json(json!({ "jobId": job_id })))
}

fn compress_request_from_fields(
    mode: String,
    quality: String,
    preset: String,
    denoise: String,
    target_size: &str,
    duration: &str,
    downscale: &str,
) -> CompressRequest {
    CompressRequest {
        mode,
        quality,
        preset,
        denoise,
        target_mb: target_size.parse().unwrap_or(f64::NAN),
        duration_secs: duration.parse().unwrap_or(0.0),
        downscale: downscale == "true",
    }
}

/// POST /api/compress (multipart): compress and stream the result back,
/// with progress frames on the SSE stream named by `progressId`.
pub async fn compress(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Response> {
    let services = state.services.clone();
    let form = save_uploaded_file(multipart, "file").await?;
    let client_id = form.field("clientId").to_string();
    let progress_id = form.field("progressId").to_string();

    let request = compress_request_from_fields(
        form.field_or("mode", "size"),
        form.field_or("quality", "medium"),
        form.field_or("preset", "balanced"),
        form.field_or("denoise", "auto"),
        &form.field_or("targetSize", "50"),
        &form.field_or("duration", "0"),
        form.field("shouldDownscale"),
    );

    if let Err(e) = check_client_cap(&services, &client_id) {
        let _ = tokio::fs::remove_file(&form.file_path).await;
        return Err(e);
    }
    if let Err(reason) = crate::pipeline::compress::validate_request(&request) {
        let _ = tokio::fs::remove_file(&form.file_path).await;
        return Err(ApiError::bad_request(reason));
    }
    let job_id = if progress_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        progress_id.clone()
    };
    if let Err(e) = admit_and_link(&services, JobType::Compress, &job_id, &client_id) {
        let _ = tokio::fs::remove_file(&form.file_path).await;
        if !progress_id.is_empty() {
            services.hub.send_simple(&progress_id, "error", &e.message);
        }
        return Err(e);
    }

    let record = Arc::new(JobRecord::new(Some(JobType::Compress), None, None));
    services.jobs.insert(&job_id, record.clone());

    // Mirror record progress onto the SSE stream while the encode runs.
    let mirror = if !progress_id.is_empty() {
        Some(spawn_hub_mirror(services.clone(), progress_id.clone(), record.clone()))
    } else {
        None
    };

    // Run as a task so a client disconnect cannot abandon the pipeline
    // mid-flight.
    let run = tokio::spawn(crate::pipeline::compress::run(
        services.clone(),
        job_id.clone(),
        record.clone(),
        form.file_path,
        form.original_name,
        request,
    ));
    let run_result = run.await;

    if let Some(mirror) = mirror {
        mirror.abort();
    }
    run_result.map_err(|_| ApiError::internal("Compression failed"))?;

    match record.state() {
        JobState::Complete => {
            if !progress_id.is_empty() {
                services.hub.send_percent(&progress_id, "complete", "Compression complete!", 100.0);
            }
        }
        _ => {
            let message = record.status_snapshot().message;
            if !progress_id.is_empty() && record.state() == JobState::Error {
                services.hub.send_simple(&progress_id, "error", &message);
            }
        }
    }

    respond_with_output(services, job_id, record).await
}

/// POST /api/compress-chunked (json).
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressChunkedBody {
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub target_size: Value,
    #[serde(default)]
    pub duration: Value,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub quality: String,
    #[serde(default)]
    pub preset: String,
    #[serde(default)]
    pub denoise: String,
    #[serde(default)]
    pub should_downscale: bool,
}

pub async fn compress_chunked(
    State(state): State<AppState>,
    Json(body): Json<CompressChunkedBody>,
) -> ApiResult<Json<Value>> {
    let services = state.services.clone();

    let (input_path, ref_name) = resolve_file_path(&services, &body.file_path)
        .await
        .ok_or_else(|| ApiError::bad_request("Invalid file path"))?;
    if tokio::fs::metadata(&input_path).await.is_err() {
        return Err(ApiError::bad_request("File not found. Complete chunked upload first."));
    }

    let original_name = if !body.file_name.is_empty() {
        body.file_name.clone()
    } else {
        ref_name.unwrap_or_else(|| "media".to_string())
    };

    let request = CompressRequest {
        mode: default_str(&body.mode, "size"),
        quality: default_str(&body.quality, "medium"),
        preset: default_str(&body.preset, "balanced"),
        denoise: default_str(&body.denoise, "auto"),
        target_mb: json_number(&body.target_size, 50.0),
        duration_secs: json_number(&body.duration, 0.0),
        downscale: body.should_downscale,
    };

    check_client_cap(&services, &body.client_id)?;
    crate::pipeline::compress::validate_request(&request).map_err(ApiError::bad_request)?;

    let job_id = uuid::Uuid::new_v4().to_string();
    admit_and_link(&services, JobType::Compress, &job_id, &body.client_id)?;

    let record = Arc::new(JobRecord::new(Some(JobType::Compress), None, None));
    services.jobs.insert(&job_id, record.clone());

    let task_services = services.clone();
    let task_job_id = job_id.clone();
    tokio::spawn(async move {
        crate::pipeline::compress::run(
            task_services,
            task_job_id,
            record,
            input_path,
            original_name,
            request,
        )
        .await;
    });

    Ok(Json(json!({ "jobId": job_id })))
}

/// Stream a finished record's output, or fold its error into a response.
async fn respond_with_output(
    services: Arc<ServiceContainer>,
    job_id: String,
    record: Arc<JobRecord>,
) -> ApiResult<Response> {
    let (output, job_state) = record.output();
    match job_state {
        JobState::Complete => {
            let path = output
                .path
                .ok_or_else(|| ApiError::internal("Output file not found"))?;
            let cleanup_services = services.clone();
            let on_done = Box::new(move || {
                cleanup_services.jobs.remove(&job_id);
                cleanup_services.schedule_file_cleanup(&job_id, Duration::from_secs(2));
            });
            file_response(&path, &output.filename, &output.mime_type, Some(on_done)).await
        }
        JobState::Cancelled => Err(ApiError::bad_request(record.status_snapshot().message)),
        _ => {
            let snapshot = record.status_snapshot();
            let message = snapshot
                .error
                .unwrap_or_else(|| snapshot.message.clone());
            services.jobs.remove(&job_id);
            Err(ApiError::internal(message))
        }
    }
}

/// Forward record progress to the SSE hub every 300 ms until terminal.
fn spawn_hub_mirror(
    services: Arc<ServiceContainer>,
    progress_id: String,
    record: Arc<JobRecord>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_progress = -1.0f64;
        let mut interval = tokio::time::interval(Duration::from_millis(300));
        loop {
            interval.tick().await;
            if record.is_terminal() {
                break;
            }
            let snapshot = record.status_snapshot();
            if (snapshot.progress - last_progress).abs() >= 2.0 {
                last_progress = snapshot.progress;
                services.hub.send_percent(
                    &progress_id,
                    "compressing",
                    &snapshot.message,
                    snapshot.progress,
                );
            }
        }
    })
}

fn default_str(v: &str, fallback: &str) -> String {
    if v.is_empty() { fallback.to_string() } else { v.to_string() }
}

fn json_number(v: &Value, fallback: f64) -> f64 {
    match v {
        Value::Number(n) => n.as_f64().unwrap_or(fallback),
        Value::String(s) => s.parse().unwrap_or(fallback),
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_number_accepts_both_shapes() {
        assert_eq!(json_number(&json!(25), 50.0), 25.0);
        assert_eq!(json_number(&json!("25.5"), 50.0), 25.5);
        assert_eq!(json_number(&json!(null), 50.0), 50.0);
        assert_eq!(json_number(&json!("abc"), 50.0), 50.0);
    }
}
