//! Transcription surface.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Multipart, State};
use serde::Deserialize;
use serde_json::{Value, json};

use super::helpers::{UploadedForm, resolve_file_path, save_uploaded_file};
use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::config::{self, JobType};
use crate::jobs::JobRecord;
use crate::pipeline::transcribe::TranscribeRequest;
use crate::services::ServiceContainer;

fn request_from_form(form: &UploadedForm) -> TranscribeRequest {
    TranscribeRequest {
        output_mode: form.field_or("outputMode", "text"),
        model: form.field_or("model", "base"),
        subtitle_format: form.field_or("subtitleFormat", "srt"),
        language: form.field("language").to_string(),
        caption_size: form.field("captionSize").parse().unwrap_or(72),
        max_words_per_caption: form.field("maxWordsPerCaption").parse().unwrap_or(0),
        max_chars_per_line: form.field("maxCharsPerLine").parse().unwrap_or(0),
        min_duration: form.field("minDuration").parse().unwrap_or(0.0),
        caption_gap: form.field("captionGap").parse().unwrap_or(0.0),
    }
}

fn start_job(
    services: Arc<ServiceContainer>,
    client_id: &str,
    input_path: std::path::PathBuf,
    original_name: String,
    request: TranscribeRequest,
) -> Result<String, ApiError> {
    if !client_id.is_empty()
        && services.sessions.active_job_count(client_id) >= config::MAX_JOBS_PER_CLIENT
    {
        return Err(ApiError::client_cap());
    }

    crate::pipeline::transcribe::validate_request(
        &request,
        services.config.transcription_api_key.is_some(),
    )
    .map_err(ApiError::bad_request)?;

    let job_id = uuid::Uuid::new_v4().to_string();
    services
        .governor
        .admit(JobType::Transcribe)
        .map_err(|rejected| ApiError::service_unavailable(rejected.reason))?;
    if !client_id.is_empty() {
        services.sessions.register(client_id);
        services.sessions.link_job(&job_id, client_id);
    }

    let record = Arc::new(JobRecord::new(Some(JobType::Transcribe), None, None));
    record.set_message("Starting transcription...");
    services.jobs.insert(&job_id, record.clone());

    let task_job_id = job_id.clone();
    tokio::spawn(async move {
        crate::pipeline::transcribe::run(
            services,
            task_job_id,
            record,
            input_path,
            original_name,
            request,
        )
        .await;
    });

    Ok(job_id)
}

/// POST /api/transcribe (multipart).
pub async fn transcribe(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let services = state.services.clone();
    let form = save_uploaded_file(multipart, "file").await?;
    let client_id = form.field("clientId").to_string();
    let request = request_from_form(&form);

    let job_id = match start_job(
        services,
        &client_id,
        form.file_path.clone(),
        form.original_name.clone(),
        request,
    ) {
        Ok(job_id) => job_id,
        Err(e) => {
            let _ = tokio::fs::remove_file(&form.file_path).await;
            return Err(e);
        }
    };
    Ok(Json(json!({ "jobId": job_id })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscribeChunkedBody {
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub output_mode: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub subtitle_format: String,
    #[serde(default)]
    pub language: String,
}

/// POST /api/transcribe-chunked (json).
pub async fn transcribe_chunked(
    State(state): State<AppState>,
    Json(body): Json<TranscribeChunkedBody>,
) -> ApiResult<Json<Value>> {
    let services = state.services.clone();

    let (input_path, ref_name) = resolve_file_path(&services, &body.file_path)
        .await
        .ok_or_else(|| ApiError::bad_request("Invalid file path"))?;
    if tokio::fs::metadata(&input_path).await.is_err() {
        return Err(ApiError::bad_request("File not found. Complete chunked upload first."));
    }

    let original_name = if !body.file_name.is_empty() {
        body.file_name
    } else {
        ref_name.unwrap_or_else(|| "media".to_string())
    };

    let request = TranscribeRequest {
        output_mode: default_str(&body.output_mode, "text"),
        model: default_str(&body.model, "base"),
        subtitle_format: default_str(&body.subtitle_format, "srt"),
        language: body.language,
        ..TranscribeRequest::default()
    };

    let job_id = start_job(services, &body.client_id, input_path, original_name, request)?;
    Ok(Json(json!({ "jobId": job_id })))
}

fn default_str(v: &str, fallback: &str) -> String {
    if v.is_empty() { fallback.to_string() } else { v.to_string() }
}
