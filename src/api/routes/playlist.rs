//! Playlist surface: async start, polling, packaged-zip retrieval.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::response::Response;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::helpers::file_response;
use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::config::{self, JobType};
use crate::jobs::JobRecord;
use crate::pipeline::DownloadParams;
use crate::pipeline::playlist::{PlaylistRequest, PlaylistSurface};
use crate::utils::short_id;
use crate::utils::url::validate_url;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBody {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub quality: String,
    #[serde(default)]
    pub container: String,
    #[serde(default)]
    pub audio_format: String,
    #[serde(default)]
    pub audio_bitrate: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub resume_from: usize,
}

pub async fn start(
    State(state): State<AppState>,
    Json(body): Json<StartBody>,
) -> ApiResult<Json<Value>> {
    let services = state.services.clone();

    let check = validate_url(&body.url).await;
    if !check.valid {
        return Err(ApiError::bad_request(check.error));
    }

    if !body.client_id.is_empty()
        && services.sessions.active_job_count(&body.client_id) >= config::MAX_JOBS_PER_CLIENT
    {
        return Err(ApiError::client_cap());
    }

    if let Err(rejected) = services.governor.admit(JobType::Playlist) {
        return Err(ApiError::service_unavailable(rejected.reason));
    }

    let job_id = uuid::Uuid::new_v4().to_string();
    let params = DownloadParams {
        is_audio: body.format == "audio",
        audio_format: default_str(&body.audio_format, "mp3"),
        audio_bitrate: default_str(&body.audio_bitrate, "320"),
        quality: default_str(&body.quality, "1080p"),
        container: default_str(&body.container, "mp4"),
        playlist: false,
    };
    let output_ext = params.output_ext();

    if !body.client_id.is_empty() {
        services.sessions.register(&body.client_id);
        services.sessions.link_job(&job_id, &body.client_id);
    }

    let record = Arc::new(JobRecord::new(
        Some(JobType::Playlist),
        Some(body.url.clone()),
        Some(output_ext),
    ));
    record.set_message("getting playlist info...");
    services.jobs.insert(&job_id, record.clone());

    info!(job = %short_id(&job_id), "Playlist job queued");

    let request = PlaylistRequest {
        url: body.url,
        params,
        resume_from: body.resume_from.max(1),
    };
    let task_job_id = job_id.clone();
    tokio::spawn(async move {
        crate::pipeline::playlist::run(services, task_job_id, record, request, PlaylistSurface::Web)
            .await;
    });

    Ok(Json(json!({ "jobId": job_id })))
}

pub async fn status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<crate::jobs::PlaylistStatus>> {
    let record = state
        .services
        .jobs
        .get(&job_id)
        .ok_or_else(|| ApiError::not_found("Job not found"))?;
    Ok(Json(record.playlist_snapshot()))
}

/// Fetch a packaged playlist zip by token. The file is deleted shortly
/// after it has been served once.
pub async fn download(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<Response> {
    let services = state.services.clone();

    let artifact = services
        .artifacts
        .get(&token)
        .ok_or_else(|| ApiError::not_found("Download not found or expired"))?;

    if tokio::fs::metadata(&artifact.file_path).await.is_err() {
        services.artifacts.delete(&token);
        return Err(ApiError::not_found("File no longer available"));
    }

    services.artifacts.mark_downloaded(&token);

    let delete_services = services.clone();
    let delete_token = token.clone();
    let file_path = artifact.file_path.clone();
    let on_done = Box::new(move || {
        tokio::spawn(async move {
            tokio::time::sleep(super::download::POST_DOWNLOAD_DELETE_DELAY).await;
            if delete_services.artifacts.delete(&delete_token).is_some() {
                let _ = tokio::fs::remove_file(&file_path).await;
                info!(token = %short_id(&delete_token), "Token cleaned up after download");
            }
        });
    });

    file_response(
        &artifact.file_path,
        &artifact.file_name,
        &artifact.mime_type,
        Some(on_done),
    )
    .await
}

fn default_str(v: &str, fallback: &str) -> String {
    if v.is_empty() { fallback.to_string() } else { v.to_string() }
}
