//! Bot surface: bearer-authenticated job submission plus token-based
//! artifact retrieval and the HTML auto-download landing page.
//!
//! Bot jobs are fire-and-poll: submission returns a job id, the bot polls
//! `/api/bot/status/{jobId}` and finally hands its user a
//! `/api/download/{token}` link. Responses on this surface are only
//! 200/400/401/404; admission problems surface through the job record.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::helpers::{file_response, save_uploaded_file};
use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::artifacts::{Artifact, new_token};
use crate::config::{JobType, TempDir};
use crate::error::Error;
use crate::jobs::{JobRecord, JobState};
use crate::pipeline::DownloadParams;
use crate::pipeline::download::{AcquireStrategy, acquire_and_process};
use crate::pipeline::playlist::{PlaylistRequest, PlaylistSurface};
use crate::process::ProcessHandle;
use crate::services::ServiceContainer;
use crate::utils::constant_time_eq;
use crate::utils::short_id;
use crate::utils::url::validate_url;

/// Constant-time bearer check. A missing server secret locks the surface.
fn check_auth(services: &ServiceContainer, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(secret) = &services.config.bot_secret else {
        return Err(ApiError::unauthorized("Unauthorized"));
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let expected = format!("Bearer {secret}");
    if constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(ApiError::unauthorized("Unauthorized"))
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BotDownloadBody {
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
    pub playlist: bool,
}

impl BotDownloadBody {
    fn params(&self) -> DownloadParams {
        DownloadParams {
            is_audio: self.format == "audio",
            audio_format: or_default(&self.audio_format, "mp3"),
            audio_bitrate: or_default(&self.audio_bitrate, "320"),
            quality: or_default(&self.quality, "1080p"),
            container: or_default(&self.container, "mp4"),
            playlist: self.playlist,
        }
    }
}

pub async fn download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BotDownloadBody>,
) -> ApiResult<Json<Value>> {
    let services = state.services.clone();
    check_auth(&services, &headers)?;

    if body.url.is_empty() {
        return Err(ApiError::bad_request("URL required"));
    }
    let check = validate_url(&body.url).await;
    if !check.valid {
        return Err(ApiError::bad_request(check.error));
    }

    let job_id = uuid::Uuid::new_v4().to_string();
    let params = body.params();
    let record = Arc::new(JobRecord::new(
        None,
        Some(body.url.clone()),
        Some(params.output_ext()),
    ));
    record.set_message("Initializing download...");
    services.jobs.insert(&job_id, record.clone());

    let task_job_id = job_id.clone();
    tokio::spawn(async move {
        run_bot_download(services, task_job_id, record, body.url, params).await;
    });

    Ok(Json(json!({ "jobId": job_id })))
}

async fn run_bot_download(
    services: Arc<ServiceContainer>,
    job_id: String,
    record: Arc<JobRecord>,
    url: String,
    params: DownloadParams,
) {
    if let Err(rejected) = services.governor.admit(JobType::Download) {
        record.fail(&rejected.reason, &rejected.reason);
        return;
    }

    let handle = Arc::new(ProcessHandle::new(JobType::Download));
    services.processes.insert(&job_id, handle.clone());

    record.set_state(JobState::Downloading);
    record.set_message("Downloading from source...");

    let sink = Arc::new(crate::pipeline::RecordSink { record: record.clone() });
    let strategy = AcquireStrategy::bot(TempDir::Bot.path(), "bot-");

    let result = acquire_and_process(
        &services,
        &url,
        &job_id,
        &params,
        &strategy,
        handle,
        sink,
        false,
    )
    .await;

    let processed = match result {
        Ok(processed) => processed,
        Err(e) => {
            bot_error(&services, &job_id, &record, &url, e).await;
            services.release_job(&job_id);
            return;
        }
    };

    record.set_state(JobState::Processing);
    record.set_progress_message(100.0, "Processing...");

    let file_size = crate::utils::fs::file_size(&processed.path).await;
    if file_size == 0 {
        bot_error(
            &services,
            &job_id,
            &record,
            &url,
            Error::Upstream("Downloaded file not found after processing".to_string()),
        )
        .await;
        services.release_job(&job_id);
        return;
    }

    // Name the artifact after the source title when we can get one.
    let title = services
        .ytdlp
        .video_title(&url)
        .await
        .unwrap_or_else(|| "download".to_string());
    let file_name = format!(
        "{}.{}",
        crate::utils::fs::sanitize_filename(&title),
        processed.ext
    );
    let mime_type = params.mime_type(&processed.ext, processed.ext == "gif").to_string();

    let token = new_token();
    services.artifacts.put(
        &token,
        Artifact::new(processed.path, file_name.clone(), file_size, mime_type),
    );

    record.set_download_token(&token, &file_name, file_size);
    record.complete(Default::default(), "Ready for download");
    services.release_job(&job_id);
    info!(job = %short_id(&job_id), token = %short_id(&token), "Bot job complete");
}

async fn bot_error(
    services: &ServiceContainer,
    job_id: &str,
    record: &Arc<JobRecord>,
    url: &str,
    error: Error,
) {
    warn!(job = %short_id(job_id), error = %error, "Bot job failed");
    if error.is_cancelled() {
        record.cancel(error.user_message());
    } else {
        services.alerts.bot_job_failed(job_id, url, &error.to_string());
        record.fail(error.user_message(), error.to_string());
    }

    // Sweep this job's droppings from the bot dir.
    let dir = TempDir::Bot.path();
    if let Ok(mut entries) = tokio::fs::read_dir(&dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().contains(job_id) {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }
}

pub async fn download_playlist(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BotDownloadBody>,
) -> ApiResult<Json<Value>> {
    let services = state.services.clone();
    check_auth(&services, &headers)?;

    if body.url.is_empty() {
        return Err(ApiError::bad_request("URL required"));
    }
    let check = validate_url(&body.url).await;
    if !check.valid {
        return Err(ApiError::bad_request(check.error));
    }

    let job_id = uuid::Uuid::new_v4().to_string();
    let params = body.params();
    let record = Arc::new(JobRecord::new(
        Some(JobType::Playlist),
        Some(body.url.clone()),
        Some(params.output_ext()),
    ));
    record.set_message("Getting playlist info...");
    services.jobs.insert(&job_id, record.clone());

    let task_job_id = job_id.clone();
    tokio::spawn(async move {
        if let Err(rejected) = services.governor.admit(JobType::Playlist) {
            record.fail(&rejected.reason, &rejected.reason);
            return;
        }
        let request = PlaylistRequest { url: body.url, params, resume_from: 1 };
        crate::pipeline::playlist::run(services, task_job_id, record, request, PlaylistSurface::Bot)
            .await;
    });

    Ok(Json(json!({ "jobId": job_id })))
}

/// POST /api/bot/convert (multipart): convert an uploaded file and park the
/// result under an artifact token.
pub async fn convert(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let services = state.services.clone();
    check_auth(&services, &headers)?;

    let form = save_uploaded_file(multipart, "file").await?;
    let request = super::convert::bot_convert_request(&form);
    if let Err(reason) = crate::pipeline::convert::validate_request(&request) {
        let _ = tokio::fs::remove_file(&form.file_path).await;
        return Err(ApiError::bad_request(reason));
    }

    let job_id = uuid::Uuid::new_v4().to_string();
    let record = Arc::new(JobRecord::new(Some(JobType::Convert), None, Some(request.format.clone())));
    record.set_message("Starting conversion...");
    services.jobs.insert(&job_id, record.clone());

    let task_job_id = job_id.clone();
    tokio::spawn(async move {
        if let Err(rejected) = services.governor.admit(JobType::Convert) {
            let _ = tokio::fs::remove_file(&form.file_path).await;
            record.fail(&rejected.reason, &rejected.reason);
            return;
        }
        crate::pipeline::convert::run(
            services.clone(),
            task_job_id.clone(),
            record.clone(),
            form.file_path,
            form.original_name,
            request,
        )
        .await;
        tokenize_output(&services, &record).await;
    });

    Ok(Json(json!({ "jobId": job_id })))
}

/// POST /api/bot/compress (multipart).
pub async fn compress(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let services = state.services.clone();
    check_auth(&services, &headers)?;

    let form = save_uploaded_file(multipart, "file").await?;
    let request = super::convert::bot_compress_request(&form);
    if let Err(reason) = crate::pipeline::compress::validate_request(&request) {
        let _ = tokio::fs::remove_file(&form.file_path).await;
        return Err(ApiError::bad_request(reason));
    }

    let job_id = uuid::Uuid::new_v4().to_string();
    let record = Arc::new(JobRecord::new(Some(JobType::Compress), None, None));
    record.set_message("Starting compression...");
    services.jobs.insert(&job_id, record.clone());

    let task_job_id = job_id.clone();
    tokio::spawn(async move {
        if let Err(rejected) = services.governor.admit(JobType::Compress) {
            let _ = tokio::fs::remove_file(&form.file_path).await;
            record.fail(&rejected.reason, &rejected.reason);
            return;
        }
        crate::pipeline::compress::run(
            services.clone(),
            task_job_id.clone(),
            record.clone(),
            form.file_path,
            form.original_name,
            request,
        )
        .await;
        tokenize_output(&services, &record).await;
    });

    Ok(Json(json!({ "jobId": job_id })))
}

/// Move a completed record's output into the artifact store so the bot can
/// hand out a download link.
async fn tokenize_output(services: &ServiceContainer, record: &Arc<JobRecord>) {
    let (output, job_state) = record.output();
    if job_state != JobState::Complete {
        return;
    }
    let Some(path) = output.path else { return };
    let file_size = crate::utils::fs::file_size(&path).await;

    let token = new_token();
    services.artifacts.put(
        &token,
        Artifact::new(path, output.filename.clone(), file_size, output.mime_type),
    );
    record.set_download_token(&token, &output.filename, file_size);
}

pub async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> ApiResult<Json<crate::jobs::BotStatus>> {
    check_auth(&state.services, &headers)?;
    let record = state
        .services
        .jobs
        .get(&job_id)
        .ok_or_else(|| ApiError::not_found("Job not found"))?;
    Ok(Json(record.bot_snapshot()))
}

/// GET /api/bot/download/{token}: stream the artifact, then delete it
/// shortly after the client had time to pull the bytes.
pub async fn file_download(
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

/// GET /api/download/{token}: tiny HTML page that auto-starts the download
/// in an iframe, for links pasted into chat clients.
pub async fn download_page(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Response {
    let Some(artifact) = state.services.artifacts.get(&token) else {
        return (StatusCode::NOT_FOUND, Html(NOT_FOUND_HTML)).into_response();
    };

    let name = html_escape(&artifact.file_name);
    let url = format!("/api/bot/download/{}", html_escape(&token));
    Html(DOWNLOAD_HTML.replace("{name}", &name).replace("{url}", &url)).into_response()
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn or_default(v: &str, fallback: &str) -> String {
    if v.is_empty() { fallback.to_string() } else { v.to_string() }
}

const NOT_FOUND_HTML: &str = r#"<!DOCTYPE html><html><head><title>download not found</title><meta name="viewport" content="width=device-width,initial-scale=1"><style>*{box-sizing:border-box;margin:0;padding:0}body{font-family:sans-serif;display:flex;align-items:center;justify-content:center;min-height:100vh;background:#0a0a0f;color:#fafafa;padding:24px}.container{text-align:center;max-width:500px;width:100%}h1{font-size:2rem;margin-bottom:12px;color:#f87171}p{color:#a1a1aa;font-size:1rem;margin-bottom:8px}.status{margin-top:24px;padding:16px;background:#12121a;border-radius:12px;border:1px solid #2a2a3a;font-size:0.9rem;color:#f87171}</style></head><body><div class="container"><h1>download failed</h1><p>this file is no longer available</p><div class="status">the download link has expired (5 minute limit)</div></div></body></html>"#;

const DOWNLOAD_HTML: &str = r#"<!DOCTYPE html><html><head><title>downloading...</title><meta name="viewport" content="width=device-width,initial-scale=1"><style>*{box-sizing:border-box;margin:0;padding:0}body{font-family:sans-serif;display:flex;align-items:center;justify-content:center;min-height:100vh;background:#0a0a0f;color:#fafafa;padding:24px}.container{text-align:center;max-width:500px;width:100%}.spinner{width:60px;height:60px;margin:0 auto 24px;border:4px solid #2a2a3a;border-top:4px solid #8b5cf6;border-radius:50%;animation:spin 0.8s linear infinite}@keyframes spin{to{transform:rotate(360deg)}}h1{font-size:2rem;margin-bottom:12px}p{color:#a1a1aa;font-size:1rem;margin-bottom:8px}.status{margin-top:24px;padding:16px;background:#12121a;border-radius:12px;border:1px solid #2a2a3a;font-size:0.9rem;color:#a1a1aa;word-break:break-all}</style></head><body><div class="container"><div class="spinner"></div><h1>downloading...</h1><p>your download should start automatically</p><div class="status">{name}</div></div><iframe id="downloadFrame" style="display:none" src="{url}"></iframe></body></html>"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_escape_covers_the_usual_suspects() {
        assert_eq!(html_escape("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&#39;");
    }

    #[tokio::test]
    async fn auth_rejects_missing_and_wrong_secrets() {
        let services = ServiceContainer::for_tests();

        let mut headers = HeaderMap::new();
        assert!(check_auth(&services, &headers).is_err());

        headers.insert(header::AUTHORIZATION, "Bearer wrong".parse().unwrap());
        assert!(check_auth(&services, &headers).is_err());

        headers.insert(header::AUTHORIZATION, "Bearer hunter2".parse().unwrap());
        assert!(check_auth(&services, &headers).is_ok());

        // Same length, different content.
        headers.insert(header::AUTHORIZATION, "Bearer hunter3".parse().unwrap());
        assert!(check_auth(&services, &headers).is_err());
    }
}
