//! Gallery surface: availability, metadata probe, and download
//! (single file or zip) via the gallery scraper.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::helpers::file_response;
use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::config::{self, JobType, TempDir};
use crate::downloader::gallery::{collect_downloaded_files, image_mime};
use crate::error::Error;
use crate::process::ProcessHandle;
use crate::services::ServiceContainer;
use crate::utils::fs::sanitize_filename;
use crate::utils::short_id;
use crate::utils::url::validate_url;

pub async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "available": state.services.gallery.is_available() }))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GalleryQuery {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub progress_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub filename: String,
}

pub async fn metadata(
    State(state): State<AppState>,
    Query(query): Query<GalleryQuery>,
) -> ApiResult<Json<Value>> {
    let services = &state.services;
    if !services.gallery.is_available() {
        return Err(ApiError::service_unavailable("gallery-dl not installed on server"));
    }

    let check = validate_url(&query.url).await;
    if !check.valid {
        return Err(ApiError::bad_request(check.error));
    }

    match services.gallery.metadata(&query.url).await {
        Ok(meta) => {
            let host = crate::utils::url::host_of(&query.url)
                .map(|h| h.trim_start_matches("www.").to_string())
                .unwrap_or_default();
            let mut value = serde_json::to_value(&meta).unwrap_or_default();
            if let Some(obj) = value.as_object_mut() {
                obj.insert("site".into(), Value::from(host));
                obj.insert("isGallery".into(), Value::from(true));
            }
            Ok(Json(value))
        }
        Err(Error::Timeout(msg)) => Err(ApiError::gateway_timeout(msg)),
        Err(e) => Err(ApiError::internal(e.user_message())),
    }
}

/// Scrape a gallery and stream it back: one file directly, many as a zip.
pub async fn download(
    State(state): State<AppState>,
    Query(query): Query<GalleryQuery>,
) -> ApiResult<Response> {
    let services = state.services.clone();
    if !services.gallery.is_available() {
        return Err(ApiError::service_unavailable("gallery-dl not installed on server"));
    }

    let check = validate_url(&query.url).await;
    if !check.valid {
        return Err(ApiError::bad_request(check.error));
    }

    if !query.client_id.is_empty()
        && services.sessions.active_job_count(&query.client_id) >= config::MAX_JOBS_PER_CLIENT
    {
        return Err(ApiError::client_cap());
    }

    let download_id = if query.progress_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        query.progress_id.clone()
    };

    if let Err(rejected) = services.governor.admit(JobType::Download) {
        services.hub.send_simple(&download_id, "error", &rejected.reason);
        return Err(ApiError::service_unavailable(rejected.reason));
    }

    let gallery_dir = TempDir::Gallery.path().join(format!("gallery-{download_id}"));
    if let Err(e) = tokio::fs::create_dir_all(&gallery_dir).await {
        services.governor.release(JobType::Download);
        return Err(ApiError::internal(format!("Failed to create gallery dir: {e}")));
    }

    let handle = Arc::new(
        ProcessHandle::new(JobType::Download).with_temp_dir(gallery_dir.clone()),
    );
    services.attach_job(&download_id, &query.client_id, handle.clone());

    // A client disconnect drops this handler; make sure that cancels the
    // scrape and releases the slot.
    let mut guard = GalleryAbortGuard {
        services: services.clone(),
        job_id: download_id.clone(),
        handle: handle.clone(),
        armed: true,
    };

    info!(job = %short_id(&download_id), "Gallery download started");
    services
        .hub
        .send_simple(&download_id, "starting", "Starting gallery download...");

    let count_services = services.clone();
    let count_id = download_id.clone();
    let run_result = services
        .gallery
        .download(&query.url, &gallery_dir, &download_id, handle.clone(), move |count| {
            let mut extra = serde_json::Map::new();
            extra.insert("downloadedCount".into(), Value::from(count));
            count_services.hub.send(
                &count_id,
                "downloading",
                &format!("Downloaded {count} images..."),
                None,
                Some(extra),
            );
        })
        .await;

    if let Err(e) = run_result {
        let api_error = gallery_error(&services, &download_id, &query.url, &gallery_dir, e).await;
        guard.defuse();
        return Err(api_error);
    }

    let all_files = collect_downloaded_files(&gallery_dir).await;
    if all_files.is_empty() {
        let api_error = gallery_error(
            &services,
            &download_id,
            &query.url,
            &gallery_dir,
            Error::Upstream("No images were downloaded".to_string()),
        )
        .await;
        guard.defuse();
        return Err(api_error);
    }

    let cleanup_services = services.clone();
    let cleanup_id = download_id.clone();
    let file_count = all_files.len();
    let on_done: Box<dyn FnOnce() + Send> = Box::new(move || {
        cleanup_services.hub.send_simple(
            &cleanup_id,
            "complete",
            &format!("Downloaded {file_count} images!"),
        );
        cleanup_services.release_job(&cleanup_id);
        cleanup_services.schedule_file_cleanup(&cleanup_id, std::time::Duration::from_secs(2));
    });

    if all_files.len() == 1 {
        let file = &all_files[0];
        let ext = file
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let base = {
            let name = sanitize_filename(&query.filename);
            if name.is_empty() {
                sanitize_filename(
                    &file
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "image".to_string()),
                )
            } else {
                name
            }
        };
        services.hub.send_simple(&download_id, "sending", "Sending file...");
        let response =
            file_response(file, &format!("{base}.{ext}"), image_mime(&ext), Some(on_done)).await?;
        guard.defuse();
        return Ok(response);
    }

    // Multiple files: package as a zip.
    let mut extra = serde_json::Map::new();
    extra.insert("downloadedCount".into(), Value::from(all_files.len()));
    services.hub.send(
        &download_id,
        "zipping",
        &format!("Creating zip with {} images...", all_files.len()),
        Some(90.0),
        Some(extra),
    );

    let zip_path = TempDir::Gallery.path().join(format!("{download_id}.zip"));
    let zip_name = {
        let name = sanitize_filename(&query.filename);
        if !name.is_empty() {
            name
        } else {
            let host = crate::utils::url::host_of(&query.url)
                .map(|h| h.trim_start_matches("www.").to_string())
                .unwrap_or_default();
            let host = sanitize_filename(&host);
            if host.is_empty() { "gallery".to_string() } else { host }
        }
    };

    if let Err(e) = crate::pipeline::playlist::create_zip(&zip_path, all_files).await {
        let api_error = gallery_error(&services, &download_id, &query.url, &gallery_dir, e).await;
        guard.defuse();
        return Err(api_error);
    }

    services.hub.send_simple(&download_id, "sending", "Sending zip file...");
    let response =
        file_response(&zip_path, &format!("{zip_name}.zip"), "application/zip", Some(on_done))
            .await?;
    guard.defuse();
    Ok(response)
}

/// Cancels the scrape and releases the download slot when the request
/// future is dropped before a controlled exit.
struct GalleryAbortGuard {
    services: Arc<ServiceContainer>,
    job_id: String,
    handle: Arc<ProcessHandle>,
    armed: bool,
}

impl GalleryAbortGuard {
    fn defuse(&mut self) {
        self.armed = false;
    }
}

impl Drop for GalleryAbortGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.handle.cancel();
        self.services.release_job(&self.job_id);
        let job_id = self.job_id.clone();
        tokio::spawn(async move {
            crate::utils::fs::cleanup_job_files(&job_id).await;
        });
    }
}

async fn gallery_error(
    services: &ServiceContainer,
    download_id: &str,
    url: &str,
    gallery_dir: &std::path::Path,
    error: Error,
) -> ApiError {
    warn!(job = %short_id(download_id), error = %error, "Gallery download failed");
    let user_message = error.user_message();
    if !error.is_cancelled() {
        services.alerts.gallery_failed(download_id, url, &error.to_string());
        services.hub.send_simple(download_id, "error", &user_message);
    }
    services.release_job(download_id);
    let _ = tokio::fs::remove_dir_all(gallery_dir).await;
    services.schedule_file_cleanup(download_id, std::time::Duration::from_secs(2));

    if error.is_cancelled() {
        ApiError::bad_request(user_message)
    } else {
        ApiError::internal(user_message)
    }
}
