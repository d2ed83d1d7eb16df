//! Media metadata and the streaming download endpoint.

use std::sync::Arc;
use std::time::Duration;

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
use crate::downloader::{self, clip};
use crate::error::Error;
use crate::jobs::JobState;
use crate::pipeline::download::{AcquireStrategy, acquire_and_process};
use crate::pipeline::{DownloadParams, HubSink};
use crate::process::ProcessHandle;
use crate::services::ServiceContainer;
use crate::utils::short_id;
use crate::utils::url::validate_url;

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetadataQuery {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub playlist: String,
}

pub async fn metadata(
    State(state): State<AppState>,
    Query(query): Query<MetadataQuery>,
) -> ApiResult<Json<Value>> {
    let services = &state.services;
    let want_playlist = query.playlist == "true";

    let check = validate_url(&query.url).await;
    if !check.valid {
        return Err(ApiError::bad_request(check.error));
    }

    let is_youtube = downloader::is_youtube_url(&query.url);

    if downloader::is_clip_url(&query.url) {
        return Ok(Json(clip_metadata(services, &query.url).await));
    }

    if is_youtube && !want_playlist {
        // yt-dlp metadata for YouTube burns quota and trips bot checks; the
        // tunnel answers from its own cache.
        return match services.tunnel.fetch_metadata(&query.url).await {
            Ok((title, ext)) => Ok(Json(json!({
                "title": title,
                "ext": ext,
                "id": "",
                "uploader": "",
                "duration": "",
                "thumbnail": "",
                "isPlaylist": false,
                "viaCobalt": true,
                "usingCookies": false,
            }))),
            Err(_) => Err(ApiError::internal("Failed to fetch YouTube metadata via tunnel")),
        };
    }

    let using_cookies = services.auth.has_cookies_file();

    if want_playlist {
        match services.ytdlp.playlist_metadata(&query.url, is_youtube).await {
            Ok(meta) => {
                let cap = meta.video_titles.len().min(50);
                Ok(Json(json!({
                    "title": meta.title,
                    "isPlaylist": true,
                    "videoCount": meta.video_count,
                    "videoTitles": &meta.video_titles[..cap],
                    "usingCookies": using_cookies,
                })))
            }
            Err(e) => Err(metadata_error(services, e, using_cookies)),
        }
    } else {
        match services.ytdlp.single_metadata(&query.url, is_youtube).await {
            Ok(meta) => Ok(Json(json!({
                "title": meta.title,
                "ext": meta.ext,
                "id": meta.id,
                "uploader": meta.uploader,
                "duration": meta.duration,
                "thumbnail": meta.thumbnail,
                "isPlaylist": false,
                "usingCookies": using_cookies,
            }))),
            Err(Error::Timeout(msg)) => Err(ApiError::gateway_timeout(msg)),
            Err(e) => {
                // A failed video probe may still be a gallery page.
                if let Ok(gallery_meta) = services.gallery.metadata(&query.url).await {
                    let host = crate::utils::url::host_of(&query.url)
                        .map(|h| h.trim_start_matches("www.").to_string())
                        .unwrap_or_default();
                    let mut value = serde_json::to_value(&gallery_meta).unwrap_or_default();
                    if let Some(obj) = value.as_object_mut() {
                        obj.insert("site".into(), Value::from(host));
                        obj.insert("isGallery".into(), Value::from(true));
                    }
                    return Ok(Json(value));
                }
                Err(metadata_error(services, e, using_cookies))
            }
        }
    }
}

fn metadata_error(services: &ServiceContainer, error: Error, using_cookies: bool) -> ApiError {
    if let Error::Timeout(msg) = &error {
        return ApiError::gateway_timeout(msg.clone());
    }
    let raw = error.to_string();
    if crate::downloader::auth::AuthService::needs_cookies_retry(&raw) && !using_cookies {
        services
            .alerts
            .cookie_issue("YouTube bot detection - cookies.txt may be stale or missing");
        return ApiError::internal(
            "YouTube requires authentication. Please add cookies.txt to the server.",
        );
    }
    ApiError::internal(error.user_message())
}

async fn clip_metadata(services: &ServiceContainer, url: &str) -> Value {
    let client = reqwest::Client::new();
    let Ok(clip_data) = clip::parse_clip_page(&client, url).await else {
        return json!({
            "isClip": true,
            "title": "YouTube Clip",
            "usingCookies": false,
            "clipNote": "Clip will be downloaded via yt-dlp.",
        });
    };

    let clip_duration = clip_data.duration_secs();
    let full_url = clip_data.full_video_url();

    match services.tunnel.fetch_metadata(&full_url).await {
        Ok((title, ext)) => json!({
            "title": title,
            "ext": ext,
            "duration": clip_duration,
            "isPlaylist": false,
            "viaCobalt": true,
            "isClip": true,
            "clipStartTime": clip_data.start_secs(),
            "clipEndTime": clip_data.end_secs(),
            "clipDuration": clip_duration,
            "originalVideoId": clip_data.video_id,
            "fullVideoUrl": full_url,
            "usingCookies": false,
            "clipNote": "Clip will download full video then trim to clip portion.",
        }),
        Err(_) => json!({
            "isClip": true,
            "clipStartTime": clip_data.start_secs(),
            "clipEndTime": clip_data.end_secs(),
            "clipDuration": clip_duration,
            "duration": clip_duration,
            "originalVideoId": clip_data.video_id,
            "fullVideoUrl": full_url,
            "title": "YouTube Clip",
            "thumbnail": format!("https://i.ytimg.com/vi/{}/maxresdefault.jpg", clip_data.video_id),
            "usingCookies": false,
            "clipNote": "Clip will download full video then trim to clip portion.",
        }),
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DownloadQuery {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub quality: String,
    #[serde(default)]
    pub container: String,
    #[serde(default)]
    pub audio_format: String,
    #[serde(default)]
    pub audio_bitrate: String,
    #[serde(default)]
    pub progress_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub twitter_gifs: String,
    #[serde(default)]
    pub playlist: String,
}

fn or_default(v: &str, fallback: &str) -> String {
    if v.is_empty() { fallback.to_string() } else { v.to_string() }
}

/// Cancels and releases the job when the request future is dropped before
/// the pipeline reached a controlled exit (client disconnected mid-work).
struct AbortGuard {
    services: Arc<ServiceContainer>,
    job_id: String,
    handle: Arc<ProcessHandle>,
    armed: bool,
}

impl AbortGuard {
    fn defuse(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbortGuard {
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

/// Start a download and stream the result back on the same request.
/// Progress goes to the SSE stream identified by `progressId`.
pub async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let services = state.services.clone();

    let download_id = if query.progress_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        query.progress_id.clone()
    };

    let check = validate_url(&query.url).await;
    if !check.valid {
        return Err(ApiError::bad_request(check.error));
    }

    if !query.client_id.is_empty()
        && services.sessions.active_job_count(&query.client_id) >= config::MAX_JOBS_PER_CLIENT
    {
        let err = ApiError::client_cap();
        services.hub.send_simple(&download_id, "error", &err.message);
        return Err(err);
    }

    if let Err(rejected) = services.governor.admit(JobType::Download) {
        services.hub.send_simple(&download_id, "error", &rejected.reason);
        return Err(ApiError::service_unavailable(rejected.reason));
    }

    // Admitted: exactly one release happens on every path below.
    let params = DownloadParams {
        is_audio: or_default(&query.format, "video") == "audio",
        audio_format: or_default(&query.audio_format, "mp3"),
        audio_bitrate: or_default(&query.audio_bitrate, "320"),
        quality: or_default(&query.quality, "1080p"),
        container: or_default(&query.container, "mp4"),
        playlist: query.playlist == "true",
    };
    let final_file = TempDir::Download
        .path()
        .join(format!("{download_id}-final.{}", params.output_ext()));

    let handle = Arc::new(ProcessHandle::new(JobType::Download).with_temp_file(final_file));
    services.attach_job(&download_id, &query.client_id, handle.clone());
    services.hub.register_pending(
        &download_id,
        "download",
        &query.url,
        &query.client_id,
        "starting",
    );

    info!(
        job = %short_id(&download_id),
        counters = ?services.governor.active_counts(),
        "Download started"
    );
    services
        .hub
        .send_simple(&download_id, "starting", "Initializing download...");

    let mut guard = AbortGuard {
        services: services.clone(),
        job_id: download_id.clone(),
        handle: handle.clone(),
        armed: true,
    };

    let sink = Arc::new(HubSink { hub: services.hub.clone(), job_id: download_id.clone() });
    let strategy = AcquireStrategy::web(TempDir::Download.path());
    let twitter_gifs = query.twitter_gifs != "false";

    let result = acquire_and_process(
        &services,
        &query.url,
        &download_id,
        &params,
        &strategy,
        handle.clone(),
        sink,
        twitter_gifs,
    )
    .await;

    let processed = match result {
        Ok(processed) => processed,
        Err(e) => {
            // The error path releases; only then is the guard redundant.
            let api_error = download_error(&services, &download_id, &query.url, e).await;
            guard.defuse();
            return Err(api_error);
        }
    };

    // Stream the file back; the done-callback fires when the body stream
    // ends (or the client bails), releasing the job either way.
    services
        .hub
        .send_simple(&download_id, "sending", "Sending file to you...");

    let is_gif = processed.ext == "gif";
    let filename = crate::pipeline::output_filename(
        &or_default(&query.filename, "download"),
        &processed.ext,
    );
    let mime_type = params.mime_type(&processed.ext, is_gif);

    let done_services = services.clone();
    let done_id = download_id.clone();
    let on_done = Box::new(move || {
        done_services
            .hub
            .send_simple(&done_id, "complete", "Download complete!");
        done_services.release_job(&done_id);
        tokio::spawn(async move {
            crate::utils::fs::cleanup_job_files(&done_id).await;
        });
    });

    let response = file_response(&processed.path, &filename, mime_type, Some(on_done)).await?;
    // From here the body stream's done-callback owns the release.
    guard.defuse();
    Ok(response)
}

async fn download_error(
    services: &ServiceContainer,
    download_id: &str,
    url: &str,
    error: Error,
) -> ApiError {
    warn!(job = %short_id(download_id), error = %error, "Download failed");
    let user_message = error.user_message();

    if error.is_cancelled() {
        // The cancel path already emitted its frame and does not alert.
        if let Some(record) = services.jobs.get(download_id) {
            record.cancel(&user_message);
        }
    } else {
        services.alerts.download_failed(download_id, url, &error.to_string());
        services.hub.send_simple(download_id, "error", &user_message);
        if let Some(record) = services.jobs.get(download_id) {
            record.set_state(JobState::Error);
        }
    }

    services.release_job(download_id);

    // Sweep everything this job left in the download dir.
    let dir = TempDir::Download.path();
    if let Ok(mut entries) = tokio::fs::read_dir(&dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(download_id)
            {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }

    if error.is_cancelled() {
        ApiError::bad_request(user_message)
    } else {
        ApiError::internal(user_message)
    }
}

/// Keep the deferred-delete delay in one place for the artifact handlers.
pub const POST_DOWNLOAD_DELETE_DELAY: Duration = Duration::from_secs(30);
