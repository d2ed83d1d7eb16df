//! Chunked uploads, async job polling, and URL-to-upload fetching.

use std::time::Duration;

use axum::Json;
use axum::extract::{Multipart, Path, State};
use axum::response::Response;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::helpers::file_response;
use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::artifacts::FileRef;
use crate::config::{self, JobType, TempDir};
use crate::downloader;
use crate::media::probe;
use crate::uploads::chunk_path;
use crate::utils::short_id;
use crate::utils::url::validate_url;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitBody {
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_size: Value,
    #[serde(default)]
    pub total_chunks: usize,
}

pub async fn init(
    State(state): State<AppState>,
    Json(body): Json<InitBody>,
) -> ApiResult<Json<Value>> {
    let file_size = match &body.file_size {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    };

    if body.file_name.is_empty() || file_size == 0 || body.total_chunks == 0 {
        return Err(ApiError::bad_request(
            "Missing fileName, fileSize, or totalChunks",
        ));
    }
    if file_size > config::FILE_SIZE_LIMIT {
        return Err(ApiError::bad_request(format!(
            "File too large. Maximum size is {}GB",
            config::FILE_SIZE_LIMIT / (1024 * 1024 * 1024)
        )));
    }
    if body.total_chunks > config::MAX_UPLOAD_CHUNKS {
        return Err(ApiError::bad_request(format!(
            "Too many chunks (max {})",
            config::MAX_UPLOAD_CHUNKS
        )));
    }

    let upload_id = uuid::Uuid::new_v4().to_string();
    state
        .services
        .uploads
        .insert(&upload_id, body.file_name, file_size, body.total_chunks);

    info!(
        upload = %short_id(&upload_id),
        mb = %format!("{:.1}", file_size as f64 / (1024.0 * 1024.0)),
        chunks = body.total_chunks,
        "Initialized chunked upload"
    );
    Ok(Json(json!({ "uploadId": upload_id })))
}

pub async fn chunk(
    State(state): State<AppState>,
    Path((upload_id, chunk_index)): Path<(String, String)>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let services = &state.services;

    let index: usize = chunk_index
        .parse()
        .map_err(|_| ApiError::bad_request("Invalid chunk index"))?;

    let total = services
        .uploads
        .total_chunks(&upload_id)
        .ok_or_else(|| ApiError::not_found("Upload not found or expired"))?;
    if index >= total {
        return Err(ApiError::bad_request("Invalid chunk index"));
    }

    // Pull the "chunk" field out of the form and stream it to disk.
    let mut saved = false;
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::bad_request("Failed to parse chunk"))?
    {
        if field.name() != Some("chunk") {
            continue;
        }
        let path = chunk_path(&upload_id, index);
        let mut dst = tokio::fs::File::create(&path).await.map_err(|_| {
            ApiError::internal("Failed to save chunk. Disk may be full or permissions issue.")
        })?;
        while let Some(bytes) = field
            .chunk()
            .await
            .map_err(|_| ApiError::bad_request("Failed to parse chunk"))?
        {
            if dst.write_all(&bytes).await.is_err() {
                drop(dst);
                let _ = tokio::fs::remove_file(&path).await;
                return Err(ApiError::internal("Failed to save chunk."));
            }
        }
        dst.flush()
            .await
            .map_err(|_| ApiError::internal("Failed to save chunk."))?;
        saved = true;
        break;
    }
    if !saved {
        return Err(ApiError::bad_request("No chunk data"));
    }

    let (received, total) = services
        .uploads
        .mark_chunk_received(&upload_id, index)
        .ok_or_else(|| ApiError::not_found("Upload not found or expired"))?;

    info!(
        upload = %short_id(&upload_id),
        chunk = index + 1,
        total,
        "Chunk received"
    );
    Ok(Json(json!({
        "received": received,
        "total": total,
        "complete": received == total,
    })))
}

pub async fn complete(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let services = &state.services;

    let (is_complete, received, total) = services
        .uploads
        .completion(&upload_id)
        .ok_or_else(|| ApiError::not_found("Upload not found or expired"))?;
    if !is_complete {
        return Err(ApiError::bad_request(format!(
            "Missing chunks: received {received}/{total}"
        )));
    }

    let Some((file_name, _file_size, total_chunks)) = services.uploads.remove(&upload_id) else {
        return Err(ApiError::not_found("Upload not found or expired"));
    };

    let assembled_path = TempDir::Upload.path().join(format!(
        "assembled-{upload_id}-{}",
        crate::utils::fs::sanitize_filename(&file_name)
    ));

    // Concatenate in index order, deleting chunks as they land.
    let mut out = tokio::fs::File::create(&assembled_path)
        .await
        .map_err(|_| ApiError::internal("Failed to assemble file"))?;
    for index in 0..total_chunks {
        let path = chunk_path(&upload_id, index);
        let mut src = match tokio::fs::File::open(&path).await {
            Ok(src) => src,
            Err(_) => {
                drop(out);
                let _ = tokio::fs::remove_file(&assembled_path).await;
                return Err(ApiError::internal("Failed to assemble file"));
            }
        };
        if tokio::io::copy(&mut src, &mut out).await.is_err() {
            drop(out);
            let _ = tokio::fs::remove_file(&assembled_path).await;
            return Err(ApiError::internal("Failed to assemble file"));
        }
        let _ = tokio::fs::remove_file(&path).await;
    }
    out.flush()
        .await
        .map_err(|_| ApiError::internal("Failed to assemble file"))?;
    drop(out);

    let file_token = uuid::Uuid::new_v4().to_string();
    services.file_refs.put(
        &file_token,
        FileRef {
            file_path: assembled_path,
            file_name: file_name.clone(),
            created_at: std::time::Instant::now(),
        },
    );

    info!(
        upload = %short_id(&upload_id),
        file_ref = %short_id(&file_token),
        "Upload assembled"
    );
    Ok(Json(json!({
        "success": true,
        "filePath": file_token,
        "fileName": file_name,
    })))
}

pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<crate::jobs::JobStatus>> {
    let record = state
        .services
        .jobs
        .get(&job_id)
        .ok_or_else(|| ApiError::not_found("Job not found or expired"))?;
    Ok(Json(record.status_snapshot()))
}

pub async fn job_download(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Response> {
    let services = state.services.clone();
    let record = services
        .jobs
        .get(&job_id)
        .ok_or_else(|| ApiError::not_found("Job not found or expired"))?;

    let (output, job_state) = record.output();
    if job_state != crate::jobs::JobState::Complete {
        return Err(ApiError::bad_request("Job not complete yet"));
    }
    let path = output
        .path
        .ok_or_else(|| ApiError::not_found("Output file not found"))?;
    if tokio::fs::metadata(&path).await.is_err() {
        return Err(ApiError::not_found("Output file not found"));
    }

    let mime_type = if output.mime_type.is_empty() {
        "video/mp4".to_string()
    } else {
        output.mime_type
    };

    // The output is single-use: evict record and file shortly after serving.
    let cleanup_path = path.clone();
    let on_done = Box::new(move || {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let _ = tokio::fs::remove_file(&cleanup_path).await;
            services.jobs.remove(&job_id);
        });
    });

    file_response(&path, &output.filename, &mime_type, Some(on_done)).await
}

#[derive(Deserialize)]
pub struct FetchUrlBody {
    #[serde(default)]
    pub url: String,
}

/// Fetch a URL server-side and register it as if it had been uploaded.
pub async fn fetch_url(
    State(state): State<AppState>,
    Json(body): Json<FetchUrlBody>,
) -> ApiResult<Json<Value>> {
    let services = &state.services;
    let url = body.url.trim().to_string();
    if url.is_empty() {
        return Err(ApiError::bad_request("Missing or invalid URL"));
    }

    let check = validate_url(&url).await;
    if !check.valid {
        return Err(ApiError::bad_request(check.error));
    }

    if let Err(rejected) = services.governor.admit(JobType::FetchUrl) {
        return Err(ApiError::service_unavailable(rejected.reason));
    }

    let id = format!("fetch-{}", uuid::Uuid::new_v4());
    let is_youtube = downloader::is_youtube_url(&url);
    info!(job = %short_id(&id), "Fetching URL");

    let fetched = match services.ytdlp.fetch_to_upload(&url, &id, is_youtube).await {
        Ok(path) => Ok(path),
        Err(e) if is_youtube => {
            info!(job = %short_id(&id), error = %e, "yt-dlp fetch failed, falling back to tunnel");
            services
                .tunnel
                .download(&url, &id, false, &TempDir::Upload.path(), None, None, Default::default())
                .await
                .map(|acquired| acquired.path)
                .map_err(|_| e)
        }
        Err(e) => Err(e),
    };

    let file_path = match fetched {
        Ok(path) => path,
        Err(e) => {
            services.governor.release(JobType::FetchUrl);
            return Err(ApiError::bad_request(e.user_message()));
        }
    };

    let file_size = crate::utils::fs::file_size(&file_path).await;
    if file_size == 0 {
        services.governor.release(JobType::FetchUrl);
        return Err(ApiError::internal("Failed to stat downloaded file"));
    }
    if file_size > config::FILE_SIZE_LIMIT {
        let _ = tokio::fs::remove_file(&file_path).await;
        services.governor.release(JobType::FetchUrl);
        return Err(ApiError::bad_request(format!(
            "Downloaded file too large ({:.1}GB). Maximum is {}GB.",
            file_size as f64 / (1024.0 * 1024.0 * 1024.0),
            config::FILE_SIZE_LIMIT / (1024 * 1024 * 1024)
        )));
    }

    let (duration, width, height) = probe::probe_video_info(&file_path).await;
    let file_name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());

    info!(
        job = %short_id(&id),
        file = %file_name,
        mb = %format!("{:.1}", file_size as f64 / (1024.0 * 1024.0)),
        "Fetched"
    );

    let file_token = uuid::Uuid::new_v4().to_string();
    services.file_refs.put(
        &file_token,
        FileRef {
            file_path,
            file_name: file_name.clone(),
            created_at: std::time::Instant::now(),
        },
    );

    services.governor.release(JobType::FetchUrl);
    Ok(Json(json!({
        "filePath": file_token,
        "fileName": file_name,
        "fileSize": file_size,
        "duration": duration,
        "width": width,
        "height": height,
    })))
}
