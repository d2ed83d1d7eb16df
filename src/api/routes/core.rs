//! Core surface: liveness, client sessions, the SSE progress stream and
//! the cancel / finish-early controls.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::config;
use crate::utils::short_id;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "queue": state.services.governor.snapshot(),
    }))
}

pub async fn connect(State(state): State<AppState>) -> Json<Value> {
    let client_id = uuid::Uuid::new_v4().to_string();
    state.services.sessions.register(&client_id);
    Json(json!({ "clientId": client_id }))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> ApiResult<Json<Value>> {
    if client_id.is_empty() {
        return Err(ApiError::bad_request("Client ID required"));
    }

    state.services.sessions.register(&client_id);
    state.services.sessions.heartbeat(&client_id);
    let active_jobs = state.services.sessions.active_job_count(&client_id);

    Ok(Json(json!({ "success": true, "activeJobs": active_jobs })))
}

pub async fn queue_status(State(state): State<AppState>) -> Json<crate::governor::QueueStatus> {
    Json(state.services.governor.snapshot())
}

pub async fn limits() -> Json<Value> {
    let limits: HashMap<&str, usize> = config::JobType::ALL
        .iter()
        .map(|t| (t.as_str(), t.limit()))
        .collect();
    Json(json!({
        "limits": limits,
        "maxFileSize": 15u64 * 1024 * 1024 * 1024,
        "maxPlaylistVideos": config::MAX_PLAYLIST_VIDEOS,
        "maxVideoDuration": config::MAX_VIDEO_DURATION_SECS,
    }))
}

/// SSE progress stream for one job id. Emits a `resuming` hello when the
/// job is known and pending, `connected` otherwise, then relays hub frames
/// until the client goes away. Comment keep-alives defeat idle proxies.
pub async fn progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let hub = &state.services.hub;

    let hello = match hub.pending(&id) {
        Some(pending) => hub.make_frame(
            "resuming",
            "Reconnected! Resuming download...",
            Some(pending.progress),
        ),
        None => hub.make_frame("connected", "Connected to progress stream", None),
    };

    let rx = hub.subscribe(&id);
    let stream = futures::stream::once(async move { hello })
        .chain(ReceiverStream::new(rx))
        .map(|frame| {
            let event = Event::default()
                .json_data(&frame)
                .unwrap_or_else(|_| Event::default().data("{}"));
            Ok::<_, Infallible>(event)
        });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

#[derive(serde::Deserialize, Default)]
pub struct OwnerQuery {
    #[serde(rename = "clientId", default)]
    pub client_id: String,
}

/// Cancel a job. Only the owning client (or an ownerless job) may cancel.
/// Idempotent: cancelling a finished job reports `success: false`.
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<Json<Value>> {
    let services = &state.services;

    if let Some(owner) = services.sessions.job_owner(&id) {
        if owner != query.client_id {
            return Err(ApiError::forbidden("Not authorized to cancel this job"));
        }
    }

    let Some(handle) = services.processes.get(&id) else {
        return Ok(Json(json!({
            "success": false,
            "message": "Download not found or already completed",
        })));
    };

    info!(job = %short_id(&id), "Cancelling download");
    handle.cancel();
    if let Some(record) = services.jobs.get(&id) {
        record.cancel("Download cancelled");
    }
    services.release_job(&id);
    services.hub.send_simple(&id, "cancelled", "Download cancelled");
    services.schedule_file_cleanup(&id, Duration::from_secs(1));

    Ok(Json(json!({ "success": true, "message": "Download cancelled" })))
}

/// Playlist finish-early: stop queueing further videos and package what is
/// already downloaded. The current video still runs to completion.
pub async fn finish_early(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<Json<Value>> {
    let services = &state.services;

    if let Some(owner) = services.sessions.job_owner(&id) {
        if owner != query.client_id {
            return Err(ApiError::forbidden("Not authorized to modify this job"));
        }
    }

    let Some(handle) = services.processes.get(&id) else {
        return Ok(Json(json!({
            "success": false,
            "message": "Download not found or already completed",
        })));
    };

    info!(job = %short_id(&id), "Finishing playlist early");
    handle.set_finish_early();
    handle.kill();
    services.hub.send_simple(
        &id,
        "finishing-early",
        "Finishing early, packaging downloaded videos...",
    );

    Ok(Json(json!({ "success": true, "message": "Finishing early" })))
}
