//! API route modules.
//!
//! Handlers are organized per surface; wiring is flat so the path table
//! reads top to bottom.

pub mod bot;
pub mod convert;
pub mod core;
pub mod download;
pub mod gallery;
mod helpers;
pub mod playlist;
pub mod transcribe;
pub mod upload;

use axum::Router;
use axum::routing::{get, post};

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(core::health))
        .route("/api/connect", post(core::connect))
        .route("/api/heartbeat/{client_id}", post(core::heartbeat))
        .route("/api/queue-status", get(core::queue_status))
        .route("/api/limits", get(core::limits))
        .route("/api/progress/{id}", get(core::progress))
        .route("/api/cancel/{id}", post(core::cancel))
        .route("/api/finish-early/{id}", post(core::finish_early))
        .route("/api/metadata", get(download::metadata))
        .route("/api/download", get(download::download))
        .route("/api/playlist/start", post(playlist::start))
        .route("/api/playlist/status/{job_id}", get(playlist::status))
        .route("/api/playlist/download/{token}", get(playlist::download))
        .route("/api/upload/init", post(upload::init))
        .route("/api/upload/chunk/{upload_id}/{chunk_index}", post(upload::chunk))
        .route("/api/upload/complete/{upload_id}", post(upload::complete))
        .route("/api/job/{job_id}/status", get(upload::job_status))
        .route("/api/job/{job_id}/download", get(upload::job_download))
        .route("/api/fetch-url", post(upload::fetch_url))
        .route("/api/convert", post(convert::convert))
        .route("/api/convert-chunked", post(convert::convert_chunked))
        .route("/api/compress", post(convert::compress))
        .route("/api/compress-chunked", post(convert::compress_chunked))
        .route("/api/transcribe", post(transcribe::transcribe))
        .route("/api/transcribe-chunked", post(transcribe::transcribe_chunked))
        .route("/api/gallery/status", get(gallery::status))
        .route("/api/gallery/metadata", get(gallery::metadata))
        .route("/api/gallery/download", get(gallery::download))
        .route("/api/bot/download", post(bot::download))
        .route("/api/bot/download-playlist", post(bot::download_playlist))
        .route("/api/bot/convert", post(bot::convert))
        .route("/api/bot/compress", post(bot::compress))
        .route("/api/bot/status/{job_id}", get(bot::status))
        .route("/api/bot/download/{token}", get(bot::file_download))
        .route("/api/download/{token}", get(bot::download_page))
        .with_state(state)
}
