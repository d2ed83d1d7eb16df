//! Playlist pipeline.
//!
//! Fetches the flat listing, downloads entries one by one with the same
//! per-video fallback chain as single downloads, collects survivors into a
//! working directory and packages them as a store-only ZIP registered in
//! the artifact store. Honors resume-from offsets and the finish-early
//! flag, which is only consulted between videos: an in-flight video always
//! completes or fails on its own.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::{DownloadParams, ProcessOpts, process_media};
use crate::artifacts::{Artifact, new_token};
use crate::config::{self, JobType, TempDir};
use crate::downloader::{self, ytdlp::DownloadOpts};
use crate::error::{Error, Result};
use crate::jobs::{FailedVideo, JobOutput, JobRecord, JobState};
use crate::process::ProcessHandle;
use crate::services::ServiceContainer;
use crate::utils::fs::sanitize_filename;
use crate::utils::short_id;

/// Which surface started the playlist; controls where temp files live,
/// whether SSE frames are emitted, and how the artifact is flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistSurface {
    Web,
    Bot,
}

pub struct PlaylistRequest {
    pub url: String,
    pub params: DownloadParams,
    pub resume_from: usize,
}

/// Run a playlist job to its terminal state. Admission must have happened;
/// this function owns release.
pub async fn run(
    services: Arc<ServiceContainer>,
    job_id: String,
    record: Arc<JobRecord>,
    request: PlaylistRequest,
    surface: PlaylistSurface,
) {
    let root = match surface {
        PlaylistSurface::Web => TempDir::Playlist.path(),
        PlaylistSurface::Bot => TempDir::Bot.path(),
    };
    let playlist_dir = match surface {
        PlaylistSurface::Web => root.join(&job_id),
        PlaylistSurface::Bot => root.join(format!("playlist-{job_id}")),
    };
    if let Err(e) = tokio::fs::create_dir_all(&playlist_dir).await {
        finish_error(&services, &job_id, &record, &request.url, surface, &playlist_dir, Error::Io(e)).await;
        return;
    }

    let handle = Arc::new(
        ProcessHandle::new(JobType::Playlist).with_temp_dir(playlist_dir.clone()),
    );
    services.processes.insert(&job_id, handle.clone());
    info!(
        job = %short_id(&job_id),
        counters = ?services.governor.active_counts(),
        "Playlist job started"
    );

    match run_inner(&services, &job_id, &record, &request, surface, &playlist_dir, &handle).await {
        Ok(()) => {}
        Err(e) => {
            finish_error(&services, &job_id, &record, &request.url, surface, &playlist_dir, e).await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_inner(
    services: &ServiceContainer,
    job_id: &str,
    record: &Arc<JobRecord>,
    request: &PlaylistRequest,
    surface: PlaylistSurface,
    playlist_dir: &Path,
    handle: &Arc<ProcessHandle>,
) -> Result<()> {
    let params = &request.params;
    let output_ext = params.output_ext();

    let playlist_info = services.ytdlp.playlist_info(&request.url, true).await?;

    if playlist_info.count > config::MAX_PLAYLIST_VIDEOS {
        return Err(Error::Validation(format!(
            "Playlist too large. Maximum {} videos allowed. This playlist has {} videos.",
            config::MAX_PLAYLIST_VIDEOS,
            playlist_info.count
        )));
    }

    let total_videos = playlist_info.count;
    let playlist_title = playlist_info.title.clone();
    let start_idx = request
        .resume_from
        .saturating_sub(1)
        .min(playlist_info.entries.len().saturating_sub(1));

    let start_message = if start_idx > 0 {
        format!("resuming from video {}/{total_videos}", request.resume_from)
    } else {
        format!("found {total_videos} videos")
    };

    record.set_state(JobState::Downloading);
    record.set_message(&start_message);
    record.update_playlist(|p| {
        p.title = playlist_title.clone();
        p.total_videos = total_videos;
    });

    let format_label = if params.is_audio {
        params.audio_format.clone()
    } else {
        format!("{} {}", params.quality, params.container)
    };

    if surface == PlaylistSurface::Web {
        let mut extra = playlist_extra(&playlist_title, total_videos, start_idx, "", &format_label);
        extra.insert("failedVideos".into(), Value::Array(Vec::new()));
        services
            .hub
            .send(job_id, "playlist-info", &start_message, Some(0.0), Some(extra));
    }

    let mut downloaded_files: Vec<PathBuf> = Vec::new();
    let mut failed_videos: Vec<FailedVideo> = Vec::new();

    for (i, entry) in playlist_info.entries.iter().enumerate().skip(start_idx) {
        if handle.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if handle.is_finish_early() {
            info!(
                job = %short_id(job_id),
                downloaded = downloaded_files.len(),
                "Finishing playlist early"
            );
            break;
        }

        let video_num = i + 1;
        let video_title = if entry.title.is_empty() {
            format!("Video {video_num}")
        } else {
            entry.title.clone()
        };
        let video_url = if !entry.url.is_empty() {
            entry.url.clone()
        } else if !entry.id.is_empty() {
            format!("https://www.youtube.com/watch?v={}", entry.id)
        } else {
            continue;
        };

        let safe_title: String = sanitize_filename(&video_title).chars().take(100).collect();
        let video_file = playlist_dir.join(format!("{video_num:03} - {safe_title}.{output_ext}"));

        let progress = (video_num - 1) as f64 / total_videos as f64 * 100.0;
        record.update_playlist(|p| {
            p.current_video = video_num;
            p.current_video_title = video_title.clone();
        });
        record.set_progress_message(
            progress,
            format!("downloading {video_num}/{total_videos}: {video_title}"),
        );

        if surface == PlaylistSurface::Web {
            let mut extra = playlist_extra(
                &playlist_title,
                total_videos,
                video_num,
                &video_title,
                &format_label,
            );
            extra.insert(
                "failedVideos".into(),
                serde_json::to_value(&failed_videos).unwrap_or_default(),
            );
            extra.insert("failedCount".into(), Value::from(failed_videos.len()));
            services.hub.send(
                job_id,
                "downloading",
                &format!("Downloading {video_num}/{total_videos}: {video_title}"),
                Some(progress),
                Some(extra),
            );
        }

        match download_entry(
            services,
            job_id,
            record,
            &video_url,
            video_num,
            total_videos,
            params,
            playlist_dir,
            handle,
        )
        .await
        {
            Ok(temp_path) => {
                let opts = ProcessOpts {
                    is_audio: params.is_audio,
                    is_gif: false,
                    audio_format: params.audio_format.clone(),
                    audio_bitrate: params.audio_bitrate.clone(),
                    container: params.container.clone(),
                };
                match process_media(&temp_path, &video_file, &opts, Some(handle.clone())).await {
                    Ok(processed) => {
                        if processed.skipped && processed.path != video_file {
                            let _ = tokio::fs::rename(&processed.path, &video_file).await;
                        } else if !processed.skipped {
                            let _ = tokio::fs::remove_file(&temp_path).await;
                        }
                        downloaded_files.push(video_file);
                        record.update_playlist(|p| p.videos_completed = downloaded_files.len());
                        info!(job = %short_id(job_id), video = video_num, "Video complete");
                    }
                    Err(e) if e.is_cancelled() => return Err(Error::Cancelled),
                    Err(e) => {
                        warn!(job = %short_id(job_id), video = video_num, error = %e, "Video processing failed");
                    }
                }
            }
            Err(e) if e.is_cancelled() => return Err(Error::Cancelled),
            Err(e) => {
                failed_videos.push(FailedVideo {
                    num: video_num,
                    title: video_title,
                    reason: e.user_message(),
                });
                record.update_playlist(|p| p.failed_videos = failed_videos.clone());
            }
        }
    }

    if downloaded_files.is_empty() {
        return Err(Error::Upstream("No videos were successfully downloaded".to_string()));
    }

    // Package.
    record.set_state(JobState::Zipping);
    record.set_progress_message(
        95.0,
        format!("creating zip with {} videos...", downloaded_files.len()),
    );
    if surface == PlaylistSurface::Web {
        let mut extra = Map::new();
        extra.insert("playlistTitle".into(), Value::from(playlist_title.clone()));
        extra.insert("totalVideos".into(), Value::from(total_videos));
        extra.insert("downloadedCount".into(), Value::from(downloaded_files.len()));
        services.hub.send(
            job_id,
            "zipping",
            &format!("Creating zip file with {} videos...", downloaded_files.len()),
            Some(95.0),
            Some(extra),
        );
    }

    let zip_path = root_dir(surface).join(format!("{job_id}.zip"));
    let safe_playlist_name = {
        let name = sanitize_filename(&playlist_title);
        if name.is_empty() { "playlist".to_string() } else { name }
    };

    create_zip(&zip_path, downloaded_files.clone()).await?;
    let _ = tokio::fs::remove_dir_all(playlist_dir).await;

    let zip_size = tokio::fs::metadata(&zip_path)
        .await
        .map(|m| m.len())
        .map_err(|_| Error::Other("zip file not found after creation".to_string()))?;

    let token = new_token();
    let file_name = format!("{safe_playlist_name}.zip");
    let artifact = Artifact::new(
        zip_path,
        file_name.clone(),
        zip_size,
        "application/zip".to_string(),
    );
    let artifact = match surface {
        PlaylistSurface::Web => artifact.web_playlist(),
        PlaylistSurface::Bot => artifact.playlist(),
    };
    services.artifacts.put(&token, artifact);

    record.set_download_token(&token, &file_name, zip_size);
    record.update_playlist(|p| p.failed_videos = failed_videos.clone());
    record.complete(
        JobOutput::default(),
        format!("{} videos ready to download", downloaded_files.len()),
    );

    if surface == PlaylistSurface::Web {
        let mut extra = Map::new();
        extra.insert("playlistTitle".into(), Value::from(playlist_title));
        extra.insert("totalVideos".into(), Value::from(total_videos));
        extra.insert("downloadedCount".into(), Value::from(downloaded_files.len()));
        extra.insert(
            "failedVideos".into(),
            serde_json::to_value(&failed_videos).unwrap_or_default(),
        );
        extra.insert("failedCount".into(), Value::from(failed_videos.len()));
        extra.insert("downloadToken".into(), Value::from(token));
        services.hub.send(
            job_id,
            "complete",
            &format!("{} videos ready!", downloaded_files.len()),
            Some(100.0),
            Some(extra),
        );
    }

    services.release_job(job_id);
    info!(job = %short_id(job_id), "Playlist complete");
    Ok(())
}

/// Per-entry acquisition: yt-dlp with proxy for YouTube, tunnel fallback.
#[allow(clippy::too_many_arguments)]
async fn download_entry(
    services: &ServiceContainer,
    job_id: &str,
    record: &Arc<JobRecord>,
    video_url: &str,
    video_num: usize,
    total_videos: usize,
    params: &DownloadParams,
    playlist_dir: &Path,
    handle: &Arc<ProcessHandle>,
) -> Result<PathBuf> {
    let is_youtube = downloader::is_youtube_url(video_url);

    let record_progress = record.clone();
    let opts = DownloadOpts {
        is_audio: params.is_audio,
        audio_format: params.audio_format.clone(),
        quality: params.quality.clone(),
        container: params.container.clone(),
        temp_dir: playlist_dir.to_path_buf(),
        file_prefix: String::new(),
        process: Some(handle.clone()),
        playlist: false,
        use_proxy: is_youtube,
        on_progress: Some(Arc::new(move |prog, speed, eta| {
            let overall =
                ((video_num - 1) as f64 / total_videos as f64) * 100.0 + prog / total_videos as f64;
            record_progress.set_progress(overall);
            record_progress.set_speed_eta(speed, eta);
        })),
    };

    match services
        .ytdlp
        .download(video_url, &format!("temp_{video_num}"), opts)
        .await
    {
        Ok(acquired) => Ok(acquired.path),
        Err(e) if e.is_cancelled() => Err(Error::Cancelled),
        Err(e) if !is_youtube => Err(e),
        Err(_) => {
            let acquired = services
                .tunnel
                .download(
                    video_url,
                    &format!("{job_id}-v{video_num}"),
                    params.is_audio,
                    playlist_dir,
                    Some(handle.clone()),
                    None,
                    Default::default(),
                )
                .await?;
            Ok(acquired.path)
        }
    }
}

fn root_dir(surface: PlaylistSurface) -> PathBuf {
    match surface {
        PlaylistSurface::Web => TempDir::Playlist.path(),
        PlaylistSurface::Bot => TempDir::Bot.path(),
    }
}

fn playlist_extra(
    title: &str,
    total: usize,
    current: usize,
    current_title: &str,
    format_label: &str,
) -> Map<String, Value> {
    let mut extra = Map::new();
    extra.insert("playlistTitle".into(), Value::from(title));
    extra.insert("totalVideos".into(), Value::from(total));
    extra.insert("currentVideo".into(), Value::from(current));
    extra.insert("currentVideoTitle".into(), Value::from(current_title));
    extra.insert("format".into(), Value::from(format_label));
    extra
}

async fn finish_error(
    services: &ServiceContainer,
    job_id: &str,
    record: &Arc<JobRecord>,
    url: &str,
    surface: PlaylistSurface,
    playlist_dir: &Path,
    error: Error,
) {
    let cancelled = error.is_cancelled();
    let user_message = error.user_message();
    warn!(job = %short_id(job_id), error = %error, "Playlist failed");

    if cancelled {
        record.cancel(&user_message);
    } else {
        services.alerts.playlist_failed(job_id, url, &error.to_string());
        record.fail(&user_message, error.to_string());
        if surface == PlaylistSurface::Web {
            services.hub.send_simple(job_id, "error", &user_message);
        }
    }

    services.release_job(job_id);
    let _ = tokio::fs::remove_dir_all(playlist_dir).await;
}

/// Write a store-only zip of the given files, entry names flattened to their
/// base name.
pub async fn create_zip(zip_path: &Path, files: Vec<PathBuf>) -> Result<()> {
    let zip_path = zip_path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::create(&zip_path)?;
        let mut zip = ZipWriter::new(file);
        // Media payloads do not compress; store-only keeps packaging I/O bound.
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

        let mut buf = vec![0u8; 1 << 20];
        for path in files {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());
            let mut src = std::fs::File::open(&path)?;
            zip.start_file(name, options)
                .map_err(|e| Error::Other(format!("Failed to create zip: {e}")))?;
            loop {
                let n = src.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                zip.write_all(&buf[..n])?;
            }
        }
        zip.finish()
            .map_err(|e| Error::Other(format!("Failed to create zip: {e}")))?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Other(format!("zip task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zip_packs_files_by_base_name() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("001 - first.mp4");
        let b = dir.path().join("002 - second.mp4");
        std::fs::write(&a, b"aaaa").unwrap();
        std::fs::write(&b, b"bbbb").unwrap();

        let zip_path = dir.path().join("out.zip");
        create_zip(&zip_path, vec![a, b]).await.unwrap();

        let reader = std::fs::File::open(&zip_path).unwrap();
        let mut archive = zip::ZipArchive::new(reader).unwrap();
        assert_eq!(archive.len(), 2);
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.contains(&"001 - first.mp4".to_string()));

        // Store-only: entries are not deflated.
        let entry = archive.by_index(0).unwrap();
        assert_eq!(entry.compression(), CompressionMethod::Stored);
    }

    #[tokio::test]
    async fn zip_of_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("out.zip");
        let missing = dir.path().join("nope.mp4");
        assert!(create_zip(&zip_path, vec![missing]).await.is_err());
    }

    #[test]
    fn surfaces_pick_their_roots() {
        assert!(root_dir(PlaylistSurface::Web).ends_with("playlists"));
        assert!(root_dir(PlaylistSurface::Bot).ends_with("bot"));
    }
}
