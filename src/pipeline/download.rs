//! Download acquisition chain.
//!
//! The ordered strategies for getting bytes onto disk:
//! - YouTube clip URLs: clip page parse, then the clip strategy chain.
//! - YouTube: yt-dlp (optionally behind the proxy pool), one proxy retry
//!   when the first run went direct, then the tunnel family.
//! - Everything else: yt-dlp only.
//!
//! The caller owns admission, linking and terminal handling; this module
//! only acquires and post-processes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use super::{DownloadParams, ProcessOpts, Processed, ProgressSink, process_media};
use crate::downloader::{self, Acquired, clip, ytdlp::DownloadOpts};
use crate::error::{Error, Result};
use crate::media::probe;
use crate::process::ProcessHandle;
use crate::services::ServiceContainer;

/// Acquisition behavior knobs that differ between the web and bot surfaces.
#[derive(Debug, Clone)]
pub struct AcquireStrategy {
    /// Use the proxy pool on the first yt-dlp attempt.
    pub proxy_first: bool,
    /// Retry yt-dlp once with the proxy when the direct attempt failed.
    pub proxy_retry: bool,
    pub temp_dir: PathBuf,
    pub file_prefix: String,
}

impl AcquireStrategy {
    /// Web surface: proxy from the start, no second attempt.
    pub fn web(temp_dir: PathBuf) -> Self {
        Self { proxy_first: true, proxy_retry: false, temp_dir, file_prefix: String::new() }
    }

    /// Bot surface: direct first, a proxy retry, then tunnels.
    pub fn bot(temp_dir: PathBuf, file_prefix: &str) -> Self {
        Self {
            proxy_first: false,
            proxy_retry: true,
            temp_dir,
            file_prefix: file_prefix.to_string(),
        }
    }
}

fn progress_cb(
    sink: Arc<dyn ProgressSink>,
    stage: &'static str,
    label: &'static str,
) -> crate::downloader::ytdlp::ProgressFn {
    Arc::new(move |progress, speed, eta| {
        sink.emit(
            stage,
            &format!("{label}... {progress:.0}%"),
            Some(progress),
            speed,
            eta,
        );
    })
}

/// Run the acquisition chain for one URL.
pub async fn acquire(
    services: &ServiceContainer,
    url: &str,
    job_id: &str,
    params: &DownloadParams,
    strategy: &AcquireStrategy,
    process: Arc<ProcessHandle>,
    sink: Arc<dyn ProgressSink>,
) -> Result<Acquired> {
    let is_youtube = downloader::is_youtube_url(url);

    if is_youtube && !params.playlist && downloader::is_clip_url(url) {
        return acquire_youtube_clip(services, url, job_id, strategy, process, sink).await;
    }

    let mut opts = DownloadOpts {
        is_audio: params.is_audio,
        audio_format: params.audio_format.clone(),
        quality: params.quality.clone(),
        container: params.container.clone(),
        temp_dir: strategy.temp_dir.clone(),
        file_prefix: strategy.file_prefix.clone(),
        process: Some(process.clone()),
        playlist: params.playlist,
        use_proxy: is_youtube && strategy.proxy_first,
        on_progress: Some(progress_cb(sink.clone(), "downloading", "Downloading")),
    };

    sink.emit("downloading", "Downloading via yt-dlp...", Some(0.0), "", "");
    let mut result = services.ytdlp.download(url, job_id, opts.clone()).await;

    if let Err(e) = &result {
        if e.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if is_youtube
            && strategy.proxy_retry
            && !opts.use_proxy
            && services.auth.has_proxy()
        {
            info!(job = %crate::utils::short_id(job_id), error = %e, "yt-dlp failed, retrying with proxy");
            remove_partial_files(&strategy.temp_dir, &strategy.file_prefix, job_id).await;
            sink.emit("downloading", "Retrying with proxy...", Some(0.0), "", "");
            opts.use_proxy = true;
            result = services.ytdlp.download(url, job_id, opts.clone()).await;
        }
    }

    match result {
        Ok(acquired) => {
            sink.emit("downloading", "Download complete", Some(100.0), "", "");
            Ok(acquired)
        }
        Err(e) if e.is_cancelled() => Err(Error::Cancelled),
        // Tunnel fallback is YouTube-only; other sites fail here.
        Err(e) if !is_youtube || params.playlist => Err(e),
        Err(e) => {
            info!(job = %crate::utils::short_id(job_id), error = %e, "yt-dlp failed, falling back to tunnel");
            sink.emit("downloading", "Downloading via tunnel...", Some(0.0), "", "");
            let byte_sink = sink.clone();
            let acquired = services
                .tunnel
                .download(
                    url,
                    job_id,
                    params.is_audio,
                    &strategy.temp_dir,
                    Some(process),
                    Some(Arc::new(move |progress, _, _| {
                        byte_sink.emit(
                            "downloading",
                            &format!("Downloading... {progress:.0}%"),
                            Some(progress),
                            "",
                            "",
                        );
                    })),
                    Default::default(),
                )
                .await
                .map_err(|tunnel_err| {
                    if tunnel_err.is_cancelled() {
                        Error::Cancelled
                    } else {
                        services.alerts.tunnel_all_failed(job_id, url, &tunnel_err.to_string());
                        tunnel_err
                    }
                })?;
            sink.emit("downloading", "Download complete", Some(100.0), "", "");
            Ok(acquired)
        }
    }
}

async fn acquire_youtube_clip(
    services: &ServiceContainer,
    url: &str,
    job_id: &str,
    strategy: &AcquireStrategy,
    process: Arc<ProcessHandle>,
    sink: Arc<dyn ProgressSink>,
) -> Result<Acquired> {
    let client = reqwest::Client::new();
    let clip_data = clip::parse_clip_page(&client, url).await?;
    sink.emit("downloading", "Trimming clip from stream...", Some(0.0), "", "");

    clip::acquire_clip(
        &services.ytdlp,
        &services.tunnel,
        &clip_data,
        job_id,
        &strategy.temp_dir,
        Some(process),
        Some(progress_cb(sink, "downloading", "Trimming")),
    )
    .await
}

/// Acquire, then post-process to the requested output format, handling the
/// Twitter GIF special case. Returns the final file ready to serve.
pub async fn acquire_and_process(
    services: &ServiceContainer,
    url: &str,
    job_id: &str,
    params: &DownloadParams,
    strategy: &AcquireStrategy,
    process: Arc<ProcessHandle>,
    sink: Arc<dyn ProgressSink>,
    twitter_gifs: bool,
) -> Result<Processed> {
    let acquired = acquire(services, url, job_id, params, strategy, process.clone(), sink.clone()).await?;

    if tokio::fs::metadata(&acquired.path).await.is_err() {
        return Err(Error::Upstream("Downloaded file not found".to_string()));
    }

    let is_gif = twitter_gifs
        && !params.is_audio
        && downloader::is_twitter_url(url)
        && probe::probe_for_gif(&acquired.path).await;

    let output_ext = if is_gif { "gif".to_string() } else { params.output_ext() };
    let final_file = strategy
        .temp_dir
        .join(format!("{}{job_id}-final.{output_ext}", strategy.file_prefix));

    let message = if is_gif { "Converting to GIF..." } else { "Processing video..." };
    sink.emit("processing", message, Some(100.0), "", "");

    let opts = ProcessOpts {
        is_audio: params.is_audio,
        is_gif,
        audio_format: params.audio_format.clone(),
        audio_bitrate: params.audio_bitrate.clone(),
        container: params.container.clone(),
    };
    let processed = process_media(&acquired.path, &final_file, &opts, Some(process.clone())).await?;

    if !processed.skipped {
        let _ = tokio::fs::remove_file(&acquired.path).await;
    }

    if tokio::fs::metadata(&processed.path).await.is_err() {
        return Err(Error::Encoding("Processing failed - output file not created".to_string()));
    }
    if process.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(processed)
}

async fn remove_partial_files(temp_dir: &Path, prefix: &str, job_id: &str) {
    let full_prefix = format!("{prefix}{job_id}");
    let Ok(mut entries) = tokio::fs::read_dir(temp_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry
            .file_name()
            .to_string_lossy()
            .starts_with(&full_prefix)
        {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategies_differ_between_surfaces() {
        let web = AcquireStrategy::web(PathBuf::from("/tmp"));
        assert!(web.proxy_first);
        assert!(!web.proxy_retry);
        assert!(web.file_prefix.is_empty());

        let bot = AcquireStrategy::bot(PathBuf::from("/tmp"), "bot-");
        assert!(!bot.proxy_first);
        assert!(bot.proxy_retry);
        assert_eq!(bot.file_prefix, "bot-");
    }

    #[tokio::test]
    async fn remove_partial_files_matches_prefix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bot-job1.mp4.part"), b"x").unwrap();
        std::fs::write(dir.path().join("bot-job2.mp4"), b"x").unwrap();
        remove_partial_files(dir.path(), "bot-", "job1").await;
        assert!(!dir.path().join("bot-job1.mp4.part").exists());
        assert!(dir.path().join("bot-job2.mp4").exists());
    }
}
