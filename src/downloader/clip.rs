//! YouTube clip handling.
//!
//! Clip share pages embed the source video id and the clip window in inline
//! JSON; there is no API for it. Acquisition tries three strategies in
//! order: yt-dlp section download, an ffmpeg trim straight off a tunnel
//! stream URL, and finally a full tunnel download followed by a stream-copy
//! trim.

use std::path::Path;
use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use super::tunnel::TunnelClient;
use super::ytdlp::{DownloadOpts, ProgressFn, Ytdlp};
use super::Acquired;
use crate::config::TempDir;
use crate::error::{Error, Result};
use crate::media::{ffmpeg, runner};
use crate::process::ProcessHandle;

static VIDEO_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""videoId"\s*:\s*"([^"]+)""#).expect("videoId regex"));
static START_TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""startTimeMs"\s*:\s*"(\d+)""#).expect("startTimeMs regex"));
static END_TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""endTimeMs"\s*:\s*"(\d+)""#).expect("endTimeMs regex"));
static CLIP_CONFIG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""clipConfig"\s*:\s*\{[^}]*"startTimeMs"\s*:\s*"(\d+)"[^}]*"endTimeMs"\s*:\s*"(\d+)""#)
        .expect("clipConfig regex")
});

const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// The clip window extracted from a clip share page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipData {
    pub video_id: String,
    pub start_time_ms: u64,
    pub end_time_ms: u64,
}

impl ClipData {
    pub fn full_video_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.video_id)
    }

    pub fn start_secs(&self) -> f64 {
        self.start_time_ms as f64 / 1000.0
    }

    pub fn end_secs(&self) -> f64 {
        self.end_time_ms as f64 / 1000.0
    }

    pub fn duration_secs(&self) -> f64 {
        (self.end_time_ms.saturating_sub(self.start_time_ms)) as f64 / 1000.0
    }
}

/// Fetch and parse a clip share page.
pub async fn parse_clip_page(client: &reqwest::Client, clip_url: &str) -> Result<ClipData> {
    let resp = client
        .get(clip_url)
        .header("User-Agent", BROWSER_UA)
        .header("Accept-Language", "en-US,en;q=0.9")
        .send()
        .await
        .map_err(|e| Error::Upstream(format!("failed to fetch clip page: {e}")))?;
    let html = resp
        .text()
        .await
        .map_err(|e| Error::Upstream(format!("failed to read clip page: {e}")))?;

    parse_clip_html(&html)
}

fn parse_clip_html(html: &str) -> Result<ClipData> {
    let mut video_id = VIDEO_ID_RE
        .captures(html)
        .map(|c| c[1].to_string())
        .ok_or_else(|| Error::Upstream("could not find video ID in clip page".to_string()))?;

    let (mut start_ms, mut end_ms) = (0u64, 0u64);
    if let Some(caps) = CLIP_CONFIG_RE.captures(html) {
        start_ms = caps[1].parse().unwrap_or(0);
        end_ms = caps[2].parse().unwrap_or(0);
    }
    if start_ms == 0 && end_ms == 0 {
        if let Some(caps) = START_TIME_RE.captures(html) {
            start_ms = caps[1].parse().unwrap_or(0);
        }
        if let Some(caps) = END_TIME_RE.captures(html) {
            end_ms = caps[1].parse().unwrap_or(0);
        }
    }
    if start_ms == 0 && end_ms == 0 {
        return Err(Error::Upstream("could not find clip timestamps".to_string()));
    }

    if let Some(idx) = video_id.find('&') {
        video_id.truncate(idx);
    }

    Ok(ClipData { video_id, start_time_ms: start_ms, end_time_ms: end_ms })
}

/// Acquire a clip into `temp_dir`, trying each strategy in order.
pub async fn acquire_clip(
    ytdlp: &Ytdlp,
    tunnel: &TunnelClient,
    clip: &ClipData,
    job_id: &str,
    temp_dir: &Path,
    process: Option<Arc<ProcessHandle>>,
    on_progress: Option<ProgressFn>,
) -> Result<Acquired> {
    debug!(job = %crate::utils::short_id(job_id), "Trying yt-dlp section download");
    match download_sections(ytdlp, clip, job_id, temp_dir, on_progress.clone()).await {
        Ok(result) => return Ok(result),
        Err(e) if e.is_cancelled() => return Err(e),
        Err(e) => info!(job = %crate::utils::short_id(job_id), error = %e, "yt-dlp clip failed"),
    }

    let clip_file = temp_dir.join(format!("{job_id}-clip.mp4"));
    match stream_trim(tunnel, clip, job_id, &clip_file, process.clone(), on_progress.clone()).await
    {
        Ok(result) => return Ok(result),
        Err(e) if e.is_cancelled() => return Err(e),
        Err(e) => info!(job = %crate::utils::short_id(job_id), error = %e, "Stream trim failed"),
    }

    info!(job = %crate::utils::short_id(job_id), "Falling back to full tunnel download + trim");
    full_download_trim(tunnel, clip, job_id, temp_dir, process, on_progress).await
}

/// Strategy 1: yt-dlp `--download-sections` with keyframe cuts.
async fn download_sections(
    ytdlp: &Ytdlp,
    clip: &ClipData,
    job_id: &str,
    temp_dir: &Path,
    on_progress: Option<ProgressFn>,
) -> Result<Acquired> {
    let result = ytdlp
        .download_clip_sections(
            &clip.full_video_url(),
            job_id,
            temp_dir,
            clip.start_secs(),
            clip.end_secs(),
            on_progress,
        )
        .await?;

    let size = crate::utils::fs::file_size(&result.path).await;
    if size < 10_000 {
        let _ = tokio::fs::remove_file(&result.path).await;
        return Err(Error::Upstream("clip output too small".to_string()));
    }
    info!(
        job = %crate::utils::short_id(job_id),
        mb = %format!("{:.2}", size as f64 / 1024.0 / 1024.0),
        "yt-dlp clip download complete"
    );
    Ok(result)
}

/// Strategy 2: re-encode directly from a tunnel stream URL, seeking to the
/// clip window.
async fn stream_trim(
    tunnel: &TunnelClient,
    clip: &ClipData,
    job_id: &str,
    output: &Path,
    process: Option<Arc<ProcessHandle>>,
    on_progress: Option<ProgressFn>,
) -> Result<Acquired> {
    debug!(job = %crate::utils::short_id(job_id), "Getting stream URL for clip trim");
    let resolved = tunnel.resolve_url(&clip.full_video_url(), false, "1080").await?;

    let duration = clip.duration_secs();
    let args = ffmpeg::stream_trim_args(&resolved.url, output, clip.start_secs(), duration);

    let on_time: Option<runner::TimeProgressFn> = on_progress.map(|cb| {
        let f: runner::TimeProgressFn = Arc::new(move |secs, _| {
            let progress = (secs / duration * 100.0).min(100.0);
            cb(progress, "", "");
        });
        f
    });

    runner::run_ffmpeg(&args, runner::RunOptions { process, on_time, timeout: None })
        .await
        .map_err(|e| match e {
            Error::Cancelled => Error::Cancelled,
            _ => Error::Upstream("Stream trim failed".to_string()),
        })?;

    let size = runner::check_output(output, 10_000)
        .await
        .map_err(|_| Error::Upstream("Stream trim produced empty output".to_string()))?;
    info!(
        job = %crate::utils::short_id(job_id),
        mb = %format!("{:.2}", size as f64 / 1024.0 / 1024.0),
        "Stream clip complete"
    );
    Ok(Acquired { path: output.to_path_buf(), ext: "mp4".to_string() })
}

/// Strategy 3: pull the whole video through the tunnel, then stream-copy
/// the clip window out of it.
async fn full_download_trim(
    tunnel: &TunnelClient,
    clip: &ClipData,
    job_id: &str,
    temp_dir: &Path,
    process: Option<Arc<ProcessHandle>>,
    on_progress: Option<ProgressFn>,
) -> Result<Acquired> {
    let tunnel_progress = on_progress.map(|cb| {
        let f: super::tunnel::ByteProgressFn = Arc::new(move |progress, _, _| {
            // The trim after the download is quick; scale to leave headroom.
            cb(progress * 0.8, "", "");
        });
        f
    });

    let downloaded = tunnel
        .download(
            &clip.full_video_url(),
            job_id,
            false,
            temp_dir,
            process.clone(),
            tunnel_progress,
            Default::default(),
        )
        .await?;

    let trimmed = temp_dir.join(format!("{job_id}-trimmed.{}", downloaded.ext));
    let args =
        ffmpeg::copy_trim_args(&downloaded.path, &trimmed, clip.start_secs(), clip.duration_secs());
    runner::run_ffmpeg(&args, runner::RunOptions { process, on_time: None, timeout: None })
        .await
        .map_err(|e| match e {
            Error::Cancelled => Error::Cancelled,
            _ => Error::Upstream("Trim failed".to_string()),
        })?;

    let _ = tokio::fs::remove_file(&downloaded.path).await;

    runner::check_output(&trimmed, 10_000)
        .await
        .map_err(|_| Error::Upstream("Trimmed clip is too small, trim may have failed".to_string()))?;
    Ok(Acquired { path: trimmed, ext: downloaded.ext })
}

/// Working directory default for clip temp files.
pub fn default_clip_dir() -> std::path::PathBuf {
    TempDir::Download.path()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clip_config_block() {
        let html = r#"..."videoId":"abc123","clipConfig":{"postId":"x","startTimeMs":"15000","endTimeMs":"30000"}..."#;
        let clip = parse_clip_html(html).unwrap();
        assert_eq!(clip.video_id, "abc123");
        assert_eq!(clip.start_time_ms, 15000);
        assert_eq!(clip.end_time_ms, 30000);
        assert_eq!(clip.duration_secs(), 15.0);
        assert_eq!(clip.full_video_url(), "https://www.youtube.com/watch?v=abc123");
    }

    #[test]
    fn falls_back_to_loose_time_fields() {
        let html = r#""videoId":"vid1" ... "startTimeMs":"1000" ... "endTimeMs":"2500""#;
        let clip = parse_clip_html(html).unwrap();
        assert_eq!(clip.start_time_ms, 1000);
        assert_eq!(clip.end_time_ms, 2500);
    }

    #[test]
    fn missing_video_id_is_an_error() {
        assert!(parse_clip_html("no json here").is_err());
    }

    #[test]
    fn missing_timestamps_is_an_error() {
        let html = r#""videoId":"abc123" and nothing else"#;
        assert!(parse_clip_html(html).is_err());
    }

    #[test]
    fn video_id_is_truncated_at_ampersand() {
        let html = r#""videoId":"abc&t=5","startTimeMs":"1","endTimeMs":"2""#;
        let clip = parse_clip_html(html).unwrap();
        assert_eq!(clip.video_id, "abc");
    }
}
