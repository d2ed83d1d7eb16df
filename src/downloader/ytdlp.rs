//! yt-dlp invocation.
//!
//! The primary acquisition path for almost everything. Downloads run with
//! `--newline` and a bare percent progress template so stdout is a stream of
//! parseable lines; stderr carries `[download]` progress for some extractors
//! plus the `ERROR:` lines surfaced to users. Output files are discovered by
//! prefix scan because yt-dlp picks the final extension itself.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use super::{Acquired, is_youtube_url};
use crate::config;
use crate::downloader::auth::AuthService;
use crate::error::{Error, Result};
use crate::media::progress::{extract_ytdlp_error, parse_ytdlp_progress};
use crate::process::ProcessHandle;

const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

/// Progress callback: percent, speed, eta.
pub type ProgressFn = Arc<dyn Fn(f64, &str, &str) + Send + Sync>;

#[derive(Clone)]
pub struct DownloadOpts {
    pub is_audio: bool,
    pub audio_format: String,
    pub quality: String,
    pub container: String,
    pub temp_dir: PathBuf,
    pub file_prefix: String,
    pub process: Option<Arc<ProcessHandle>>,
    pub playlist: bool,
    pub use_proxy: bool,
    pub on_progress: Option<ProgressFn>,
}

impl Default for DownloadOpts {
    fn default() -> Self {
        Self {
            is_audio: false,
            audio_format: "mp3".to_string(),
            quality: "1080p".to_string(),
            container: "mp4".to_string(),
            temp_dir: config::TempDir::Download.path(),
            file_prefix: String::new(),
            process: None,
            playlist: false,
            use_proxy: false,
            on_progress: None,
        }
    }
}

/// Flat playlist listing.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistEntry {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct PlaylistInfo {
    pub title: String,
    pub entries: Vec<PlaylistEntry>,
    pub count: usize,
}

/// Single-video metadata printed by yt-dlp.
#[derive(Debug, Clone, Default)]
pub struct MediaMetadata {
    pub title: String,
    pub ext: String,
    pub id: String,
    pub uploader: String,
    pub duration: String,
    pub thumbnail: String,
}

/// Playlist metadata for the metadata endpoint.
#[derive(Debug, Clone, Default)]
pub struct PlaylistMetadata {
    pub title: String,
    pub video_count: usize,
    pub video_titles: Vec<String>,
}

pub struct Ytdlp {
    auth: Arc<AuthService>,
}

impl Ytdlp {
    pub fn new(auth: Arc<AuthService>) -> Self {
        Self { auth }
    }

    fn base_args(&self, youtube: bool, use_proxy: bool) -> Vec<String> {
        let mut args = if youtube { self.auth.youtube_auth_args() } else { Vec::new() };
        if use_proxy {
            args.extend(self.auth.proxy_args());
        }
        args
    }

    /// Download a URL into `opts.temp_dir`. Progress flows through
    /// `opts.on_progress` at >=2-point deltas.
    pub async fn download(&self, url: &str, job_id: &str, opts: DownloadOpts) -> Result<Acquired> {
        let template = opts
            .temp_dir
            .join(format!("{}{}.%(ext)s", opts.file_prefix, job_id));

        let mut args = self.base_args(is_youtube_url(url), opts.use_proxy);
        args.extend([
            "--continue".to_string(),
            "-t".to_string(),
            "sleep".to_string(),
        ]);
        args.push(if opts.playlist { "--yes-playlist" } else { "--no-playlist" }.to_string());
        args.extend([
            "--newline".to_string(),
            "--progress-template".to_string(),
            "%(progress._percent_str)s".to_string(),
            "-o".to_string(),
            template.to_string_lossy().into_owned(),
            "--ffmpeg-location".to_string(),
            "/usr/bin/ffmpeg".to_string(),
        ]);

        if opts.is_audio {
            args.extend(["-f".to_string(), "bestaudio/best".to_string()]);
        } else {
            let selector = match config::quality_height(&opts.quality) {
                Some(max) => format!(
                    "bv[vcodec^=avc][height<={max}]+ba[acodec^=mp4a]/bv[height<={max}]+ba/b"
                ),
                None => "bv[vcodec^=avc]+ba[acodec^=mp4a]/bv+ba/b".to_string(),
            };
            args.extend([
                "-f".to_string(),
                selector,
                "--merge-output-format".to_string(),
                opts.container.clone(),
            ]);
        }
        args.push(url.to_string());

        debug!(job = %crate::utils::short_id(job_id), "Starting yt-dlp");
        execute(&args, opts.process.clone(), opts.on_progress.clone()).await?;

        find_output(&opts.temp_dir, &format!("{}{}", opts.file_prefix, job_id)).await
    }

    /// Download only the clip window of a video via `--download-sections`.
    pub async fn download_clip_sections(
        &self,
        full_video_url: &str,
        job_id: &str,
        temp_dir: &Path,
        start_secs: f64,
        end_secs: f64,
        on_progress: Option<ProgressFn>,
    ) -> Result<Acquired> {
        let template = temp_dir.join(format!("{job_id}-ytclip.%(ext)s"));

        let mut args = self.auth.youtube_auth_args();
        args.extend(self.auth.proxy_args());
        args.extend([
            "--no-playlist".to_string(),
            "--download-sections".to_string(),
            format!("*{start_secs}-{end_secs}"),
            "--force-keyframes-at-cuts".to_string(),
            "-f".to_string(),
            "bv[vcodec^=avc][height<=1080]+ba[acodec^=mp4a]/bv[height<=1080]+ba/b".to_string(),
            "--merge-output-format".to_string(),
            "mp4".to_string(),
            "--newline".to_string(),
            "--progress-template".to_string(),
            "%(progress._percent_str)s".to_string(),
            "-o".to_string(),
            template.to_string_lossy().into_owned(),
            "--ffmpeg-location".to_string(),
            "/usr/bin/ffmpeg".to_string(),
            full_video_url.to_string(),
        ]);

        execute(&args, None, on_progress)
            .await
            .map_err(|e| match e {
                Error::Upstream(msg) => Error::Upstream(format!("yt-dlp clip download failed: {msg}")),
                other => other,
            })?;

        find_output(temp_dir, &format!("{job_id}-ytclip"))
            .await
            .map_err(|_| Error::Upstream("yt-dlp clip file not found".to_string()))
    }

    /// Flat playlist listing via `-J --flat-playlist`.
    pub async fn playlist_info(&self, url: &str, use_proxy: bool) -> Result<PlaylistInfo> {
        let mut args = self.base_args(true, use_proxy);
        args.extend([
            "-t".to_string(),
            "sleep".to_string(),
            "--yes-playlist".to_string(),
            "--flat-playlist".to_string(),
            "-J".to_string(),
            url.to_string(),
        ]);

        let output = Command::new("yt-dlp")
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Other(format!("failed to start yt-dlp: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let msg = extract_ytdlp_error(&stderr)
                .unwrap_or_else(|| "Failed to get playlist info".to_string());
            return Err(Error::Upstream(msg));
        }

        #[derive(Deserialize)]
        struct RawPlaylist {
            #[serde(default)]
            title: String,
            #[serde(default)]
            entries: Vec<PlaylistEntry>,
            #[serde(default)]
            playlist_count: usize,
        }

        let raw: RawPlaylist = serde_json::from_slice(&output.stdout)
            .map_err(|_| Error::Upstream("Failed to parse playlist info".to_string()))?;

        let count = if raw.playlist_count > 0 { raw.playlist_count } else { raw.entries.len() };
        let title = if raw.title.is_empty() { "Playlist".to_string() } else { raw.title };
        Ok(PlaylistInfo { title, entries: raw.entries, count })
    }

    /// Metadata for a single video via `--print` fields.
    pub async fn single_metadata(&self, url: &str, use_proxy: bool) -> Result<MediaMetadata> {
        let mut args = self.base_args(is_youtube_url(url), use_proxy);
        args.extend([
            "-t".to_string(),
            "sleep".to_string(),
            "--no-playlist".to_string(),
        ]);
        for field in ["title", "ext", "id", "uploader", "duration", "thumbnail"] {
            args.push("--print".to_string());
            args.push(format!("%({field})s"));
        }
        args.push(url.to_string());

        let lines = self.print_lines(&args).await?;
        let get = |i: usize| lines.get(i).cloned().unwrap_or_default();
        Ok(MediaMetadata {
            title: or_default(get(0), "download"),
            ext: or_default(get(1), "mp4"),
            id: get(2),
            uploader: get(3),
            duration: get(4),
            thumbnail: get(5),
        })
    }

    /// Metadata for a playlist via `--print` fields.
    pub async fn playlist_metadata(&self, url: &str, use_proxy: bool) -> Result<PlaylistMetadata> {
        let mut args = self.base_args(is_youtube_url(url), use_proxy);
        args.extend([
            "-t".to_string(),
            "sleep".to_string(),
            "--yes-playlist".to_string(),
            "--flat-playlist".to_string(),
        ]);
        for field in ["playlist_title", "playlist_count", "title"] {
            args.push("--print".to_string());
            args.push(format!("%({field})s"));
        }
        args.push(url.to_string());

        let lines = self.print_lines(&args).await?;
        let title = lines.first().cloned().unwrap_or_else(|| "Playlist".to_string());
        let mut video_count = lines
            .get(1)
            .and_then(|l| l.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let video_titles: Vec<String> = lines
            .iter()
            .skip(2)
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if video_count == 0 {
            video_count = video_titles.len();
        }
        Ok(PlaylistMetadata { title, video_count, video_titles })
    }

    async fn print_lines(&self, args: &[String]) -> Result<Vec<String>> {
        let run = Command::new("yt-dlp")
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(METADATA_TIMEOUT, run).await {
            Ok(result) => result.map_err(|e| Error::Other(format!("failed to start yt-dlp: {e}")))?,
            Err(_) => return Err(Error::Timeout("Metadata fetch timed out (30s)".to_string())),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(Error::Upstream(
                extract_ytdlp_error(&stderr).unwrap_or(stderr),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .trim()
            .split('\n')
            .map(|l| l.to_string())
            .collect())
    }

    /// Fetch a URL into the uploads dir as if the user had uploaded it.
    /// Returns the final path printed by yt-dlp.
    pub async fn fetch_to_upload(&self, url: &str, id: &str, use_proxy: bool) -> Result<PathBuf> {
        let template = config::TempDir::Upload
            .path()
            .join(format!("{id}-%(title)s.%(ext)s"));

        let mut args = if use_proxy { self.auth.proxy_args() } else { Vec::new() };
        args.extend([
            "--no-playlist".to_string(),
            "-f".to_string(),
            "bv*+ba/b".to_string(),
            "-o".to_string(),
            template.to_string_lossy().into_owned(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
            "--no-warnings".to_string(),
            url.to_string(),
        ]);

        let output = Command::new("yt-dlp")
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Other(format!("failed to start yt-dlp: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let msg = stderr
                .trim()
                .lines()
                .last()
                .unwrap_or("yt-dlp failed")
                .to_string();
            return Err(Error::Upstream(msg));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let path = PathBuf::from(stdout.trim().lines().last().unwrap_or_default());
        if path.as_os_str().is_empty() || tokio::fs::metadata(&path).await.is_err() {
            return Err(Error::Upstream("yt-dlp did not produce a file".to_string()));
        }
        Ok(path)
    }

    /// Best-effort title lookup for artifact naming.
    pub async fn video_title(&self, url: &str) -> Option<String> {
        let mut args = self.base_args(is_youtube_url(url), is_youtube_url(url));
        args.extend([
            "--print".to_string(),
            "title".to_string(),
            "--no-playlist".to_string(),
            url.to_string(),
        ]);
        let output = Command::new("yt-dlp")
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let title: String = String::from_utf8_lossy(&output.stdout)
            .trim()
            .chars()
            .take(100)
            .collect();
        if title.is_empty() { None } else { Some(title) }
    }
}

/// Spawn yt-dlp with piped output, stream progress from both pipes, and
/// wait under the job's cancellation token.
async fn execute(
    args: &[String],
    process: Option<Arc<ProcessHandle>>,
    on_progress: Option<ProgressFn>,
) -> Result<()> {
    let mut child = Command::new("yt-dlp")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Other(format!("failed to start yt-dlp: {e}")))?;

    if let Some(process) = &process {
        process.set_pid(child.id());
    }

    let last_progress = Arc::new(Mutex::new(0.0f64));

    let stdout = child.stdout.take();
    let stdout_task = {
        let last_progress = last_progress.clone();
        let on_progress = on_progress.clone();
        tokio::spawn(async move {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                report_progress(&line, &last_progress, &on_progress);
            }
        })
    };

    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut collected = String::new();
        let Some(stderr) = stderr else { return collected };
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.contains("[download]") && line.contains('%') {
                report_progress(&line, &last_progress, &on_progress);
            }
            collected.push_str(&line);
            collected.push('\n');
            // Bound memory on pathological extractor chatter.
            if collected.len() > 256 * 1024 {
                let cut = collected.len() - 128 * 1024;
                collected.drain(..cut);
            }
        }
        collected
    });

    let cancel = process.as_ref().map(|p| p.token()).unwrap_or_default();
    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            None
        }
    };

    let _ = stdout_task.await;
    let stderr_output = stderr_task.await.unwrap_or_default();

    if let Some(process) = &process {
        process.set_pid(None);
        if process.is_cancelled() {
            return Err(Error::Cancelled);
        }
    }

    match status {
        Some(Ok(status)) if status.success() => Ok(()),
        Some(Ok(_)) => {
            let msg = extract_ytdlp_error(&stderr_output)
                .unwrap_or_else(|| "Download failed".to_string());
            Err(Error::Upstream(msg))
        }
        Some(Err(e)) => Err(Error::Other(format!("failed waiting for yt-dlp: {e}"))),
        None => Err(Error::Cancelled),
    }
}

fn report_progress(line: &str, last_progress: &Mutex<f64>, on_progress: &Option<ProgressFn>) {
    let p = parse_ytdlp_progress(line);
    if p.percent <= 0.0 {
        return;
    }
    let should_report = {
        let mut last = last_progress.lock();
        if p.percent > *last + 2.0 || p.percent >= 100.0 {
            *last = p.percent;
            true
        } else {
            false
        }
    };
    if should_report {
        if let Some(cb) = on_progress {
            cb(p.percent, &p.speed, &p.eta);
        }
    }
}

/// Markers of intermediate/partial files that must not be picked up as the
/// final download output.
const SKIP_MARKERS: [&str; 4] = ["-final", "-tunnel", "-clip", "-trimmed"];

async fn find_output(temp_dir: &Path, prefix: &str) -> Result<Acquired> {
    let mut entries = tokio::fs::read_dir(temp_dir)
        .await
        .map_err(|e| Error::Other(format!("failed to read temp dir: {e}")))?;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy().into_owned();
        if !name.starts_with(prefix) {
            continue;
        }
        if SKIP_MARKERS.iter().any(|m| name.contains(m))
            || name.ends_with(".part")
            || name.contains(".part-Frag")
        {
            continue;
        }
        let path = entry.path();
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(file = %name, "yt-dlp output located");
        return Ok(Acquired { path, ext });
    }

    Err(Error::Upstream("Downloaded file not found".to_string()))
}

fn or_default(s: String, def: &str) -> String {
    if s.is_empty() || s == "NA" { def.to_string() } else { s }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_reports_throttle_small_deltas() {
        let last = Mutex::new(0.0f64);
        let seen: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let cb: Option<ProgressFn> = Some(Arc::new(move |p, _, _| {
            seen_cb.lock().push(p);
        }));

        for line in [" 1.0%", " 2.0%", " 3.5%", " 4.0%", " 50.0%", "100.0%"] {
            report_progress(line, &last, &cb);
        }
        // 1.0 (first above 0+2? 1.0 > 2.0 is false) -> skipped; 3.5 > 2 ->
        // reported; 4.0 within 2 of 3.5 -> skipped; 50 and 100 reported.
        assert_eq!(*seen.lock(), vec![3.5, 50.0, 100.0]);
    }

    #[tokio::test]
    async fn find_output_skips_partials_and_intermediates() {
        let dir = tempfile::tempdir().unwrap();
        let mk = |name: &str| std::fs::write(dir.path().join(name), b"x").unwrap();
        mk("job1-final.mp4");
        mk("job1.mp4.part");
        mk("job1.f137.mp4.part-Frag3");
        mk("other.mp4");
        mk("job1.webm");

        let found = find_output(dir.path(), "job1").await.unwrap();
        assert_eq!(found.ext, "webm");
        assert!(found.path.ends_with("job1.webm"));
    }

    #[tokio::test]
    async fn find_output_errors_when_nothing_matches() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_output(dir.path(), "job1").await.unwrap_err();
        assert_eq!(err.user_message(), "Download failed");
    }

    #[test]
    fn or_default_handles_na() {
        assert_eq!(or_default("NA".into(), "mp4"), "mp4");
        assert_eq!(or_default("".into(), "mp4"), "mp4");
        assert_eq!(or_default("webm".into(), "mp4"), "webm");
    }
}
