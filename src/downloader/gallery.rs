//! gallery-dl wrapper.
//!
//! Galleries (image boards, social media photo posts) go through gallery-dl
//! rather than the video downloader. Metadata comes from `--dump-json`;
//! downloads land in a per-job directory and are packaged by the caller.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::downloader::auth::AuthService;
use crate::error::{Error, Result};
use crate::process::ProcessHandle;

const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

/// One image entry in a gallery metadata response.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GalleryImage {
    pub url: String,
    pub filename: String,
    pub extension: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct GalleryMetadata {
    pub title: String,
    #[serde(rename = "imageCount")]
    pub image_count: usize,
    pub images: Vec<GalleryImage>,
}

pub struct GalleryDl {
    auth: Arc<AuthService>,
    available: bool,
}

impl GalleryDl {
    pub fn new(auth: Arc<AuthService>) -> Self {
        let available = std::process::Command::new("gallery-dl")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !available {
            debug!("gallery-dl not found on PATH; gallery endpoints disabled");
        }
        Self { auth, available }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Probe the first few entries of a gallery for the metadata endpoint.
    pub async fn metadata(&self, url: &str) -> Result<GalleryMetadata> {
        if !self.available {
            return Err(Error::Upstream("gallery-dl not available".to_string()));
        }

        let mut args: Vec<String> = Vec::new();
        if self.auth.has_cookies_file() {
            args.push("--cookies".to_string());
            args.push(self.auth.cookies_path().to_string_lossy().into_owned());
        }
        args.extend([
            "--dump-json".to_string(),
            "--range".to_string(),
            "1-10".to_string(),
            url.to_string(),
        ]);

        let run = Command::new("gallery-dl")
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(METADATA_TIMEOUT, run).await {
            Ok(result) => result.map_err(|e| Error::Other(format!("failed to start gallery-dl: {e}")))?,
            Err(_) => return Err(Error::Timeout("Metadata fetch timed out (30s)".to_string())),
        };

        if !output.status.success() && output.stdout.is_empty() {
            return Err(Error::Upstream("gallery-dl failed".to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed = parse_dump(&stdout);
        if parsed.image_count == 0 {
            return Err(Error::Upstream("No images found".to_string()));
        }
        Ok(parsed)
    }

    /// Download a gallery into `gallery_dir`. Stdout chatter drives a coarse
    /// downloaded-count progress callback at most twice a second.
    pub async fn download(
        &self,
        url: &str,
        gallery_dir: &Path,
        job_id: &str,
        process: Arc<ProcessHandle>,
        on_count: impl Fn(usize) + Send + Sync + 'static,
    ) -> Result<()> {
        if !self.available {
            return Err(Error::Upstream("gallery-dl not available".to_string()));
        }

        let mut args: Vec<String> = Vec::new();
        if self.auth.has_cookies_file() {
            args.push("--cookies".to_string());
            args.push(self.auth.cookies_path().to_string_lossy().into_owned());
        }
        args.extend([
            "-d".to_string(),
            gallery_dir.to_string_lossy().into_owned(),
            "--filename".to_string(),
            "{num:03d}_{filename}.{extension}".to_string(),
            "--write-metadata".to_string(),
            url.to_string(),
        ]);

        info!(job = %crate::utils::short_id(job_id), "gallery-dl starting");

        let mut child = Command::new("gallery-dl")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Other(format!("failed to start gallery-dl: {e}")))?;

        process.set_pid(child.id());

        let stdout = child.stdout.take();
        let counter = tokio::spawn(async move {
            let Some(mut stdout) = stdout else { return };
            let mut buf = [0u8; 4096];
            let mut count = 0usize;
            let mut last_update = std::time::Instant::now();
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]);
                        if chunk.contains('/')
                            || chunk.contains(".jpg")
                            || chunk.contains(".png")
                            || chunk.contains(".gif")
                            || chunk.contains(".webp")
                        {
                            count += 1;
                            if last_update.elapsed() > Duration::from_millis(500) {
                                last_update = std::time::Instant::now();
                                on_count(count);
                            }
                        }
                    }
                }
            }
        });

        let mut stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut collected = String::new();
            if let Some(stderr) = stderr.as_mut() {
                let _ = stderr.read_to_string(&mut collected).await;
            }
            collected
        });

        let cancel = process.token();
        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                None
            }
        };

        let _ = counter.await;
        let stderr_output = stderr_task.await.unwrap_or_default();

        process.set_pid(None);
        if process.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match status {
            Some(Ok(status)) if status.success() => Ok(()),
            Some(Ok(_)) => {
                let msg: String = stderr_output.trim().chars().take(200).collect();
                Err(Error::Upstream(format!("gallery-dl failed: {msg}")))
            }
            Some(Err(e)) => Err(Error::Other(format!("failed waiting for gallery-dl: {e}"))),
            None => Err(Error::Cancelled),
        }
    }
}

/// Everything gallery-dl downloaded, excluding the metadata sidecars.
pub async fn collect_downloaded_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&current).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().map(|e| e != "json").unwrap_or(true) {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

pub fn image_mime(ext: &str) -> &'static str {
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

/// Parse `--dump-json` output: either one JSON array of `[type, url, meta]`
/// tuples, or a line stream of JSON objects.
fn parse_dump(stdout: &str) -> GalleryMetadata {
    let mut title = "Image".to_string();
    let mut images = Vec::new();

    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(stdout) {
        for item in items {
            let Value::Array(tuple) = item else { continue };
            if tuple.len() < 2 {
                continue;
            }
            if tuple[0].as_f64().map(|t| t < 0.0).unwrap_or(true) {
                continue;
            }
            let Some(url) = tuple[1].as_str().filter(|u| u.starts_with("http")) else {
                continue;
            };
            let mut image = GalleryImage {
                url: url.to_string(),
                filename: format!("image_{}", images.len() + 1),
                extension: "jpg".to_string(),
            };
            if let Some(meta) = tuple.get(2).and_then(|v| v.as_object()) {
                if let Some(fname) = meta.get("filename").and_then(|v| v.as_str()) {
                    image.filename = fname.to_string();
                }
                if let Some(ext) = meta.get("extension").and_then(|v| v.as_str()) {
                    image.extension = ext.to_string();
                }
                if title == "Image" {
                    for key in ["subcategory", "category", "gallery"] {
                        if let Some(v) = meta.get(key).and_then(|v| v.as_str()) {
                            if !v.is_empty() {
                                title = v.to_string();
                                break;
                            }
                        }
                    }
                }
            }
            images.push(image);
        }
    }

    if images.is_empty() {
        for line in stdout.trim().lines() {
            let Ok(Value::Object(item)) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            let filename = item
                .get("filename")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            if filename.is_empty() {
                continue;
            }
            images.push(GalleryImage {
                url: item.get("url").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                filename,
                extension: item
                    .get("extension")
                    .and_then(|v| v.as_str())
                    .unwrap_or("jpg")
                    .to_string(),
            });
            if title == "Image" {
                for key in ["subcategory", "category", "gallery"] {
                    if let Some(v) = item.get(key).and_then(|v| v.as_str()) {
                        if !v.is_empty() {
                            title = v.to_string();
                            break;
                        }
                    }
                }
            }
        }
    }

    let image_count = images.len();
    images.truncate(10);
    GalleryMetadata { title, image_count, images }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tuple_dump() {
        let stdout = r#"[[3,"https://cdn/a.jpg",{"filename":"a","extension":"jpg","category":"board"}],[-1,"skip"],[3,"https://cdn/b.png",{"filename":"b","extension":"png"}]]"#;
        let meta = parse_dump(stdout);
        assert_eq!(meta.image_count, 2);
        assert_eq!(meta.title, "board");
        assert_eq!(meta.images[0].filename, "a");
        assert_eq!(meta.images[1].extension, "png");
    }

    #[test]
    fn parses_line_stream_dump() {
        let stdout = "{\"filename\":\"x\",\"extension\":\"webp\",\"url\":\"https://cdn/x.webp\",\"gallery\":\"art\"}\n{\"filename\":\"y\"}\n";
        let meta = parse_dump(stdout);
        assert_eq!(meta.image_count, 2);
        assert_eq!(meta.title, "art");
        assert_eq!(meta.images[0].extension, "webp");
        assert_eq!(meta.images[1].extension, "jpg");
    }

    #[test]
    fn empty_dump_has_no_images() {
        assert_eq!(parse_dump("").image_count, 0);
        assert_eq!(parse_dump("not json").image_count, 0);
    }

    #[test]
    fn image_mime_table() {
        assert_eq!(image_mime("jpeg"), "image/jpeg");
        assert_eq!(image_mime("webp"), "image/webp");
        assert_eq!(image_mime("bin"), "application/octet-stream");
    }

    #[tokio::test]
    async fn collect_skips_metadata_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("001_a.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("001_a.jpg.json"), b"{}").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/002_b.png"), b"x").unwrap();

        let files = collect_downloaded_files(dir.path()).await;
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.extension().map(|e| e != "json").unwrap_or(false)));
    }
}
