//! Tunnel API client.
//!
//! For sites the primary downloader refuses, a family of third-party tunnel
//! endpoints unwraps a page URL into a direct media URL. The response is a
//! tagged union (`tunnel`/`redirect`/`picker`/`error`) parsed exactly once
//! at this boundary. Endpoints are tried in order; when the whole list
//! fails, the list is retried with exponential backoff. File downloads
//! resume from an existing `.part` via a Range request.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::Acquired;
use crate::config;
use crate::error::{Error, Result};
use crate::process::ProcessHandle;

/// Byte progress callback: percent, downloaded bytes, total bytes.
pub type ByteProgressFn = Arc<dyn Fn(f64, u64, u64) + Send + Sync>;

/// The four response kinds a tunnel endpoint can return.
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum TunnelResponse {
    Tunnel {
        url: String,
        #[serde(default)]
        filename: Option<String>,
    },
    Redirect {
        url: String,
        #[serde(default)]
        filename: Option<String>,
    },
    Picker {
        #[serde(default)]
        picker: Vec<PickerItem>,
        #[serde(default)]
        filename: Option<String>,
    },
    Error {
        #[serde(default)]
        error: TunnelError,
    },
}

#[derive(Debug, Default, Deserialize)]
struct TunnelError {
    #[serde(default)]
    code: String,
}

#[derive(Debug, Deserialize)]
struct PickerItem {
    #[serde(default)]
    url: String,
}

/// A direct media URL resolved through a tunnel endpoint.
#[derive(Debug, Clone)]
pub struct ResolvedUrl {
    pub url: String,
    pub filename: String,
    pub status: &'static str,
    pub endpoint: String,
}

#[derive(Debug, Clone)]
pub struct TunnelDownloadOpts {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for TunnelDownloadOpts {
    fn default() -> Self {
        Self { max_retries: 3, retry_delay: Duration::from_secs(2) }
    }
}

pub struct TunnelClient {
    client: reqwest::Client,
    endpoints: Vec<String>,
    api_key: Option<String>,
}

impl TunnelClient {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints: config::TUNNEL_ENDPOINTS.iter().map(|s| s.to_string()).collect(),
            api_key,
        }
    }

    #[cfg(test)]
    fn with_endpoints(endpoints: Vec<String>) -> Self {
        Self { client: reqwest::Client::new(), endpoints, api_key: None }
    }

    async fn post_one(
        &self,
        endpoint: &str,
        url: &str,
        audio_only: bool,
        video_quality: &str,
    ) -> Result<TunnelResponse> {
        let body = json!({
            "url": url,
            "downloadMode": if audio_only { "audio" } else { "auto" },
            "filenameStyle": "basic",
            "videoQuality": video_quality,
        });

        let mut request = self
            .client
            .post(endpoint)
            .header("Accept", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Api-Key {key}"));
        }

        let resp = request.send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;

        let parsed: std::result::Result<TunnelResponse, _> = serde_json::from_slice(&bytes);

        if !status.is_success() {
            // Error bodies may still carry a useful code.
            if let Ok(TunnelResponse::Error { error }) = parsed {
                if !error.code.is_empty() {
                    return Err(Error::Upstream(error.code));
                }
            }
            return Err(Error::Upstream(format!("HTTP {}", status.as_u16())));
        }

        match parsed {
            Ok(TunnelResponse::Error { error }) => {
                let code = if error.code.is_empty() { "Tunnel error".to_string() } else { error.code };
                Err(Error::Upstream(code))
            }
            Ok(resp) => Ok(resp),
            Err(_) => Err(Error::Upstream("invalid JSON response".to_string())),
        }
    }

    fn direct_url(response: TunnelResponse) -> Option<(String, Option<String>, &'static str)> {
        match response {
            TunnelResponse::Tunnel { url, filename } => Some((url, filename, "tunnel")),
            TunnelResponse::Redirect { url, filename } => Some((url, filename, "redirect")),
            TunnelResponse::Picker { picker, filename } => picker
                .into_iter()
                .map(|p| p.url)
                .find(|u| !u.is_empty())
                .map(|url| (url, filename, "picker")),
            TunnelResponse::Error { .. } => None,
        }
    }

    /// Resolve a page URL to a direct media URL, trying each endpoint once.
    pub async fn resolve_url(
        &self,
        url: &str,
        audio_only: bool,
        video_quality: &str,
    ) -> Result<ResolvedUrl> {
        let quality = if video_quality.is_empty() { "1080" } else { video_quality };
        let mut last_err: Option<Error> = None;

        for endpoint in &self.endpoints {
            debug!(endpoint = %endpoint, "Resolving via tunnel");
            match self.post_one(endpoint, url, audio_only, quality).await {
                Ok(response) => match Self::direct_url(response) {
                    Some((direct, filename, status)) => {
                        info!(endpoint = %endpoint, status, "Tunnel resolved URL");
                        return Ok(ResolvedUrl {
                            url: direct,
                            filename: filename.unwrap_or_else(|| "download".to_string()),
                            status,
                            endpoint: endpoint.clone(),
                        });
                    }
                    None => last_err = Some(Error::Upstream("No download URL in response".into())),
                },
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "Tunnel endpoint failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Upstream("All tunnel instances failed".into())))
    }

    /// Metadata derived from the tunnel's filename (title and extension).
    pub async fn fetch_metadata(&self, url: &str) -> Result<(String, String)> {
        let resolved = self.resolve_url(url, false, "1080").await?;
        let filename = resolved.filename;
        let (title, ext) = match filename.rfind('.') {
            Some(idx) if idx > 0 => (filename[..idx].to_string(), filename[idx + 1..].to_string()),
            _ => (filename, String::new()),
        };
        let title = if title.is_empty() { "download".to_string() } else { title };
        let ext = if ext.is_empty() { "mp4".to_string() } else { ext };
        Ok((title, ext))
    }

    /// Download a URL through the tunnel family into `output_dir`, with
    /// whole-list retries, exponential backoff and `.part` resume.
    #[allow(clippy::too_many_arguments)]
    pub async fn download(
        &self,
        url: &str,
        job_id: &str,
        audio_only: bool,
        output_dir: &Path,
        process: Option<Arc<ProcessHandle>>,
        on_progress: Option<ByteProgressFn>,
        opts: TunnelDownloadOpts,
    ) -> Result<Acquired> {
        let ext = if audio_only { "mp3" } else { "mp4" };
        let output_path = output_dir.join(format!("{job_id}-tunnel.{ext}"));
        let part_path = output_dir.join(format!("{job_id}-tunnel.{ext}.part"));

        let cancel = process.as_ref().map(|p| p.token()).unwrap_or_default();
        let mut last_err: Option<Error> = None;
        let mut attempt = 0u32;
        let started = std::time::Instant::now();

        for retry in 0..opts.max_retries {
            for endpoint in &self.endpoints {
                attempt += 1;
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                debug!(
                    job = %crate::utils::short_id(job_id),
                    attempt,
                    endpoint = %endpoint,
                    retry = retry + 1,
                    "Tunnel download attempt"
                );

                let response = match self.post_one(endpoint, url, audio_only, "1080").await {
                    Ok(response) => response,
                    Err(e) => {
                        debug!(endpoint = %endpoint, error = %e, "Tunnel endpoint failed");
                        last_err = Some(e);
                        continue;
                    }
                };
                let Some((direct_url, _, _)) = Self::direct_url(response) else {
                    last_err = Some(Error::Upstream("No download URL from tunnel".into()));
                    continue;
                };

                match self
                    .fetch_file(&direct_url, &part_path, &output_path, &cancel, &on_progress, job_id)
                    .await
                {
                    Ok(()) => {
                        let size = crate::utils::fs::file_size(&output_path).await;
                        info!(
                            job = %crate::utils::short_id(job_id),
                            endpoint = %endpoint,
                            secs = %format!("{:.1}", started.elapsed().as_secs_f64()),
                            mb = %format!("{:.1}", size as f64 / 1024.0 / 1024.0),
                            "Tunnel download complete"
                        );
                        return Ok(Acquired { path: output_path, ext: ext.to_string() });
                    }
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        debug!(error = %e, "Tunnel file download failed");
                        last_err = Some(e);
                    }
                }
            }

            if retry + 1 < opts.max_retries {
                let delay = opts.retry_delay * 2u32.pow(retry);
                warn!(
                    job = %crate::utils::short_id(job_id),
                    delay_secs = delay.as_secs(),
                    "All tunnel instances failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                }
            }
        }

        warn!(
            job = %crate::utils::short_id(job_id),
            attempts = attempt,
            secs = %format!("{:.1}", started.elapsed().as_secs_f64()),
            "All tunnel attempts failed"
        );
        Err(last_err.unwrap_or_else(|| Error::Upstream("All tunnel instances failed".into())))
    }

    async fn fetch_file(
        &self,
        direct_url: &str,
        part_path: &Path,
        output_path: &Path,
        cancel: &tokio_util::sync::CancellationToken,
        on_progress: &Option<ByteProgressFn>,
        job_id: &str,
    ) -> Result<()> {
        let start_byte = tokio::fs::metadata(part_path).await.map(|m| m.len()).unwrap_or(0);
        if start_byte > 0 {
            debug!(job = %crate::utils::short_id(job_id), start_byte, "Resuming partial download");
        }

        let mut request = self.client.get(direct_url);
        if start_byte > 0 {
            request = request.header("Range", format!("bytes={start_byte}-"));
        }

        let resp = request.send().await?;
        let status = resp.status().as_u16();

        if status == 416 && start_byte > 0 {
            // The server says our resume offset is past the end: the part
            // file already holds the complete body.
            tokio::fs::rename(part_path, output_path).await?;
            debug!(job = %crate::utils::short_id(job_id), "File already complete");
            return Ok(());
        }
        if status != 200 && status != 206 {
            return Err(Error::Upstream(format!("File download failed: HTTP {status}")));
        }

        let content_length = resp.content_length().unwrap_or(0);
        let total_size = start_byte + content_length;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .append(start_byte > 0)
            .truncate(start_byte == 0)
            .open(part_path)
            .await?;

        let mut downloaded = start_byte;
        let mut stream = resp.bytes_stream();
        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            };
            match chunk {
                Some(Ok(bytes)) => {
                    file.write_all(&bytes).await?;
                    downloaded += bytes.len() as u64;
                    if let Some(cb) = on_progress {
                        if total_size > 0 {
                            let progress =
                                (downloaded as f64 / total_size as f64 * 100.0).min(100.0);
                            cb(progress, downloaded, total_size);
                        }
                    }
                }
                Some(Err(e)) => return Err(Error::Http(e)),
                None => break,
            }
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(part_path, output_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tunnel_variant() {
        let raw = r#"{"status":"tunnel","url":"https://cdn/x.mp4","filename":"clip.mp4"}"#;
        let resp: TunnelResponse = serde_json::from_str(raw).unwrap();
        let (url, filename, status) = TunnelClient::direct_url(resp).unwrap();
        assert_eq!(url, "https://cdn/x.mp4");
        assert_eq!(filename.as_deref(), Some("clip.mp4"));
        assert_eq!(status, "tunnel");
    }

    #[test]
    fn parses_redirect_variant() {
        let raw = r#"{"status":"redirect","url":"https://cdn/y.webm"}"#;
        let resp: TunnelResponse = serde_json::from_str(raw).unwrap();
        let (url, _, status) = TunnelClient::direct_url(resp).unwrap();
        assert_eq!(url, "https://cdn/y.webm");
        assert_eq!(status, "redirect");
    }

    #[test]
    fn picker_takes_first_entry() {
        let raw = r#"{"status":"picker","picker":[{"url":"https://a"},{"url":"https://b"}]}"#;
        let resp: TunnelResponse = serde_json::from_str(raw).unwrap();
        let (url, _, status) = TunnelClient::direct_url(resp).unwrap();
        assert_eq!(url, "https://a");
        assert_eq!(status, "picker");
    }

    #[test]
    fn empty_picker_yields_none() {
        let raw = r#"{"status":"picker","picker":[]}"#;
        let resp: TunnelResponse = serde_json::from_str(raw).unwrap();
        assert!(TunnelClient::direct_url(resp).is_none());
    }

    #[test]
    fn error_variant_carries_code() {
        let raw = r#"{"status":"error","error":{"code":"content.video.unavailable"}}"#;
        let resp: TunnelResponse = serde_json::from_str(raw).unwrap();
        assert!(TunnelClient::direct_url(resp).is_none());
    }

    #[tokio::test]
    async fn unreachable_endpoints_surface_last_error() {
        let client = TunnelClient::with_endpoints(vec![
            "http://127.0.0.1:1/api".to_string(),
            "http://127.0.0.1:2/api".to_string(),
        ]);
        let err = client.resolve_url("https://example.com/v", false, "1080").await.unwrap_err();
        // Connection errors fold into the user vocabulary downstream.
        assert!(!err.to_string().is_empty());
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let opts = TunnelDownloadOpts::default();
        assert_eq!(opts.retry_delay * 2u32.pow(0), Duration::from_secs(2));
        assert_eq!(opts.retry_delay * 2u32.pow(1), Duration::from_secs(4));
        assert_eq!(opts.retry_delay * 2u32.pow(2), Duration::from_secs(8));
    }
}
