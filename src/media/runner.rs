//! Cancellable subprocess execution with stderr progress consumption.
//!
//! ffmpeg writes progress with carriage returns rather than newlines, so the
//! consumer reads raw chunks and hands each chunk to a callback. The child is
//! killed when the job's cancellation token fires or the optional deadline
//! elapses.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::process::ProcessHandle;

/// Progress callback: seconds of media processed plus optional speed factor.
pub type TimeProgressFn = Arc<dyn Fn(f64, Option<f64>) + Send + Sync>;

#[derive(Default)]
pub struct RunOptions {
    pub process: Option<Arc<ProcessHandle>>,
    pub on_time: Option<TimeProgressFn>,
    /// Absolute wall-clock bound; `None` leaves the run bounded only by
    /// cancellation.
    pub timeout: Option<Duration>,
}

/// Run ffmpeg to completion. Returns `Error::Cancelled` when the job was
/// cancelled, `Error::Encoding` with the stderr tail on non-zero exit.
pub async fn run_ffmpeg(args: &[String], opts: RunOptions) -> Result<()> {
    run_tool("ffmpeg", args, opts).await
}

pub async fn run_tool(program: &str, args: &[String], opts: RunOptions) -> Result<()> {
    debug!(program, args = ?args, "Spawning");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Other(format!("failed to start {program}: {e}")))?;

    if let Some(process) = &opts.process {
        process.set_pid(child.id());
    }

    let mut stderr = child.stderr.take();
    let on_time = opts.on_time.clone();

    // Consume stderr in chunks, keeping a bounded tail for error reporting.
    let reader = tokio::spawn(async move {
        let mut tail = String::new();
        let Some(mut stderr) = stderr.take() else { return tail };
        let mut buf = [0u8; 4096];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]);
                    if let Some(on_time) = &on_time {
                        if let Some(secs) = crate::media::progress::parse_ffmpeg_time(&chunk) {
                            on_time(secs, crate::media::progress::parse_ffmpeg_speed(&chunk));
                        }
                    }
                    tail.push_str(&chunk);
                    if tail.len() > 4096 {
                        let cut = tail.len() - 2048;
                        tail.drain(..cut);
                    }
                }
            }
        }
        tail
    });

    let cancel = opts
        .process
        .as_ref()
        .map(|p| p.token())
        .unwrap_or_default();

    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            None
        }
        _ = sleep_opt(opts.timeout) => {
            warn!(program, "Subprocess hit its deadline, killing");
            let _ = child.kill().await;
            None
        }
    };

    let tail = reader.await.unwrap_or_default();

    if let Some(process) = &opts.process {
        process.set_pid(None);
        if process.is_cancelled() {
            return Err(Error::Cancelled);
        }
    }

    match status {
        Some(Ok(status)) if status.success() => Ok(()),
        Some(Ok(status)) => {
            let code = status.code().unwrap_or(-1);
            let start = tail.char_indices().rev().nth(499).map(|(i, _)| i).unwrap_or(0);
            debug!(program, code, tail = %&tail[start..], "Subprocess failed");
            Err(Error::Encoding(format!("Encoding failed (code {code})")))
        }
        Some(Err(e)) => Err(Error::Other(format!("failed waiting for {program}: {e}"))),
        None => Err(Error::Cancelled),
    }
}

async fn sleep_opt(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Verify an encode produced a plausible output file.
pub async fn check_output(path: &Path, min_bytes: u64) -> Result<u64> {
    let size = crate::utils::fs::file_size(path).await;
    if size < min_bytes {
        let _ = tokio::fs::remove_file(path).await;
        return Err(Error::Encoding("Processing failed - output file not created".into()));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let err = run_tool("definitely-not-a-real-binary", &[], RunOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to start"));
    }

    #[tokio::test]
    async fn cancelled_process_reports_cancelled() {
        let process = Arc::new(ProcessHandle::new(crate::config::JobType::Convert));
        process.cancel();
        // `true` exits immediately with success, but the pre-set cancelled
        // flag must win.
        let opts = RunOptions { process: Some(process), ..Default::default() };
        let err = run_tool("true", &[], opts).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn nonzero_exit_is_encoding_error() {
        let err = run_tool("false", &[], RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }

    #[tokio::test]
    async fn deadline_kills_the_child() {
        let opts = RunOptions { timeout: Some(Duration::from_millis(50)), ..Default::default() };
        let args = vec!["5".to_string()];
        let err = run_tool("sleep", &args, opts).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
