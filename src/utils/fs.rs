//! Temp-tree maintenance and filename sanitizing.

use std::path::Path;
use std::sync::LazyLock;
use std::time::SystemTime;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::{self, TempDir};

static UNSAFE_FILENAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).expect("filename regex"));
static MULTI_SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("space regex"));

/// Create the full temp directory tree, wiping anything left from a previous
/// run. In-flight jobs do not survive restarts, so stale files are garbage.
pub fn ensure_clean_temp_dirs() {
    for dir in TempDir::ALL {
        let path = dir.path();
        match std::fs::read_dir(&path) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let _ = remove_any(&entry.path());
                }
            }
            Err(_) => {
                if let Err(e) = std::fs::create_dir_all(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to create temp dir");
                }
            }
        }
    }
    info!("Temp directories ready");
}

/// Delete every temp entry whose name contains the job id, across all temp
/// directories. Used by cancel paths and terminal error cleanup.
pub async fn cleanup_job_files(job_id: &str) {
    let mut cleaned = 0usize;
    for dir in TempDir::ALL {
        let Ok(mut entries) = tokio::fs::read_dir(dir.path()).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.contains(job_id) {
                let path = entry.path();
                let removed = if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    tokio::fs::remove_dir_all(&path).await.is_ok()
                } else {
                    tokio::fs::remove_file(&path).await.is_ok()
                };
                if removed {
                    debug!(name = %name, "Removed job temp entry");
                    cleaned += 1;
                }
            }
        }
    }
    if cleaned == 0 {
        debug!(job_id = %crate::utils::short_id(job_id), "No temp files found for job");
    }
}

/// Periodic retention sweep: drop temp entries older than the retention
/// window and log current disk headroom.
pub async fn cleanup_stale_temp_files() {
    let now = SystemTime::now();
    for dir in TempDir::ALL {
        let Ok(mut entries) = tokio::fs::read_dir(dir.path()).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(meta) = entry.metadata().await else { continue };
            let Ok(modified) = meta.modified() else { continue };
            let Ok(age) = now.duration_since(modified) else { continue };
            if age > config::FILE_RETENTION {
                let path = entry.path();
                let ok = if meta.is_dir() {
                    tokio::fs::remove_dir_all(&path).await.is_ok()
                } else {
                    tokio::fs::remove_file(&path).await.is_ok()
                };
                if ok {
                    info!(name = %entry.file_name().to_string_lossy(), "Cleaned up old temp entry");
                }
            }
        }
    }
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

/// Make a name safe for the filesystem and for Content-Disposition: strip
/// path separators and control characters, collapse whitespace, cap at 200
/// characters.
pub fn sanitize_filename(filename: &str) -> String {
    let s = UNSAFE_FILENAME_RE.replace_all(filename, "_");
    let s = MULTI_SPACE_RE.replace_all(&s, " ");
    let s = s.trim();
    s.chars().take(200).collect()
}

pub async fn file_size(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_unsafe_characters() {
        assert_eq!(sanitize_filename("a/b\\c:d*e?f"), "a_b_c_d_e_f");
        assert_eq!(sanitize_filename("  spaced   out  "), "spaced out");
        assert_eq!(sanitize_filename("normal name.mp4"), "normal name.mp4");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "x".repeat(500);
        assert_eq!(sanitize_filename(&long).chars().count(), 200);
    }

    #[test]
    fn sanitize_handles_control_chars() {
        assert_eq!(sanitize_filename("a\x00b\x1fc"), "a_b_c");
    }

    #[tokio::test]
    async fn cleanup_matches_by_job_id() {
        // cleanup_job_files only touches the fixed temp tree; exercise the
        // matching logic through a real entry when the tree is writable.
        let dir = TempDir::Upload.path();
        if tokio::fs::create_dir_all(&dir).await.is_err() {
            return; // sandboxed environment without /var/tmp access
        }
        let marker = dir.join("testjob123-file.bin");
        if tokio::fs::write(&marker, b"x").await.is_err() {
            return;
        }
        cleanup_job_files("testjob123").await;
        assert!(tokio::fs::metadata(&marker).await.is_err());
    }
}
