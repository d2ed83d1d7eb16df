//! Chunked upload registry.
//!
//! Large files arrive as numbered chunks written to the upload temp dir as
//! `chunk-<uploadId>-<%04d>`. The registry tracks which indexes landed;
//! `complete` verifies all chunks are present before assembly. Uploads idle
//! past the timeout are swept along with their chunk files.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

use crate::config::{self, TempDir};
use crate::utils::short_id;

pub struct ChunkedUpload {
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: usize,
    pub received: HashSet<usize>,
    pub last_activity: Instant,
}

/// Path of one chunk file.
pub fn chunk_path(upload_id: &str, index: usize) -> PathBuf {
    TempDir::Upload.path().join(format!("chunk-{upload_id}-{index:04}"))
}

#[derive(Default)]
pub struct ChunkedUploadStore {
    uploads: Mutex<HashMap<String, ChunkedUpload>>,
}

impl ChunkedUploadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, upload_id: &str, file_name: String, file_size: u64, total_chunks: usize) {
        self.uploads.lock().insert(
            upload_id.to_string(),
            ChunkedUpload {
                file_name,
                file_size,
                total_chunks,
                received: HashSet::new(),
                last_activity: Instant::now(),
            },
        );
    }

    pub fn contains(&self, upload_id: &str) -> bool {
        self.uploads.lock().contains_key(upload_id)
    }

    pub fn total_chunks(&self, upload_id: &str) -> Option<usize> {
        self.uploads.lock().get(upload_id).map(|u| u.total_chunks)
    }

    /// Mark a chunk received; returns (received, total) after the update,
    /// or `None` for unknown uploads.
    pub fn mark_chunk_received(&self, upload_id: &str, index: usize) -> Option<(usize, usize)> {
        let mut uploads = self.uploads.lock();
        let upload = uploads.get_mut(upload_id)?;
        upload.received.insert(index);
        upload.last_activity = Instant::now();
        Some((upload.received.len(), upload.total_chunks))
    }

    /// (complete?, received, total), or `None` for unknown uploads.
    pub fn completion(&self, upload_id: &str) -> Option<(bool, usize, usize)> {
        let uploads = self.uploads.lock();
        let upload = uploads.get(upload_id)?;
        let received = upload.received.len();
        Some((received == upload.total_chunks, received, upload.total_chunks))
    }

    /// Remove the upload record, returning its descriptor for assembly.
    pub fn remove(&self, upload_id: &str) -> Option<(String, u64, usize)> {
        self.uploads
            .lock()
            .remove(upload_id)
            .map(|u| (u.file_name, u.file_size, u.total_chunks))
    }

    /// Drop uploads idle past the timeout; returns their ids so the caller
    /// can sweep chunk files outside the lock.
    pub fn collect_expired(&self) -> Vec<String> {
        self.collect_expired_at(Instant::now(), config::CHUNK_TIMEOUT)
    }

    fn collect_expired_at(&self, now: Instant, timeout: Duration) -> Vec<String> {
        let mut expired = Vec::new();
        let mut uploads = self.uploads.lock();
        uploads.retain(|upload_id, upload| {
            if now.saturating_duration_since(upload.last_activity) > timeout {
                info!(upload = %short_id(upload_id), "Upload timed out, cleaning up");
                expired.push(upload_id.clone());
                false
            } else {
                true
            }
        });
        expired
    }
}

/// Delete every chunk file belonging to an upload.
pub async fn remove_chunk_files(upload_id: &str) {
    let dir = TempDir::Upload.path();
    let prefix = format!("chunk-{upload_id}-");
    let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_tracking_counts_distinct_indexes() {
        let store = ChunkedUploadStore::new();
        store.insert("up-1", "movie.mp4".into(), 1000, 4);

        assert_eq!(store.mark_chunk_received("up-1", 0), Some((1, 4)));
        assert_eq!(store.mark_chunk_received("up-1", 1), Some((2, 4)));
        // Re-sending a chunk does not double-count.
        assert_eq!(store.mark_chunk_received("up-1", 1), Some((2, 4)));
        assert_eq!(store.mark_chunk_received("up-1", 2), Some((3, 4)));

        assert_eq!(store.completion("up-1"), Some((false, 3, 4)));
        assert_eq!(store.mark_chunk_received("up-1", 3), Some((4, 4)));
        assert_eq!(store.completion("up-1"), Some((true, 4, 4)));
    }

    #[test]
    fn unknown_upload_yields_none() {
        let store = ChunkedUploadStore::new();
        assert_eq!(store.mark_chunk_received("ghost", 0), None);
        assert_eq!(store.completion("ghost"), None);
        assert!(store.remove("ghost").is_none());
    }

    #[test]
    fn remove_returns_descriptor() {
        let store = ChunkedUploadStore::new();
        store.insert("up-1", "movie.mp4".into(), 1000, 2);
        let (name, size, chunks) = store.remove("up-1").unwrap();
        assert_eq!(name, "movie.mp4");
        assert_eq!(size, 1000);
        assert_eq!(chunks, 2);
        assert!(!store.contains("up-1"));
    }

    #[test]
    fn idle_uploads_expire() {
        let store = ChunkedUploadStore::new();
        store.insert("up-1", "a.mp4".into(), 10, 1);
        store.insert("up-2", "b.mp4".into(), 10, 1);
        // Activity on up-2 keeps it alive relative to the later sweep.
        store.mark_chunk_received("up-2", 0);

        let now = Instant::now() + Duration::from_secs(31 * 60);
        let expired = store.collect_expired_at(now, config::CHUNK_TIMEOUT);
        assert_eq!(expired.len(), 2);

        let store = ChunkedUploadStore::new();
        store.insert("up-1", "a.mp4".into(), 10, 1);
        let now = Instant::now() + Duration::from_secs(60);
        assert!(store.collect_expired_at(now, config::CHUNK_TIMEOUT).is_empty());
        assert!(store.contains("up-1"));
    }

    #[test]
    fn chunk_paths_are_zero_padded() {
        let p = chunk_path("abc", 7);
        assert!(p.to_string_lossy().ends_with("chunk-abc-0007"));
        let p = chunk_path("abc", 123);
        assert!(p.to_string_lossy().ends_with("chunk-abc-0123"));
    }
}
