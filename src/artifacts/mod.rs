//! Ephemeral artifact store.
//!
//! Finished outputs that are fetched later (bot downloads, packaged
//! playlists) are registered under an opaque 32-byte hex token. Tokens are
//! capability-bearing: knowing one is authorization enough. Two sweepers
//! enforce TTLs (5 min standard, 12 h for web playlists); serving handlers
//! additionally schedule a short-delay delete once the bytes went out.
//!
//! The same module hosts the file-ref store for assembled chunked uploads:
//! one-shot tokens resolving to a file path plus its original name.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::RngCore;
use tracing::info;

use crate::config;
use crate::utils::short_id;

/// Generate an opaque artifact/file token: 32 random bytes, hex-encoded.
pub fn new_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// A file on disk retrievable by token.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub file_path: PathBuf,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub created_at: Instant,
    pub downloaded: bool,
    /// Packaged web playlist: extended 12 h TTL.
    pub is_web_playlist: bool,
    /// Bot playlist: exempt from the short TTL sweep.
    pub is_playlist: bool,
}

impl Artifact {
    pub fn new(file_path: PathBuf, file_name: String, file_size: u64, mime_type: String) -> Self {
        Self {
            file_path,
            file_name,
            file_size,
            mime_type,
            created_at: Instant::now(),
            downloaded: false,
            is_web_playlist: false,
            is_playlist: false,
        }
    }

    pub fn web_playlist(mut self) -> Self {
        self.is_web_playlist = true;
        self
    }

    pub fn playlist(mut self) -> Self {
        self.is_playlist = true;
        self
    }
}

#[derive(Default)]
pub struct ArtifactStore {
    entries: Mutex<HashMap<String, Artifact>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, token: &str, artifact: Artifact) {
        self.entries.lock().insert(token.to_string(), artifact);
    }

    pub fn get(&self, token: &str) -> Option<Artifact> {
        self.entries.lock().get(token).cloned()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.entries.lock().contains_key(token)
    }

    /// Remove the registry entry; the caller deletes the file.
    pub fn delete(&self, token: &str) -> Option<Artifact> {
        self.entries.lock().remove(token)
    }

    pub fn mark_downloaded(&self, token: &str) {
        if let Some(artifact) = self.entries.lock().get_mut(token) {
            artifact.downloaded = true;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Standard 30 s-cadence sweep: evict plain artifacts older than the
    /// short expiry. Playlist-flagged entries are skipped. Returns the
    /// evicted artifacts so the caller can delete their files outside the
    /// lock.
    pub fn sweep_expired(&self) -> Vec<(String, Artifact)> {
        self.sweep_expired_at(Instant::now(), config::BOT_DOWNLOAD_EXPIRY)
    }

    fn sweep_expired_at(&self, now: Instant, expiry: Duration) -> Vec<(String, Artifact)> {
        let mut evicted = Vec::new();
        let mut entries = self.entries.lock();
        entries.retain(|token, artifact| {
            let expired = !artifact.is_web_playlist
                && !artifact.is_playlist
                && now.saturating_duration_since(artifact.created_at) > expiry;
            if expired {
                info!(token = %short_id(token), "Download token expired");
                evicted.push((token.clone(), artifact.clone()));
            }
            !expired
        });
        evicted
    }

    /// 60 s-cadence sweep for web playlists past their 12 h window.
    pub fn sweep_expired_playlists(&self) -> Vec<(String, Artifact)> {
        self.sweep_expired_playlists_at(Instant::now(), config::PLAYLIST_DOWNLOAD_EXP)
    }

    fn sweep_expired_playlists_at(&self, now: Instant, expiry: Duration) -> Vec<(String, Artifact)> {
        let mut evicted = Vec::new();
        let mut entries = self.entries.lock();
        entries.retain(|token, artifact| {
            let expired = artifact.is_web_playlist
                && now.saturating_duration_since(artifact.created_at) > expiry;
            if expired {
                info!(token = %short_id(token), "Playlist download token expired");
                evicted.push((token.clone(), artifact.clone()));
            }
            !expired
        });
        evicted
    }
}

/// An assembled upload addressable by a one-shot token.
#[derive(Debug, Clone)]
pub struct FileRef {
    pub file_path: PathBuf,
    pub file_name: String,
    pub created_at: Instant,
}

#[derive(Default)]
pub struct FileRefStore {
    refs: Mutex<HashMap<String, FileRef>>,
}

impl FileRefStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, token: &str, file_ref: FileRef) {
        self.refs.lock().insert(token.to_string(), file_ref);
    }

    /// Resolve and consume the token.
    pub fn take(&self, token: &str) -> Option<FileRef> {
        self.refs.lock().remove(token)
    }

    pub fn len(&self) -> usize {
        self.refs.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact() -> Artifact {
        Artifact::new(PathBuf::from("/tmp/f.mp4"), "f.mp4".into(), 42, "video/mp4".into())
    }

    #[test]
    fn tokens_are_64_hex_chars_and_unique() {
        let a = new_token();
        let b = new_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn put_get_delete() {
        let store = ArtifactStore::new();
        let token = new_token();
        store.put(&token, artifact());
        assert!(store.contains(&token));
        assert_eq!(store.get(&token).unwrap().file_name, "f.mp4");

        let removed = store.delete(&token).unwrap();
        assert_eq!(removed.file_size, 42);
        assert!(store.get(&token).is_none());
        assert!(store.delete(&token).is_none());
    }

    #[test]
    fn evicted_tokens_never_resolve() {
        let store = ArtifactStore::new();
        store.put("t1", artifact());
        let now = Instant::now() + Duration::from_secs(301);
        let evicted = store.sweep_expired_at(now, config::BOT_DOWNLOAD_EXPIRY);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, "t1");
        assert!(store.get("t1").is_none());
    }

    #[test]
    fn playlist_flags_exempt_from_short_sweep() {
        let store = ArtifactStore::new();
        store.put("plain", artifact());
        store.put("web", artifact().web_playlist());
        store.put("bot", artifact().playlist());

        let now = Instant::now() + Duration::from_secs(400);
        let evicted = store.sweep_expired_at(now, config::BOT_DOWNLOAD_EXPIRY);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, "plain");
        assert!(store.contains("web"));
        assert!(store.contains("bot"));
    }

    #[test]
    fn web_playlists_expire_on_the_long_sweep() {
        let store = ArtifactStore::new();
        store.put("web", artifact().web_playlist());
        store.put("bot", artifact().playlist());

        // Under 12 h: kept.
        let now = Instant::now() + Duration::from_secs(11 * 60 * 60);
        assert!(store.sweep_expired_playlists_at(now, config::PLAYLIST_DOWNLOAD_EXP).is_empty());

        // Past 12 h: only the web playlist goes; bot playlists are not this
        // sweep's business.
        let now = Instant::now() + Duration::from_secs(13 * 60 * 60);
        let evicted = store.sweep_expired_playlists_at(now, config::PLAYLIST_DOWNLOAD_EXP);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, "web");
        assert!(store.contains("bot"));
    }

    #[test]
    fn mark_downloaded_flips_flag() {
        let store = ArtifactStore::new();
        store.put("t", artifact());
        assert!(!store.get("t").unwrap().downloaded);
        store.mark_downloaded("t");
        assert!(store.get("t").unwrap().downloaded);
    }

    #[test]
    fn file_refs_are_one_shot() {
        let store = FileRefStore::new();
        store.put(
            "ref-1",
            FileRef {
                file_path: PathBuf::from("/tmp/assembled.mp4"),
                file_name: "movie.mp4".into(),
                created_at: Instant::now(),
            },
        );
        let taken = store.take("ref-1").unwrap();
        assert_eq!(taken.file_name, "movie.mp4");
        assert!(store.take("ref-1").is_none());
    }
}
