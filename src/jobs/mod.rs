//! Asynchronous job registry.
//!
//! Poll-style jobs (playlist, convert, compress, transcribe, bot downloads)
//! live here as [`JobRecord`]s: state, progress, messages, playlist
//! bookkeeping and the output descriptor once complete. Records are mutated
//! only through methods that respect terminal states, and evicted by a TTL
//! sweep (1 h, playlists 12 h).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::info;

use crate::config;
use crate::utils::short_id;

/// Job lifecycle states as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Starting,
    Downloading,
    Processing,
    Compressing,
    Zipping,
    Complete,
    Error,
    Cancelled,
    #[serde(rename = "finishing-early")]
    FinishingEarly,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Error | JobState::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Starting => "starting",
            JobState::Downloading => "downloading",
            JobState::Processing => "processing",
            JobState::Compressing => "compressing",
            JobState::Zipping => "zipping",
            JobState::Complete => "complete",
            JobState::Error => "error",
            JobState::Cancelled => "cancelled",
            JobState::FinishingEarly => "finishing-early",
        }
    }
}

/// One video that failed inside a playlist job.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FailedVideo {
    pub num: usize,
    pub title: String,
    pub reason: String,
}

/// What a completed job produced.
#[derive(Debug, Clone, Default)]
pub struct JobOutput {
    pub path: Option<PathBuf>,
    pub filename: String,
    pub mime_type: String,
}

#[derive(Default)]
struct RecordState {
    state: Option<JobState>,
    progress: f64,
    message: String,
    error: Option<String>,
    debug_error: Option<String>,
    speed: String,
    eta: String,
    text_content: Option<String>,
    output: JobOutput,
    download_token: Option<String>,
    file_name: Option<String>,
    file_size: u64,
    playlist_title: String,
    total_videos: usize,
    videos_completed: usize,
    current_video: usize,
    current_video_title: String,
    failed_videos: Vec<FailedVideo>,
}

/// A single async job. Created at admission, mutated by its orchestrator,
/// read by the status endpoints, evicted by TTL.
pub struct JobRecord {
    pub created_at: Instant,
    pub job_type: Option<config::JobType>,
    pub url: Option<String>,
    pub format: Option<String>,
    state: Mutex<RecordState>,
}

impl JobRecord {
    pub fn new(job_type: Option<config::JobType>, url: Option<String>, format: Option<String>) -> Self {
        Self {
            created_at: Instant::now(),
            job_type,
            url,
            format,
            state: Mutex::new(RecordState {
                state: Some(JobState::Starting),
                ..RecordState::default()
            }),
        }
    }

    pub fn state(&self) -> JobState {
        self.state.lock().state.unwrap_or(JobState::Starting)
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Advance the lifecycle state. Ignored once terminal.
    pub fn set_state(&self, state: JobState) {
        let mut s = self.state.lock();
        if s.state.map(|s| s.is_terminal()).unwrap_or(false) {
            return;
        }
        s.state = Some(state);
    }

    pub fn set_progress(&self, progress: f64) {
        let mut s = self.state.lock();
        if s.state.map(|s| s.is_terminal()).unwrap_or(false) {
            return;
        }
        s.progress = progress;
    }

    pub fn set_message(&self, message: impl Into<String>) {
        let mut s = self.state.lock();
        if s.state.map(|s| s.is_terminal()).unwrap_or(false) {
            return;
        }
        s.message = message.into();
    }

    pub fn set_progress_message(&self, progress: f64, message: impl Into<String>) {
        let mut s = self.state.lock();
        if s.state.map(|s| s.is_terminal()).unwrap_or(false) {
            return;
        }
        s.progress = progress;
        s.message = message.into();
    }

    pub fn set_speed_eta(&self, speed: impl Into<String>, eta: impl Into<String>) {
        let mut s = self.state.lock();
        if s.state.map(|s| s.is_terminal()).unwrap_or(false) {
            return;
        }
        s.speed = speed.into();
        s.eta = eta.into();
    }

    pub fn set_text_content(&self, content: impl Into<String>) {
        self.state.lock().text_content = Some(content.into());
    }

    /// Terminal success. First call wins; later transitions are ignored.
    pub fn complete(&self, output: JobOutput, message: impl Into<String>) {
        let mut s = self.state.lock();
        if s.state.map(|s| s.is_terminal()).unwrap_or(false) {
            return;
        }
        s.state = Some(JobState::Complete);
        s.progress = 100.0;
        s.message = message.into();
        s.output = output;
    }

    /// Terminal failure with a user-facing message and the raw error kept
    /// for diagnostics.
    pub fn fail(&self, user_message: impl Into<String>, debug_error: impl Into<String>) {
        let mut s = self.state.lock();
        if s.state.map(|s| s.is_terminal()).unwrap_or(false) {
            return;
        }
        let msg = user_message.into();
        s.state = Some(JobState::Error);
        s.message = msg.clone();
        s.error = Some(msg);
        s.debug_error = Some(debug_error.into());
    }

    /// Terminal cancellation.
    pub fn cancel(&self, message: impl Into<String>) {
        let mut s = self.state.lock();
        if s.state.map(|s| s.is_terminal()).unwrap_or(false) {
            return;
        }
        s.state = Some(JobState::Cancelled);
        s.message = message.into();
    }

    /// Attach a finished artifact token (playlists, bot jobs).
    pub fn set_download_token(&self, token: impl Into<String>, file_name: impl Into<String>, file_size: u64) {
        let mut s = self.state.lock();
        s.download_token = Some(token.into());
        s.file_name = Some(file_name.into());
        s.file_size = file_size;
    }

    pub fn update_playlist(&self, f: impl FnOnce(&mut PlaylistFields)) {
        let mut s = self.state.lock();
        if s.state.map(|s| s.is_terminal()).unwrap_or(false) {
            return;
        }
        let mut fields = PlaylistFields {
            title: std::mem::take(&mut s.playlist_title),
            total_videos: s.total_videos,
            videos_completed: s.videos_completed,
            current_video: s.current_video,
            current_video_title: std::mem::take(&mut s.current_video_title),
            failed_videos: std::mem::take(&mut s.failed_videos),
        };
        f(&mut fields);
        s.playlist_title = fields.title;
        s.total_videos = fields.total_videos;
        s.videos_completed = fields.videos_completed;
        s.current_video = fields.current_video;
        s.current_video_title = fields.current_video_title;
        s.failed_videos = fields.failed_videos;
    }

    pub fn output(&self) -> (JobOutput, JobState) {
        let s = self.state.lock();
        (s.output.clone(), s.state.unwrap_or(JobState::Starting))
    }

    pub fn progress(&self) -> f64 {
        self.state.lock().progress
    }

    /// Generic poll snapshot for `/api/job/{id}/status`.
    pub fn status_snapshot(&self) -> JobStatus {
        let s = self.state.lock();
        JobStatus {
            status: s.state.unwrap_or(JobState::Starting),
            progress: s.progress,
            message: s.message.clone(),
            error: s.error.clone(),
            text_content: s.text_content.clone(),
        }
    }

    /// Snapshot for the playlist status surface.
    pub fn playlist_snapshot(&self) -> PlaylistStatus {
        let s = self.state.lock();
        PlaylistStatus {
            status: s.state.unwrap_or(JobState::Starting),
            progress: s.progress,
            message: s.message.clone(),
            playlist_title: s.playlist_title.clone(),
            total_videos: s.total_videos,
            videos_completed: s.videos_completed,
            current_video: s.current_video,
            current_video_title: s.current_video_title.clone(),
            failed_videos: s.failed_videos.clone(),
            failed_count: s.failed_videos.len(),
            download_token: s.download_token.clone(),
            file_name: s.file_name.clone(),
            file_size: s.file_size,
            speed: s.speed.clone(),
            eta: s.eta.clone(),
        }
    }

    /// Snapshot for the bot status surface.
    pub fn bot_snapshot(&self) -> BotStatus {
        let s = self.state.lock();
        BotStatus {
            status: s.state.unwrap_or(JobState::Starting),
            progress: s.progress,
            message: s.message.clone(),
            error: s.error.clone(),
            file_name: s.file_name.clone(),
            file_size: s.file_size,
            download_token: s.download_token.clone(),
            speed: s.speed.clone(),
            eta: s.eta.clone(),
            total_videos: s.total_videos,
            videos_completed: s.videos_completed,
            failed_videos: s.failed_videos.clone(),
            output_filename: if s.output.filename.is_empty() {
                None
            } else {
                Some(s.output.filename.clone())
            },
        }
    }
}

/// Mutable view of the playlist bookkeeping fields.
pub struct PlaylistFields {
    pub title: String,
    pub total_videos: usize,
    pub videos_completed: usize,
    pub current_video: usize,
    pub current_video_title: String,
    pub failed_videos: Vec<FailedVideo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub status: JobState,
    pub progress: f64,
    pub message: String,
    pub error: Option<String>,
    #[serde(rename = "textContent", skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistStatus {
    pub status: JobState,
    pub progress: f64,
    pub message: String,
    pub playlist_title: String,
    pub total_videos: usize,
    pub videos_completed: usize,
    pub current_video: usize,
    pub current_video_title: String,
    pub failed_videos: Vec<FailedVideo>,
    pub failed_count: usize,
    pub download_token: Option<String>,
    pub file_name: Option<String>,
    pub file_size: u64,
    pub speed: String,
    pub eta: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BotStatus {
    pub status: JobState,
    pub progress: f64,
    pub message: String,
    pub error: Option<String>,
    pub file_name: Option<String>,
    pub file_size: u64,
    pub download_token: Option<String>,
    pub speed: String,
    pub eta: String,
    pub total_videos: usize,
    pub videos_completed: usize,
    pub failed_videos: Vec<FailedVideo>,
    pub output_filename: Option<String>,
}

/// Registry of async jobs keyed by job id.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<JobRecord>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job_id: &str, record: Arc<JobRecord>) {
        self.jobs.write().insert(job_id.to_string(), record);
    }

    pub fn get(&self, job_id: &str) -> Option<Arc<JobRecord>> {
        self.jobs.read().get(job_id).cloned()
    }

    pub fn remove(&self, job_id: &str) -> Option<Arc<JobRecord>> {
        self.jobs.write().remove(job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    /// Evict records older than their TTL (1 h, playlists 12 h). Returns
    /// the evicted ids.
    pub fn expire_sweep(&self) -> Vec<String> {
        self.expire_sweep_at(Instant::now())
    }

    fn expire_sweep_at(&self, now: Instant) -> Vec<String> {
        let mut evicted = Vec::new();
        let mut jobs = self.jobs.write();
        jobs.retain(|job_id, record| {
            let ttl = if record.job_type == Some(config::JobType::Playlist) {
                config::PLAYLIST_DOWNLOAD_EXP
            } else {
                config::ASYNC_JOB_TIMEOUT
            };
            let age = now.saturating_duration_since(record.created_at);
            if age > ttl {
                info!(
                    job_id = %short_id(job_id),
                    status = record.state().as_str(),
                    "Job expired"
                );
                evicted.push(job_id.clone());
                false
            } else {
                true
            }
        });
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        JobRecord::new(None, None, None)
    }

    #[test]
    fn new_record_starts_starting() {
        let r = record();
        assert_eq!(r.state(), JobState::Starting);
        assert!(!r.is_terminal());
    }

    #[test]
    fn terminal_states_are_frozen() {
        let r = record();
        r.set_progress_message(50.0, "halfway");
        r.complete(
            JobOutput {
                path: Some(PathBuf::from("/tmp/out.mp4")),
                filename: "out.mp4".into(),
                mime_type: "video/mp4".into(),
            },
            "Done!",
        );
        assert_eq!(r.state(), JobState::Complete);
        assert_eq!(r.progress(), 100.0);

        // Nothing moves after completion.
        r.set_state(JobState::Downloading);
        r.set_progress(10.0);
        r.set_message("nope");
        r.fail("nope", "nope");
        r.cancel("nope");
        assert_eq!(r.state(), JobState::Complete);
        assert_eq!(r.progress(), 100.0);
        assert_eq!(r.status_snapshot().message, "Done!");
    }

    #[test]
    fn fail_is_terminal_and_first_wins() {
        let r = record();
        r.fail("Download failed", "yt-dlp exit 1");
        assert_eq!(r.state(), JobState::Error);
        r.complete(JobOutput::default(), "too late");
        assert_eq!(r.state(), JobState::Error);
        let snap = r.status_snapshot();
        assert_eq!(snap.error.as_deref(), Some("Download failed"));
    }

    #[test]
    fn cancel_is_terminal() {
        let r = record();
        r.cancel("Download cancelled");
        assert_eq!(r.state(), JobState::Cancelled);
        r.set_progress(99.0);
        assert_eq!(r.progress(), 0.0);
    }

    #[test]
    fn playlist_fields_update_and_snapshot() {
        let r = JobRecord::new(Some(config::JobType::Playlist), None, None);
        r.update_playlist(|p| {
            p.title = "Mix".into();
            p.total_videos = 10;
            p.current_video = 3;
            p.current_video_title = "Third".into();
            p.videos_completed = 2;
            p.failed_videos.push(FailedVideo {
                num: 1,
                title: "First".into(),
                reason: "Download failed".into(),
            });
        });
        let snap = r.playlist_snapshot();
        assert_eq!(snap.playlist_title, "Mix");
        assert_eq!(snap.total_videos, 10);
        assert_eq!(snap.failed_count, 1);
        assert_eq!(snap.failed_videos[0].num, 1);
    }

    #[test]
    fn states_serialize_kebab_case() {
        assert_eq!(serde_json::to_string(&JobState::FinishingEarly).unwrap(), "\"finishing-early\"");
        assert_eq!(serde_json::to_string(&JobState::Zipping).unwrap(), "\"zipping\"");
    }

    #[test]
    fn registry_ttl_sweep_honors_playlist_extension() {
        let registry = JobRegistry::new();
        registry.insert("job-plain", Arc::new(record()));
        registry.insert(
            "job-playlist",
            Arc::new(JobRecord::new(Some(config::JobType::Playlist), None, None)),
        );

        // Two hours in: only the plain job (1 h TTL) is evicted.
        let now = Instant::now() + Duration::from_secs(2 * 60 * 60);
        let evicted = registry.expire_sweep_at(now);
        assert_eq!(evicted, vec!["job-plain".to_string()]);
        assert!(registry.get("job-playlist").is_some());

        // Thirteen hours in: the playlist goes too.
        let now = Instant::now() + Duration::from_secs(13 * 60 * 60);
        let evicted = registry.expire_sweep_at(now);
        assert_eq!(evicted, vec!["job-playlist".to_string()]);
        assert!(registry.is_empty());
    }

    #[test]
    fn bot_snapshot_carries_token() {
        let r = record();
        r.set_download_token("deadbeef", "video.mp4", 1234);
        let snap = r.bot_snapshot();
        assert_eq!(snap.download_token.as_deref(), Some("deadbeef"));
        assert_eq!(snap.file_name.as_deref(), Some("video.mp4"));
        assert_eq!(snap.file_size, 1234);
    }
}
