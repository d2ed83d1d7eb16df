//! Service container.
//!
//! Builds every registry and client once, wires the background sweepers to a
//! shared shutdown token, and offers the cross-registry operations the
//! pipelines need (job release, cancellation, deferred file cleanup).
//! Handlers receive the container through the API state; tests build their
//! own.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::alerts::Alerts;
use crate::artifacts::{ArtifactStore, FileRefStore};
use crate::config::{Config, JobType};
use crate::downloader::auth::AuthService;
use crate::downloader::gallery::GalleryDl;
use crate::downloader::tunnel::TunnelClient;
use crate::downloader::ytdlp::Ytdlp;
use crate::governor::Governor;
use crate::jobs::JobRegistry;
use crate::process::ProcessRegistry;
use crate::progress::ProgressHub;
use crate::session::{SessionRegistry, SweepAction};
use crate::uploads::ChunkedUploadStore;
use crate::utils::short_id;

pub struct ServiceContainer {
    pub config: Config,
    pub governor: Arc<Governor>,
    pub sessions: Arc<SessionRegistry>,
    pub jobs: Arc<JobRegistry>,
    pub processes: Arc<ProcessRegistry>,
    pub hub: Arc<ProgressHub>,
    pub artifacts: Arc<ArtifactStore>,
    pub file_refs: Arc<FileRefStore>,
    pub uploads: Arc<ChunkedUploadStore>,
    pub auth: Arc<AuthService>,
    pub ytdlp: Arc<Ytdlp>,
    pub tunnel: Arc<TunnelClient>,
    pub gallery: Arc<GalleryDl>,
    pub alerts: Arc<Alerts>,
    shutdown: CancellationToken,
}

impl ServiceContainer {
    pub fn new(config: Config) -> Self {
        info!("Initializing service container");

        let governor = Arc::new(Governor::new());
        let auth = Arc::new(AuthService::new(&config));
        let container = Self {
            governor: governor.clone(),
            sessions: Arc::new(SessionRegistry::new()),
            jobs: Arc::new(JobRegistry::new()),
            processes: Arc::new(ProcessRegistry::new()),
            hub: Arc::new(ProgressHub::new(governor)),
            artifacts: Arc::new(ArtifactStore::new()),
            file_refs: Arc::new(FileRefStore::new()),
            uploads: Arc::new(ChunkedUploadStore::new()),
            ytdlp: Arc::new(Ytdlp::new(auth.clone())),
            tunnel: Arc::new(TunnelClient::new(config.tunnel_api_key.clone())),
            gallery: Arc::new(GalleryDl::new(auth.clone())),
            alerts: Arc::new(Alerts::new(&config)),
            auth,
            config,
            shutdown: CancellationToken::new(),
        };

        info!("Service container initialized");
        container
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Spawn all periodic maintenance tasks, each tied to the shutdown
    /// token.
    pub fn start_background_tasks(self: &Arc<Self>) {
        self.governor
            .start_reconciliation(self.processes.clone(), self.shutdown.clone());
        self.start_session_sweeper();
        self.start_job_expiry();
        self.start_artifact_sweepers();
        self.start_chunk_sweeper();
        self.start_temp_retention();
        self.auth
            .start_token_refresh(self.alerts.clone(), self.shutdown.clone());
        info!("Background tasks started");
    }

    /// Tear down everything registered for a finished or failed job:
    /// process handle, counter, pending-job entry, client link. Idempotent;
    /// returns false when the job had no process handle (already released).
    pub fn release_job(&self, job_id: &str) -> bool {
        let Some(handle) = self.processes.remove(job_id) else {
            self.hub.remove_pending(job_id);
            self.sessions.unlink_job(job_id);
            return false;
        };
        self.governor.release(handle.job_type);
        self.hub.remove_pending(job_id);
        self.sessions.unlink_job(job_id);
        true
    }

    /// Delete the job's temp files after a grace period.
    pub fn schedule_file_cleanup(&self, job_id: &str, delay: Duration) {
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            crate::utils::fs::cleanup_job_files(&job_id).await;
        });
    }

    fn start_session_sweeper(self: &Arc<Self>) {
        let container = self.clone();
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Session sweeper shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let actions = container.sessions.collect_expired();
                        for action in actions {
                            container.apply_sweep_action(action).await;
                        }
                    }
                }
            }
        });
    }

    /// Act on one swept session. Runs outside the registry lock.
    async fn apply_sweep_action(&self, action: SweepAction) {
        let SweepAction::TimedOut { job_ids, .. } = action else {
            return;
        };

        for job_id in job_ids {
            // Playlists survive their owner: drop the link, keep the job.
            let is_playlist = self
                .jobs
                .get(&job_id)
                .map(|record| record.job_type == Some(JobType::Playlist))
                .unwrap_or(false);
            if is_playlist {
                self.sessions.orphan_job(&job_id);
                continue;
            }

            if let Some(handle) = self.processes.get(&job_id) {
                handle.terminate();
                self.hub
                    .send_simple(&job_id, "cancelled", "Connection lost - task cancelled");
            }

            if let Some(handle) = self.processes.remove(&job_id) {
                self.governor.release(handle.job_type);
            }
            self.hub.remove_pending(&job_id);
            self.sessions.orphan_job(&job_id);

            let job_id = job_id.clone();
            tokio::spawn(async move {
                crate::utils::fs::cleanup_job_files(&job_id).await;
            });
        }
    }

    fn start_job_expiry(self: &Arc<Self>) {
        let jobs = self.jobs.clone();
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        jobs.expire_sweep();
                    }
                }
            }
        });
    }

    fn start_artifact_sweepers(self: &Arc<Self>) {
        let artifacts = self.artifacts.clone();
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        for (_, artifact) in artifacts.sweep_expired() {
                            let _ = tokio::fs::remove_file(&artifact.file_path).await;
                        }
                    }
                }
            }
        });

        let artifacts = self.artifacts.clone();
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        for (_, artifact) in artifacts.sweep_expired_playlists() {
                            let _ = tokio::fs::remove_file(&artifact.file_path).await;
                        }
                    }
                }
            }
        });
    }

    fn start_chunk_sweeper(self: &Arc<Self>) {
        let uploads = self.uploads.clone();
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        for upload_id in uploads.collect_expired() {
                            crate::uploads::remove_chunk_files(&upload_id).await;
                        }
                    }
                }
            }
        });
    }

    fn start_temp_retention(self: &Arc<Self>) {
        let governor = self.governor.clone();
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5 * 60));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        crate::utils::fs::cleanup_stale_temp_files().await;
                        let free = governor.disk_space_gb();
                        info!(free_gb = %format!("{free:.1}"), "Disk space check");
                        if free < crate::config::DISK_SPACE_MIN_GB {
                            tracing::warn!(
                                free_gb = %format!("{free:.1}"),
                                "Free space below admission threshold"
                            );
                        }
                    }
                }
            }
        });
    }

    /// A container with a blank test configuration. Used by unit and
    /// integration tests; never by the binary.
    pub fn for_tests() -> Arc<Self> {
        Arc::new(Self::new(Config {
            port: 0,
            env_mode: "test".into(),
            bot_secret: Some("hunter2".into()),
            tunnel_api_key: None,
            transcription_api_key: None,
            proxy_host: None,
            proxy_port: "80".into(),
            proxy_user_prefix: None,
            proxy_password: None,
            proxy_count: 0,
            discord_webhook_url: None,
            discord_ping_user_id: None,
            session_generator_url: "http://localhost:8080".into(),
            session_token_refresh: Duration::from_secs(900),
            whisper_script: "whisper.py".into(),
        }))
    }

    /// Register a new job end-to-end: link to the owning client (when
    /// given) and install the process handle.
    pub fn attach_job(
        &self,
        job_id: &str,
        client_id: &str,
        handle: Arc<crate::process::ProcessHandle>,
    ) {
        if !client_id.is_empty() {
            self.sessions.register(client_id);
            self.sessions.link_job(job_id, client_id);
        }
        self.processes.insert(job_id, handle);
        debug!(
            job = %short_id(job_id),
            counters = ?self.governor.active_counts(),
            "Job attached"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessHandle;

    fn test_container() -> Arc<ServiceContainer> {
        ServiceContainer::for_tests()
    }

    #[tokio::test]
    async fn release_job_decrements_and_unlinks() {
        let container = test_container();
        container.governor.admit(JobType::Download).unwrap();
        container.sessions.register("client-a");
        container.sessions.link_job("job-1", "client-a");
        container
            .processes
            .insert("job-1", Arc::new(ProcessHandle::new(JobType::Download)));
        container
            .hub
            .register_pending("job-1", "download", "u", "client-a", "starting");

        assert!(container.release_job("job-1"));
        assert_eq!(container.governor.active(JobType::Download), 0);
        assert!(container.sessions.job_owner("job-1").is_none());
        assert!(container.hub.pending("job-1").is_none());
        assert!(container.processes.get("job-1").is_none());

        // Second release is a no-op returning false.
        assert!(!container.release_job("job-1"));
        assert_eq!(container.governor.active(JobType::Download), 0);
    }

    #[tokio::test]
    async fn sweep_cancels_plain_jobs_but_orphans_playlists() {
        let container = test_container();
        container.governor.admit(JobType::Download).unwrap();
        container.governor.admit(JobType::Playlist).unwrap();
        container.sessions.register("client-a");
        container.sessions.link_job("dl-job", "client-a");
        container.sessions.link_job("pl-job", "client-a");

        let dl_handle = Arc::new(ProcessHandle::new(JobType::Download));
        let pl_handle = Arc::new(ProcessHandle::new(JobType::Playlist));
        container.processes.insert("dl-job", dl_handle.clone());
        container.processes.insert("pl-job", pl_handle.clone());
        container.jobs.insert(
            "pl-job",
            Arc::new(crate::jobs::JobRecord::new(Some(JobType::Playlist), None, None)),
        );

        container
            .apply_sweep_action(SweepAction::TimedOut {
                client_id: "client-a".into(),
                job_ids: vec!["dl-job".into(), "pl-job".into()],
            })
            .await;

        // The plain download was cancelled and fully released.
        assert!(dl_handle.is_cancelled());
        assert!(container.processes.get("dl-job").is_none());
        assert_eq!(container.governor.active(JobType::Download), 0);
        assert!(container.sessions.job_owner("dl-job").is_none());

        // The playlist keeps running, only the ownership link is gone.
        assert!(!pl_handle.is_cancelled());
        assert!(container.processes.get("pl-job").is_some());
        assert_eq!(container.governor.active(JobType::Playlist), 1);
        assert!(container.sessions.job_owner("pl-job").is_none());
    }

    #[tokio::test]
    async fn idle_sweep_actions_do_nothing() {
        let container = test_container();
        container
            .apply_sweep_action(SweepAction::IdleExpired { client_id: "x".into() })
            .await;
    }

    #[tokio::test]
    async fn attach_job_links_and_registers() {
        let container = test_container();
        container.sessions.register("client-a");
        container.attach_job("job-1", "client-a", Arc::new(ProcessHandle::new(JobType::Convert)));
        assert_eq!(container.sessions.job_owner("job-1").as_deref(), Some("client-a"));
        assert!(container.processes.get("job-1").is_some());

        // Empty client id skips the session link.
        container.attach_job("job-2", "", Arc::new(ProcessHandle::new(JobType::Convert)));
        assert!(container.sessions.job_owner("job-2").is_none());
        assert!(container.processes.get("job-2").is_some());
    }
}
