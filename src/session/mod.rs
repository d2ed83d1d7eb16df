//! Client session registry.
//!
//! Browsers get an opaque client id on connect and keep it alive with
//! heartbeats. A session that misses heartbeats while owning jobs is
//! presumed gone and its jobs are cancelled; a session idle with no jobs is
//! simply dropped. The registry also owns the job -> client ownership map
//! used for cancel authorization and the per-client job cap.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

use crate::config;
use crate::utils::short_id;

pub struct ClientSession {
    pub last_heartbeat: Instant,
    pub last_activity: Instant,
    pub active_jobs: HashSet<String>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, ClientSession>,
    job_to_client: HashMap<String, String>,
}

/// Why a session was swept, and which jobs to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepAction {
    /// Heartbeat lapsed with active jobs: cancel them all.
    TimedOut { client_id: String, job_ids: Vec<String> },
    /// Idle with no jobs: nothing further to do.
    IdleExpired { client_id: String },
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the session if new, otherwise refresh its activity stamp.
    pub fn register(&self, client_id: &str) {
        if client_id.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.sessions.get_mut(client_id) {
            Some(session) => session.last_activity = now,
            None => {
                inner.sessions.insert(
                    client_id.to_string(),
                    ClientSession {
                        last_heartbeat: now,
                        last_activity: now,
                        active_jobs: HashSet::new(),
                    },
                );
                info!(client = %short_id(client_id), "Client connected");
            }
        }
    }

    /// Refresh the heartbeat; false when the session is unknown.
    pub fn heartbeat(&self, client_id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.sessions.get_mut(client_id) {
            Some(session) => {
                session.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn active_job_count(&self, client_id: &str) -> usize {
        let inner = self.inner.lock();
        inner
            .sessions
            .get(client_id)
            .map(|s| s.active_jobs.len())
            .unwrap_or(0)
    }

    /// Record job ownership. A no-op for unknown sessions or empty ids.
    pub fn link_job(&self, job_id: &str, client_id: &str) {
        if client_id.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let Some(session) = inner.sessions.get_mut(client_id) else {
            return;
        };
        session.active_jobs.insert(job_id.to_string());
        session.last_activity = Instant::now();
        inner
            .job_to_client
            .insert(job_id.to_string(), client_id.to_string());
    }

    pub fn job_owner(&self, job_id: &str) -> Option<String> {
        self.inner.lock().job_to_client.get(job_id).cloned()
    }

    /// Drop job ownership from both sides of the map.
    pub fn unlink_job(&self, job_id: &str) {
        let mut inner = self.inner.lock();
        let Some(client_id) = inner.job_to_client.remove(job_id) else {
            return;
        };
        if let Some(session) = inner.sessions.get_mut(&client_id) {
            session.active_jobs.remove(job_id);
            session.last_activity = Instant::now();
        }
    }

    /// Drop ownership of a job without touching the session (playlists
    /// outlive their owner).
    pub fn orphan_job(&self, job_id: &str) {
        self.inner.lock().job_to_client.remove(job_id);
    }

    /// Collect expired sessions and remove them, returning the actions the
    /// caller must perform. The lock is held only for collection; acting on
    /// jobs (signals, file I/O) happens outside.
    pub fn collect_expired(&self) -> Vec<SweepAction> {
        self.collect_expired_at(
            Instant::now(),
            config::HEARTBEAT_TIMEOUT,
            config::SESSION_IDLE_TIMEOUT,
        )
    }

    fn collect_expired_at(
        &self,
        now: Instant,
        heartbeat_timeout: Duration,
        idle_timeout: Duration,
    ) -> Vec<SweepAction> {
        let mut actions = Vec::new();
        let mut inner = self.inner.lock();

        let expired: Vec<(String, bool)> = inner
            .sessions
            .iter()
            .filter_map(|(client_id, session)| {
                let has_active = !session.active_jobs.is_empty();
                if has_active
                    && now.saturating_duration_since(session.last_heartbeat) > heartbeat_timeout
                {
                    Some((client_id.clone(), false))
                } else if !has_active
                    && now.saturating_duration_since(session.last_activity) > idle_timeout
                {
                    Some((client_id.clone(), true))
                } else {
                    None
                }
            })
            .collect();

        for (client_id, idle) in expired {
            let Some(session) = inner.sessions.remove(&client_id) else {
                continue;
            };
            if idle {
                info!(client = %short_id(&client_id), "Client idle timeout");
                actions.push(SweepAction::IdleExpired { client_id });
            } else {
                info!(
                    client = %short_id(&client_id),
                    jobs = session.active_jobs.len(),
                    "Client heartbeat timeout, cancelling jobs"
                );
                actions.push(SweepAction::TimedOut {
                    client_id,
                    job_ids: session.active_jobs.into_iter().collect(),
                });
            }
        }
        actions
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// For invariant checks: does every owned job map to a session that
    /// lists it?
    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let inner = self.inner.lock();
        inner.job_to_client.iter().all(|(job_id, client_id)| {
            inner
                .sessions
                .get(client_id)
                .map(|s| s.active_jobs.contains(job_id))
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HB: Duration = Duration::from_secs(30);
    const IDLE: Duration = Duration::from_secs(60);

    #[test]
    fn register_is_idempotent() {
        let registry = SessionRegistry::new();
        registry.register("client-a");
        registry.register("client-a");
        assert_eq!(registry.session_count(), 1);
        registry.register("");
        assert_eq!(registry.session_count(), 1);
    }

    #[test]
    fn heartbeat_requires_session() {
        let registry = SessionRegistry::new();
        assert!(!registry.heartbeat("ghost"));
        registry.register("client-a");
        assert!(registry.heartbeat("client-a"));
        assert!(registry.heartbeat("client-a"));
    }

    #[test]
    fn link_and_unlink_keep_maps_consistent() {
        let registry = SessionRegistry::new();
        registry.register("client-a");
        registry.link_job("job-1", "client-a");
        registry.link_job("job-2", "client-a");

        assert_eq!(registry.active_job_count("client-a"), 2);
        assert_eq!(registry.job_owner("job-1"), Some("client-a".to_string()));
        assert!(registry.is_consistent());

        registry.unlink_job("job-1");
        assert_eq!(registry.active_job_count("client-a"), 1);
        assert_eq!(registry.job_owner("job-1"), None);
        assert!(registry.is_consistent());

        // Unlinking twice is harmless.
        registry.unlink_job("job-1");
        assert!(registry.is_consistent());
    }

    #[test]
    fn linking_to_unknown_session_is_a_noop() {
        let registry = SessionRegistry::new();
        registry.link_job("job-1", "ghost");
        assert_eq!(registry.job_owner("job-1"), None);
        registry.link_job("job-1", "");
        assert_eq!(registry.job_owner("job-1"), None);
    }

    #[test]
    fn heartbeat_timeout_sweeps_sessions_with_jobs() {
        let registry = SessionRegistry::new();
        registry.register("client-a");
        registry.link_job("job-1", "client-a");

        // Within the window: nothing.
        let now = Instant::now() + Duration::from_secs(10);
        assert!(registry.collect_expired_at(now, HB, IDLE).is_empty());

        // Past 30s without heartbeat: timed out with its job list.
        let now = Instant::now() + Duration::from_secs(31);
        let actions = registry.collect_expired_at(now, HB, IDLE);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            SweepAction::TimedOut { client_id, job_ids } => {
                assert_eq!(client_id, "client-a");
                assert_eq!(job_ids, &vec!["job-1".to_string()]);
            }
            other => panic!("expected TimedOut, got {other:?}"),
        }
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn idle_sessions_expire_without_job_actions() {
        let registry = SessionRegistry::new();
        registry.register("client-a");

        // 31s idle with no jobs is still fine (idle timeout is 60s).
        let now = Instant::now() + Duration::from_secs(31);
        assert!(registry.collect_expired_at(now, HB, IDLE).is_empty());

        let now = Instant::now() + Duration::from_secs(61);
        let actions = registry.collect_expired_at(now, HB, IDLE);
        assert_eq!(
            actions,
            vec![SweepAction::IdleExpired { client_id: "client-a".to_string() }]
        );
    }

    #[test]
    fn heartbeat_defers_timeout() {
        let registry = SessionRegistry::new();
        registry.register("client-a");
        registry.link_job("job-1", "client-a");
        registry.heartbeat("client-a");

        // A heartbeat "now" keeps the session for the next 30s of virtual time.
        let now = Instant::now() + Duration::from_secs(29);
        assert!(registry.collect_expired_at(now, HB, IDLE).is_empty());
        assert_eq!(registry.session_count(), 1);
    }

    #[test]
    fn orphan_drops_ownership_but_keeps_session() {
        let registry = SessionRegistry::new();
        registry.register("client-a");
        registry.link_job("job-1", "client-a");
        registry.orphan_job("job-1");
        assert_eq!(registry.job_owner("job-1"), None);
        assert_eq!(registry.session_count(), 1);
        // The session still counts the job against the client cap until the
        // sweeper removes the session itself; ownership is what playlists
        // shed on owner death.
    }
}
