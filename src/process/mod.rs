//! Per-job process supervision.
//!
//! Each in-flight job owns a [`ProcessHandle`]: the cancellation flag, the
//! finish-early flag for playlists, the current external process id, and the
//! temp paths to sweep on teardown. Cancellation from any trigger (explicit
//! cancel, heartbeat timeout, client disconnect) converges here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::JobType;

#[derive(Default)]
struct HandleState {
    cancelled: bool,
    finish_early: bool,
    pid: Option<u32>,
    temp_file: Option<PathBuf>,
    temp_dir: Option<PathBuf>,
}

/// Shared supervision state for one job. Mutation goes through the internal
/// lock; the lock is never held across I/O.
pub struct ProcessHandle {
    pub job_type: JobType,
    token: CancellationToken,
    state: Mutex<HandleState>,
}

impl ProcessHandle {
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            token: CancellationToken::new(),
            state: Mutex::new(HandleState::default()),
        }
    }

    pub fn with_temp_file(self, path: PathBuf) -> Self {
        self.state.lock().temp_file = Some(path);
        self
    }

    pub fn with_temp_dir(self, path: PathBuf) -> Self {
        self.state.lock().temp_dir = Some(path);
        self
    }

    /// Child token for I/O spawned on behalf of this job.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Record the currently running external process (or clear it).
    pub fn set_pid(&self, pid: Option<u32>) {
        self.state.lock().pid = pid;
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    pub fn set_finish_early(&self) {
        self.state.lock().finish_early = true;
    }

    pub fn is_finish_early(&self) -> bool {
        self.state.lock().finish_early
    }

    pub fn temp_paths(&self) -> (Option<PathBuf>, Option<PathBuf>) {
        let state = self.state.lock();
        (state.temp_file.clone(), state.temp_dir.clone())
    }

    /// Set the cancelled flag, cancel downstream I/O and kill the current
    /// subprocess.
    pub fn cancel(&self) {
        {
            let mut state = self.state.lock();
            state.cancelled = true;
        }
        self.token.cancel();
        self.kill();
    }

    /// Cancel like [`cancel`], but deliver SIGTERM instead of SIGKILL so the
    /// subprocess can flush partial output. Session sweeps use this.
    pub fn terminate(&self) {
        {
            let mut state = self.state.lock();
            state.cancelled = true;
        }
        self.signal_term();
        self.token.cancel();
    }

    /// Hard-kill the current subprocess, if any.
    pub fn kill(&self) {
        let pid = self.state.lock().pid;
        if let Some(pid) = pid {
            send_signal(pid, Signal::Kill);
        }
    }

    /// Deliver SIGTERM to the current subprocess, giving it a chance to
    /// flush partial output. Used by the session sweeper.
    pub fn signal_term(&self) {
        let pid = self.state.lock().pid;
        if let Some(pid) = pid {
            send_signal(pid, Signal::Term);
        }
    }
}

#[derive(Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: Signal) {}

/// Registry of live process handles, keyed by job id.
#[derive(Default)]
pub struct ProcessRegistry {
    handles: Mutex<HashMap<String, Arc<ProcessHandle>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job_id: &str, handle: Arc<ProcessHandle>) {
        self.handles.lock().insert(job_id.to_string(), handle);
    }

    pub fn get(&self, job_id: &str) -> Option<Arc<ProcessHandle>> {
        self.handles.lock().get(job_id).cloned()
    }

    /// Remove and return the handle, if present.
    pub fn remove(&self, job_id: &str) -> Option<Arc<ProcessHandle>> {
        let removed = self.handles.lock().remove(job_id);
        if removed.is_some() {
            debug!(job_id = %crate::utils::short_id(job_id), "Process handle removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_sets_flag_and_fires_token() {
        let handle = ProcessHandle::new(JobType::Download);
        let token = handle.token();
        assert!(!handle.is_cancelled());
        assert!(!token.is_cancelled());

        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(token.is_cancelled());

        // Idempotent.
        handle.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn finish_early_is_independent_of_cancel() {
        let handle = ProcessHandle::new(JobType::Playlist);
        handle.set_finish_early();
        assert!(handle.is_finish_early());
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn registry_insert_get_remove() {
        let registry = ProcessRegistry::new();
        assert!(registry.is_empty());

        let handle = Arc::new(ProcessHandle::new(JobType::Convert));
        registry.insert("job-1", handle.clone());
        assert_eq!(registry.len(), 1);
        assert!(registry.get("job-1").is_some());
        assert!(registry.get("job-2").is_none());

        let removed = registry.remove("job-1").unwrap();
        assert_eq!(removed.job_type, JobType::Convert);
        assert!(registry.remove("job-1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn temp_paths_round_trip() {
        let handle = ProcessHandle::new(JobType::Compress)
            .with_temp_file(PathBuf::from("/tmp/a"))
            .with_temp_dir(PathBuf::from("/tmp/dir"));
        let (file, dir) = handle.temp_paths();
        assert_eq!(file, Some(PathBuf::from("/tmp/a")));
        assert_eq!(dir, Some(PathBuf::from("/tmp/dir")));
    }
}
