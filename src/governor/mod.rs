//! Job admission governor.
//!
//! Tracks active job counts per type against fixed limits and refuses new
//! work when the temp volume is low on space. Counters can leak if an
//! orchestrator dies on an unexpected path; a periodic reconciliation pass
//! zeroes them whenever no process handles exist, bounding the damage.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::Disks;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{self, JobType};
use crate::process::ProcessRegistry;

/// Admission refusal with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRejected {
    pub reason: String,
}

/// Governor snapshot embedded in progress frames and the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub active: HashMap<String, usize>,
    pub queued: usize,
    pub limits: HashMap<String, usize>,
    #[serde(rename = "diskSpaceGB")]
    pub disk_space_gb: f64,
}

pub struct Governor {
    counters: Mutex<HashMap<JobType, usize>>,
    disks: Mutex<Disks>,
}

impl Governor {
    pub fn new() -> Self {
        let mut counters = HashMap::new();
        for job_type in JobType::ALL {
            counters.insert(job_type, 0);
        }
        Self {
            counters: Mutex::new(counters),
            disks: Mutex::new(Disks::new_with_refreshed_list()),
        }
    }

    /// Admit one job of the given type, incrementing its counter.
    ///
    /// The disk-free read happens while the counter lock is held; a large
    /// concurrent write can therefore cause a spurious rejection. The bound
    /// is a soft floor and callers just surface the reason.
    pub fn admit(&self, job_type: JobType) -> Result<(), AdmissionRejected> {
        let mut counters = self.counters.lock();
        let count = counters.entry(job_type).or_insert(0);

        if *count >= job_type.limit() {
            return Err(AdmissionRejected {
                reason: format!(
                    "Too many active {} jobs (limit: {})",
                    job_type,
                    job_type.limit()
                ),
            });
        }

        let avail_gb = self.disk_space_gb();
        if avail_gb < config::DISK_SPACE_MIN_GB {
            return Err(AdmissionRejected {
                reason: format!(
                    "Low disk space ({avail_gb:.1}GB free, need {}GB)",
                    config::DISK_SPACE_MIN_GB as u64
                ),
            });
        }

        *count += 1;
        debug!(job_type = %job_type, active = *count, "Job admitted");
        Ok(())
    }

    /// Decrement the counter for a finished job; never goes below zero.
    pub fn release(&self, job_type: JobType) {
        let mut counters = self.counters.lock();
        let count = counters.entry(job_type).or_insert(0);
        if *count > 0 {
            *count -= 1;
        }
    }

    pub fn active(&self, job_type: JobType) -> usize {
        *self.counters.lock().get(&job_type).unwrap_or(&0)
    }

    /// All counters, cloned.
    pub fn active_counts(&self) -> HashMap<JobType, usize> {
        self.counters.lock().clone()
    }

    pub fn snapshot(&self) -> QueueStatus {
        let active = {
            let counters = self.counters.lock();
            counters
                .iter()
                .map(|(t, c)| (t.as_str().to_string(), *c))
                .collect()
        };
        let limits = JobType::ALL
            .iter()
            .map(|t| (t.as_str().to_string(), t.limit()))
            .collect();
        QueueStatus {
            active,
            queued: 0,
            limits,
            disk_space_gb: self.disk_space_gb(),
        }
    }

    /// Free space on the volume hosting the temp root, in GB. Errors read as
    /// "plenty" so a broken probe never wedges admission.
    pub fn disk_space_gb(&self) -> f64 {
        let mut disks = self.disks.lock();
        disks.refresh(true);

        let temp_root = Path::new(config::TEMP_ROOT);
        let mut best: Option<(u64, usize)> = None;
        for disk in disks.list() {
            let mount = disk.mount_point();
            if temp_root.starts_with(mount) {
                let len = mount.as_os_str().len();
                if best.map(|(_, l)| len > l).unwrap_or(true) {
                    best = Some((disk.available_space(), len));
                }
            }
        }

        match best {
            Some((avail, _)) => avail as f64 / (1024.0 * 1024.0 * 1024.0),
            None => 999.0,
        }
    }

    /// Zero all counters when no process handles exist. Returns true when a
    /// leak was found.
    pub fn reconcile(&self, processes: &ProcessRegistry) -> bool {
        if !processes.is_empty() {
            return false;
        }

        let mut counters = self.counters.lock();
        let mut leaked = false;
        for (job_type, count) in counters.iter_mut() {
            if *count > 0 {
                warn!(
                    job_type = %job_type,
                    count = *count,
                    "Counter leak detected with no active processes. Resetting."
                );
                *count = 0;
                leaked = true;
            }
        }
        if leaked {
            info!(counters = ?*counters, "Counters reset");
        }
        leaked
    }

    /// Spawn the periodic reconciliation task (every 30 s).
    pub fn start_reconciliation(
        self: &Arc<Self>,
        processes: Arc<ProcessRegistry>,
        cancel: CancellationToken,
    ) {
        let governor = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Counter reconciliation shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        governor.reconcile(&processes);
                    }
                }
            }
        });
    }
}

impl Default for Governor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_enforces_per_type_limit() {
        let governor = Governor::new();
        for _ in 0..JobType::Compress.limit() {
            governor.admit(JobType::Compress).unwrap();
        }
        let rejected = governor.admit(JobType::Compress).unwrap_err();
        assert!(rejected.reason.contains("compress"));
        assert!(rejected.reason.contains("limit: 1"));

        // A different type is unaffected.
        governor.admit(JobType::Download).unwrap();
    }

    #[test]
    fn rejection_names_type_and_limit() {
        let governor = Governor::new();
        for _ in 0..JobType::Download.limit() {
            governor.admit(JobType::Download).unwrap();
        }
        let rejected = governor.admit(JobType::Download).unwrap_err();
        assert!(rejected.reason.contains("download"));
        assert!(rejected.reason.contains('6'));
    }

    #[test]
    fn release_never_goes_negative() {
        let governor = Governor::new();
        governor.release(JobType::Convert);
        governor.release(JobType::Convert);
        assert_eq!(governor.active(JobType::Convert), 0);

        governor.admit(JobType::Convert).unwrap();
        assert_eq!(governor.active(JobType::Convert), 1);
        governor.release(JobType::Convert);
        assert_eq!(governor.active(JobType::Convert), 0);
    }

    #[test]
    fn admit_release_pairs_net_out() {
        let governor = Governor::new();
        let mut net = 0usize;
        for i in 0..40 {
            if i % 3 != 2 {
                if governor.admit(JobType::Download).is_ok() {
                    net += 1;
                }
            } else if net > 0 {
                governor.release(JobType::Download);
                net -= 1;
            }
        }
        assert_eq!(governor.active(JobType::Download), net);
    }

    #[test]
    fn reconcile_resets_only_when_no_processes() {
        let governor = Governor::new();
        let processes = ProcessRegistry::new();

        governor.admit(JobType::Download).unwrap();
        governor.admit(JobType::Playlist).unwrap();

        // With a live process handle nothing is touched.
        processes.insert(
            "job-1",
            Arc::new(crate::process::ProcessHandle::new(JobType::Download)),
        );
        assert!(!governor.reconcile(&processes));
        assert_eq!(governor.active(JobType::Download), 1);

        // Without processes every counter is zeroed.
        processes.remove("job-1");
        assert!(governor.reconcile(&processes));
        assert_eq!(governor.active(JobType::Download), 0);
        assert_eq!(governor.active(JobType::Playlist), 0);

        // Clean state reports no leak.
        assert!(!governor.reconcile(&processes));
    }

    #[test]
    fn snapshot_contains_all_types() {
        let governor = Governor::new();
        governor.admit(JobType::Transcribe).unwrap();
        let snap = governor.snapshot();
        assert_eq!(snap.queued, 0);
        assert_eq!(snap.active["transcribe"], 1);
        assert_eq!(snap.limits["download"], 6);
        assert_eq!(snap.limits.len(), JobType::ALL.len());
    }

    #[tokio::test]
    async fn concurrent_admission_respects_limit() {
        let governor = Arc::new(Governor::new());
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let governor = governor.clone();
            tasks.push(tokio::spawn(async move {
                governor.admit(JobType::Download).is_ok()
            }));
        }
        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, JobType::Download.limit());
        assert_eq!(governor.active(JobType::Download), JobType::Download.limit());
    }
}
