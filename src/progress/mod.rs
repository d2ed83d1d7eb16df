//! Progress stream hub.
//!
//! One SSE subscriber per job id, fed by a bounded lossy channel: emitters
//! never block on a slow client, the SSE task serializes frames in order.
//! Every frame embeds a governor snapshot. The hub also tracks pending jobs
//! so a client that reconnects mid-job gets a `resuming` frame instead of
//! starting blind, and throttles its own log output to >=25-point progress
//! deltas.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::info;

use crate::governor::{Governor, QueueStatus};
use crate::utils::short_id;

const SUBSCRIBER_BUFFER: usize = 64;

/// One SSE event payload.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressFrame {
    pub stage: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(rename = "queueStatus")]
    pub queue_status: QueueStatus,
}

/// A job a client may reconnect to.
#[derive(Debug, Clone)]
pub struct PendingJob {
    pub job_type: String,
    pub url: String,
    pub client_id: String,
    pub status: String,
    pub progress: f64,
    pub created_at: Instant,
    pub resumable: bool,
}

pub struct ProgressHub {
    governor: Arc<Governor>,
    subscribers: DashMap<String, mpsc::Sender<ProgressFrame>>,
    pending: Mutex<HashMap<String, PendingJob>>,
    last_logged: Mutex<HashMap<String, f64>>,
}

impl ProgressHub {
    pub fn new(governor: Arc<Governor>) -> Self {
        Self {
            governor,
            subscribers: DashMap::new(),
            pending: Mutex::new(HashMap::new()),
            last_logged: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the (single) subscriber for a job id. A previous subscriber
    /// for the same id is replaced; its stream ends when it notices the
    /// closed channel.
    pub fn subscribe(&self, job_id: &str) -> mpsc::Receiver<ProgressFrame> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.insert(job_id.to_string(), tx);
        rx
    }

    pub fn unsubscribe(&self, job_id: &str) {
        self.subscribers.remove(job_id);
    }

    pub fn has_subscriber(&self, job_id: &str) -> bool {
        self.subscribers
            .get(job_id)
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Emit a frame to the job's subscriber (best-effort, lossy) and apply
    /// the log throttling policy.
    pub fn send(
        &self,
        job_id: &str,
        stage: &str,
        message: &str,
        progress: Option<f64>,
        extra: Option<Map<String, Value>>,
    ) {
        let frame = ProgressFrame {
            stage: stage.to_string(),
            message: message.to_string(),
            progress,
            speed: None,
            eta: None,
            extra: extra.unwrap_or_default(),
            queue_status: self.governor.snapshot(),
        };
        self.send_frame(job_id, frame);
    }

    pub fn send_frame(&self, job_id: &str, frame: ProgressFrame) {
        if let Some(tx) = self.subscribers.get(job_id) {
            if tx.is_closed() {
                drop(tx);
                self.subscribers.remove(job_id);
            } else {
                // Lossy by design: a stalled client drops frames rather than
                // stalling the orchestrator.
                let _ = tx.try_send(frame.clone());
            }
        }

        // Progress frames are logged only at 25-point strides; stage
        // transitions always log.
        let mut last_logged = self.last_logged.lock();
        match frame.progress {
            Some(progress) if progress >= 0.0 => {
                let last = last_logged.get(job_id).copied().unwrap_or(0.0);
                if progress >= 100.0 || progress - last >= 25.0 {
                    info!(
                        job = %short_id(job_id),
                        stage = %frame.stage,
                        "{}", frame.message
                    );
                    if progress >= 100.0 {
                        last_logged.remove(job_id);
                    } else {
                        last_logged.insert(job_id.to_string(), progress);
                    }
                }
            }
            _ => {
                info!(
                    job = %short_id(job_id),
                    stage = %frame.stage,
                    "{}", frame.message
                );
                last_logged.remove(job_id);
            }
        }
    }

    pub fn send_simple(&self, job_id: &str, stage: &str, message: &str) {
        self.send(job_id, stage, message, None, None);
    }

    pub fn send_percent(&self, job_id: &str, stage: &str, message: &str, progress: f64) {
        self.send(job_id, stage, message, Some(progress), None);
    }

    /// Build a frame without emitting it (the SSE handler uses this for its
    /// `connected` / `resuming` hello).
    pub fn make_frame(&self, stage: &str, message: &str, progress: Option<f64>) -> ProgressFrame {
        ProgressFrame {
            stage: stage.to_string(),
            message: message.to_string(),
            progress,
            speed: None,
            eta: None,
            extra: Map::new(),
            queue_status: self.governor.snapshot(),
        }
    }

    // Pending-job bookkeeping for resumable streams.

    pub fn register_pending(&self, job_id: &str, job_type: &str, url: &str, client_id: &str, status: &str) {
        self.pending.lock().insert(
            job_id.to_string(),
            PendingJob {
                job_type: job_type.to_string(),
                url: url.to_string(),
                client_id: client_id.to_string(),
                status: status.to_string(),
                progress: 0.0,
                created_at: Instant::now(),
                resumable: true,
            },
        );
    }

    pub fn update_pending(&self, job_id: &str, progress: f64, status: &str) {
        let mut pending = self.pending.lock();
        if let Some(job) = pending.get_mut(job_id) {
            job.progress = progress;
            if !status.is_empty() {
                job.status = status.to_string();
            }
        }
    }

    pub fn remove_pending(&self, job_id: &str) {
        self.pending.lock().remove(job_id);
    }

    pub fn pending(&self, job_id: &str) -> Option<PendingJob> {
        self.pending.lock().get(job_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> ProgressHub {
        ProgressHub::new(Arc::new(Governor::new()))
    }

    #[tokio::test]
    async fn frames_reach_the_subscriber() {
        let hub = hub();
        let mut rx = hub.subscribe("job-1");
        hub.send_percent("job-1", "downloading", "Downloading... 10%", 10.0);
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.stage, "downloading");
        assert_eq!(frame.progress, Some(10.0));
        assert!(frame.queue_status.limits.contains_key("download"));
    }

    #[tokio::test]
    async fn no_subscriber_is_silently_dropped() {
        let hub = hub();
        // Must not panic or block.
        hub.send_simple("nobody", "starting", "hello");
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let hub = hub();
        let rx = hub.subscribe("job-1");
        drop(rx);
        hub.send_simple("job-1", "starting", "hello");
        assert!(!hub.has_subscriber("job-1"));
    }

    #[tokio::test]
    async fn resubscribe_replaces_previous_writer() {
        let hub = hub();
        let mut rx1 = hub.subscribe("job-1");
        let mut rx2 = hub.subscribe("job-1");
        hub.send_simple("job-1", "downloading", "x");
        assert!(rx2.recv().await.is_some());
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_buffer_drops_rather_than_blocks() {
        let hub = hub();
        let mut rx = hub.subscribe("job-1");
        for i in 0..(SUBSCRIBER_BUFFER + 16) {
            hub.send_percent("job-1", "downloading", "tick", i as f64);
        }
        // The receiver sees at most a full buffer; the overflow was dropped.
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
    }

    #[test]
    fn frame_serialization_shape() {
        let hub = hub();
        let mut extra = Map::new();
        extra.insert("totalVideos".to_string(), Value::from(12));
        let frame = ProgressFrame {
            stage: "downloading".into(),
            message: "Downloading 3/12".into(),
            progress: Some(25.0),
            speed: Some("1.2 MiB/s".into()),
            eta: Some("00:31".into()),
            extra,
            queue_status: hub.governor.snapshot(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["stage"], "downloading");
        assert_eq!(json["totalVideos"], 12);
        assert!(json["queueStatus"]["limits"].is_object());
        assert_eq!(json["progress"], 25.0);
    }

    #[test]
    fn pending_jobs_round_trip() {
        let hub = hub();
        hub.register_pending("job-1", "download", "https://example.com/v", "client-a", "starting");
        hub.update_pending("job-1", 42.0, "downloading");
        let p = hub.pending("job-1").unwrap();
        assert_eq!(p.progress, 42.0);
        assert_eq!(p.status, "downloading");
        assert!(p.resumable);

        // Empty status only updates progress.
        hub.update_pending("job-1", 50.0, "");
        assert_eq!(hub.pending("job-1").unwrap().status, "downloading");

        hub.remove_pending("job-1");
        assert!(hub.pending("job-1").is_none());
    }
}
