use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::db::job_repo::FileCounts;

/// Processing phases of an ingestion job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Queued,
    WaitingForSession,
    Unpacking,
    Persisting,
    Completed,
    Failed,
    Interrupted,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Queued => write!(f, "Queued"),
            JobPhase::WaitingForSession => write!(f, "Waiting for exam session"),
            JobPhase::Unpacking => write!(f, "Unpacking"),
            JobPhase::Persisting => write!(f, "Persisting submissions"),
            JobPhase::Completed => write!(f, "Completed"),
            JobPhase::Failed => write!(f, "Failed"),
            JobPhase::Interrupted => write!(f, "Interrupted"),
        }
    }
}

/// Events emitted by the pipeline during processing.
pub enum ProgressEvent {
    Phase { phase: JobPhase, message: String },
    Completed { counts: FileCounts },
    Failed { error: String },
    Interrupted,
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// No-op reporter for unit tests.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Progress event as sent to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    pub job_id: String,
    pub phase: JobPhase,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_files: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_files: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_files: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_files: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// Forwards pipeline events to a broadcast channel. Having no subscribers
/// is not an error.
pub struct BroadcastProgress {
    job_id: String,
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl BroadcastProgress {
    pub fn new(job_id: &str, sender: Arc<broadcast::Sender<JobProgressEvent>>) -> Self {
        Self {
            job_id: job_id.to_string(),
            sender,
        }
    }

    fn send(&self, phase: JobPhase, message: String, counts: Option<FileCounts>) {
        let event = JobProgressEvent {
            job_id: self.job_id.clone(),
            phase,
            message,
            total_files: counts.map(|c| c.total_files),
            processed_files: counts.map(|c| c.processed_files),
            error_files: counts.map(|c| c.error_files),
            duplicate_files: counts.map(|c| c.duplicate_files),
            timestamp: Utc::now(),
        };
        let _ = self.sender.send(event);
    }
}

impl ProgressReporter for BroadcastProgress {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Phase { phase, message } => self.send(phase, message, None),
            ProgressEvent::Completed { counts } => self.send(
                JobPhase::Completed,
                format!(
                    "{} file(s): {} processed, {} errors, {} duplicates",
                    counts.total_files,
                    counts.processed_files,
                    counts.error_files,
                    counts.duplicate_files
                ),
                Some(counts),
            ),
            ProgressEvent::Failed { error } => self.send(JobPhase::Failed, error, None),
            ProgressEvent::Interrupted => self.send(
                JobPhase::Interrupted,
                "Stopped by shutdown; will resume".to_string(),
                None,
            ),
        }
    }
}
