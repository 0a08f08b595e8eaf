use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::aggregator::{DuplicateCopy, SubmissionDraft, UnreadableRef};
use crate::db::job_repo::FileCounts;
use crate::worker::job::{IngestJob, UnassignedFile};

use super::error::PipelineError;

/// Cooperative stop signals for one job: its own cancel flag plus the
/// pool-wide shutdown flag.
#[derive(Clone, Default)]
pub struct JobControl {
    cancelled: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl JobControl {
    pub fn new(shutdown: Arc<AtomicBool>) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            shutdown,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Called between entries and between students.
    pub fn checkpoint(&self) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if self.is_shutdown() {
            return Err(PipelineError::Interrupted);
        }
        Ok(())
    }
}

/// A within-job copy waiting for its student's draft.
pub struct PendingCopy {
    pub student_id: String,
    pub source_path: String,
    pub first_path: String,
    pub copy: DuplicateCopy,
}

/// State of one pass over a job's archive. Every run starts from a fresh
/// context, so counters always describe the latest pass.
pub struct JobContext {
    pub job: IngestJob,

    pub counts: FileCounts,

    // Kept files per student, ordered by student id
    pub drafts: BTreeMap<String, SubmissionDraft>,

    // Attached to drafts once the walk is over
    pub pending_copies: Vec<PendingCopy>,
    pub pending_unreadable: Vec<(String, UnreadableRef)>,

    pub unassigned: Vec<UnassignedFile>,

    pub submissions_applied: usize,
}

impl JobContext {
    pub fn new(job: IngestJob) -> Self {
        Self {
            job,
            counts: FileCounts::default(),
            drafts: BTreeMap::new(),
            pending_copies: Vec::new(),
            pending_unreadable: Vec::new(),
            unassigned: Vec::new(),
            submissions_applied: 0,
        }
    }

    /// Moves pending copies and unreadable references onto their students'
    /// drafts. Anything for a student without kept files is listed as
    /// unassigned.
    pub fn attach_pending(&mut self) {
        for pending in self.pending_copies.drain(..) {
            match self.drafts.get_mut(&pending.student_id) {
                Some(draft) => draft.duplicate_copies.push(pending.copy),
                None => self.unassigned.push(UnassignedFile {
                    reason: format!("duplicate of {}", pending.first_path),
                    file_name: pending.copy.name,
                    source_path: pending.source_path,
                }),
            }
        }

        for (student_id, unreadable) in self.pending_unreadable.drain(..) {
            match self.drafts.get_mut(&student_id) {
                Some(draft) => draft.unreadable.push(unreadable),
                None => self.unassigned.push(UnassignedFile {
                    file_name: unreadable.name,
                    source_path: unreadable.source_path,
                    reason: unreadable.reason,
                }),
            }
        }
    }
}
