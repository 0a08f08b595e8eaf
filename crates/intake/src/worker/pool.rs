use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use tokio::sync::broadcast;
use tracing::info_span;

use crate::db::job_repo::{self, FileCounts};
use crate::db::{Database, DatabaseError};
use crate::model::JobStatus;
use crate::pipeline::{
    BroadcastProgress, IngestionPipeline, JobContext, JobControl, JobPhase, JobProgressEvent,
    NoopProgress, PipelineConfig, PipelineError, ProgressEvent, ProgressReporter,
};
use crate::worker::job::{IngestJob, JobOutcome, UnassignedFile};
use crate::worker::session_lock::{LockWait, SessionLocks};

/// Cancel flags of queued and running jobs, keyed by job id.
pub type ControlRegistry = Arc<Mutex<HashMap<String, JobControl>>>;

/// Everything a worker thread needs besides its job channel.
struct WorkerShared {
    db: Database,
    config: Arc<PipelineConfig>,
    locks: Arc<SessionLocks>,
    controls: ControlRegistry,
    lock_timeout: Duration,
    shutdown: Arc<AtomicBool>,
    progress_sender: Option<Arc<broadcast::Sender<JobProgressEvent>>>,
}

impl WorkerShared {
    fn control_for(&self, job_id: &str) -> JobControl {
        let mut controls = self.controls.lock().unwrap_or_else(PoisonError::into_inner);
        controls
            .entry(job_id.to_string())
            .or_insert_with(|| JobControl::new(Arc::clone(&self.shutdown)))
            .clone()
    }

    fn release_control(&self, job_id: &str) {
        self.controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id);
    }
}

pub struct WorkerPool {
    job_sender: Sender<IngestJob>,
    outcome_receiver: Receiver<JobOutcome>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Starts `worker_count` worker threads.
    ///
    /// # Panics
    /// Panics if `worker_count` is 0.
    pub fn new(
        config: Arc<PipelineConfig>,
        db: Database,
        controls: ControlRegistry,
        worker_count: usize,
        lock_timeout: Duration,
        progress_sender: Option<Arc<broadcast::Sender<JobProgressEvent>>>,
    ) -> Self {
        assert!(worker_count > 0, "worker_count must be > 0");
        let (job_sender, job_receiver) = bounded::<IngestJob>(worker_count * 2);
        // Outcomes nobody reads must never block a worker.
        let (outcome_sender, outcome_receiver) = unbounded::<JobOutcome>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let shared = Arc::new(WorkerShared {
            db,
            config,
            locks: SessionLocks::new(),
            controls,
            lock_timeout,
            shutdown: Arc::clone(&shutdown),
            progress_sender,
        });

        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let job_rx = job_receiver.clone();
            let outcome_tx = outcome_sender.clone();
            let worker_shared = Arc::clone(&shared);

            let handle = thread::spawn(move || {
                run_worker(worker_id, job_rx, outcome_tx, worker_shared);
            });

            workers.push(handle);
        }

        info!("Started {} workers", worker_count);

        Self {
            job_sender,
            outcome_receiver,
            workers,
            shutdown,
        }
    }

    pub fn submit(&self, job: IngestJob) -> Result<(), crate::error::WorkerError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(crate::error::WorkerError::ChannelClosed);
        }

        self.job_sender
            .send(job)
            .map_err(|_| crate::error::WorkerError::ChannelClosed)
    }

    pub fn try_recv_outcome(&self) -> Option<JobOutcome> {
        self.outcome_receiver.try_recv().ok()
    }

    pub fn recv_outcome(&self) -> Option<JobOutcome> {
        self.outcome_receiver.recv().ok()
    }

    pub fn recv_outcome_timeout(&self, timeout: Duration) -> Option<JobOutcome> {
        self.outcome_receiver.recv_timeout(timeout).ok()
    }

    /// The flag every job control observes.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn wait(self) {
        // Drop sender to signal workers to exit
        drop(self.job_sender);

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

fn run_worker(
    worker_id: usize,
    job_receiver: Receiver<IngestJob>,
    outcome_sender: Sender<JobOutcome>,
    shared: Arc<WorkerShared>,
) {
    debug!("Worker {} started", worker_id);

    let pipeline = IngestionPipeline::new(Arc::clone(&shared.config), shared.db.clone());

    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match job_receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(job) => {
                debug!("Worker {} processing job {}", worker_id, job.id);

                let outcome = process_job(worker_id, &shared, &pipeline, job);

                if let Err(e) = outcome_sender.send(outcome) {
                    error!("Worker {} failed to send outcome: {}", worker_id, e);
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                continue;
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                debug!("Worker {} job channel disconnected", worker_id);
                break;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

fn process_job(
    worker_id: usize,
    shared: &WorkerShared,
    pipeline: &IngestionPipeline,
    job: IngestJob,
) -> JobOutcome {
    let job_id = job.id.clone();
    let _job_span = info_span!("job", job_id = %job_id, worker = worker_id).entered();

    let control = shared.control_for(&job_id);
    let progress: Box<dyn ProgressReporter> = match &shared.progress_sender {
        Some(sender) => Box::new(BroadcastProgress::new(&job_id, Arc::clone(sender))),
        None => Box::new(NoopProgress),
    };

    let outcome = run_job(shared, pipeline, job, &control, progress.as_ref());
    shared.release_control(&job_id);
    outcome
}

fn run_job(
    shared: &WorkerShared,
    pipeline: &IngestionPipeline,
    job: IngestJob,
    control: &JobControl,
    progress: &dyn ProgressReporter,
) -> JobOutcome {
    if control.is_cancelled() {
        return conclude(shared, &job.id, JobStatus::Failed, Some(PipelineError::Cancelled.to_string()));
    }

    progress.report(ProgressEvent::Phase {
        phase: JobPhase::WaitingForSession,
        message: format!("Waiting for exam session {}", job.session.exam_session_id),
    });

    // Held until the job is terminal.
    let _session_guard = match shared.locks.acquire(
        &job.session.exam_session_id,
        shared.lock_timeout,
        || control.is_cancelled() || control.is_shutdown(),
    ) {
        Ok(guard) => guard,
        Err(LockWait::TimedOut) => {
            let err = PipelineError::LockTimeout {
                exam_session_id: job.session.exam_session_id.clone(),
                waited_secs: shared.lock_timeout.as_secs(),
            };
            warn!("Job {}: {}", job.id, err);
            progress.report(ProgressEvent::Failed {
                error: err.to_string(),
            });
            return conclude(shared, &job.id, JobStatus::Failed, Some(err.to_string()));
        }
        Err(LockWait::Stopped) if control.is_cancelled() => {
            return conclude(shared, &job.id, JobStatus::Failed, Some(PipelineError::Cancelled.to_string()));
        }
        Err(LockWait::Stopped) => {
            info!("Job {} left queued by shutdown", job.id);
            return JobOutcome {
                job_id: job.id,
                status: JobStatus::Queued,
                message: None,
            };
        }
    };

    match job_repo::claim(&shared.db, &job.id) {
        Ok(true) => {}
        Ok(false) => {
            let status = job_repo::find_by_id(&shared.db, &job.id)
                .ok()
                .flatten()
                .map(|row| JobStatus::parse(&row.status, &row.id))
                .unwrap_or(JobStatus::Failed);
            info!("Job {} is already {}, skipping", job.id, status);
            return JobOutcome {
                job_id: job.id,
                status,
                message: None,
            };
        }
        Err(e) => {
            error!("Failed to claim job {}: {}", job.id, e);
            return conclude(shared, &job.id, JobStatus::Failed, Some(e.to_string()));
        }
    }

    let job_id = job.id.clone();
    let (result, ctx) = pipeline.run(JobContext::new(job), control, progress);

    let recorded = record_pass(&shared.db, &job_id, &ctx.counts, &ctx.unassigned);
    if let Err(e) = &recorded {
        error!("Failed to record counters for job {}: {}", job_id, e);
    }

    match (result, recorded) {
        (Err(PipelineError::Interrupted), _) => JobOutcome {
            job_id,
            status: JobStatus::Running,
            message: Some(PipelineError::Interrupted.to_string()),
        },
        (Err(e), _) => conclude(shared, &job_id, JobStatus::Failed, Some(e.to_string())),
        // A completed report must carry the counters of this pass.
        (Ok(()), Err(e)) => conclude(
            shared,
            &job_id,
            JobStatus::Failed,
            Some(format!("Failed to record job counters: {}", e)),
        ),
        (Ok(()), Ok(())) => conclude(shared, &job_id, JobStatus::Completed, None),
    }
}

fn record_pass(
    db: &Database,
    job_id: &str,
    counts: &FileCounts,
    unassigned: &[UnassignedFile],
) -> Result<(), DatabaseError> {
    let unassigned_json = serde_json::to_string(unassigned).map_err(|e| DatabaseError::Json {
        column: "unassigned_files",
        source: e,
    })?;
    job_repo::record_counts(db, job_id, counts, Some(&unassigned_json))?;
    Ok(())
}

/// Moves the job to a terminal status and builds its outcome.
fn conclude(
    shared: &WorkerShared,
    job_id: &str,
    status: JobStatus,
    message: Option<String>,
) -> JobOutcome {
    match job_repo::finish(&shared.db, job_id, status.as_str(), message.as_deref()) {
        Ok(true) => {}
        Ok(false) => warn!("Job {} was already terminal", job_id),
        Err(e) => error!("Failed to finish job {}: {}", job_id, e),
    }
    JobOutcome {
        job_id: job_id.to_string(),
        status,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NamingConfig, SessionSpec, ViolationPolicyConfig};
    use crate::unpacker::test_support::build_zip;
    use crate::unpacker::UnpackLimits;
    use std::path::Path;
    use tempfile::TempDir;

    fn create_test_config(root: &Path) -> Arc<PipelineConfig> {
        Arc::new(PipelineConfig {
            upload_directory: root.join("uploads"),
            extract_directory: root.join("extracted"),
            limits: UnpackLimits::default(),
            naming: NamingConfig::default(),
            violations: ViolationPolicyConfig::default(),
        })
    }

    fn queue_job(db: &Database, root: &Path, id: &str, archive: &[u8]) -> IngestJob {
        let upload_path = root.join("uploads").join(id).join("upload.zip");
        std::fs::create_dir_all(upload_path.parent().unwrap()).unwrap();
        std::fs::write(&upload_path, archive).unwrap();

        let job = IngestJob {
            id: id.to_string(),
            session: SessionSpec::new("sess-1", "exam-1"),
            archive_name: "upload.zip".to_string(),
            upload_path,
            extract_path: root.join("extracted").join(id),
        };
        job_repo::insert(db, &job.to_row(None).unwrap()).unwrap();
        job
    }

    fn pool(root: &Path, db: &Database, controls: ControlRegistry) -> WorkerPool {
        WorkerPool::new(
            create_test_config(root),
            db.clone(),
            controls,
            2,
            Duration::from_secs(5),
            None,
        )
    }

    #[test]
    fn test_worker_pool_creation() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let pool = pool(temp_dir.path(), &db, ControlRegistry::default());

        assert!(!pool.is_shutdown());

        pool.shutdown();
        assert!(pool.is_shutdown());
        assert!(pool.submit(queue_job(&db, temp_dir.path(), "late", &[])).is_err());

        pool.wait();
    }

    #[test]
    fn test_submit_and_complete_job() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let pool = pool(temp_dir.path(), &db, ControlRegistry::default());

        let archive = build_zip(&[("S001_report.txt", b"answer one"), ("S002_report.txt", b"answer two")]);
        let job = queue_job(&db, temp_dir.path(), "job-1", &archive);
        pool.submit(job).unwrap();

        let outcome = pool.recv_outcome().unwrap();
        assert_eq!(outcome.status, JobStatus::Completed, "{:?}", outcome.message);

        let row = job_repo::find_by_id(&db, "job-1").unwrap().unwrap();
        assert_eq!(row.status, "completed");
        assert_eq!(row.total_files, 2);
        assert_eq!(row.processed_files, 2);
        assert_eq!(row.unassigned_files.as_deref(), Some("[]"));

        pool.shutdown();
        pool.wait();
    }

    #[test]
    fn test_missing_upload_fails_job() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let pool = pool(temp_dir.path(), &db, ControlRegistry::default());

        let job = queue_job(&db, temp_dir.path(), "job-2", b"");
        std::fs::remove_file(&job.upload_path).unwrap();
        pool.submit(job).unwrap();

        let outcome = pool.recv_outcome().unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);
        let row = job_repo::find_by_id(&db, "job-2").unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert!(row.message.unwrap().contains("could not be opened"));

        pool.shutdown();
        pool.wait();
    }

    #[test]
    fn test_cancelled_before_start() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let controls = ControlRegistry::default();
        let pool = pool(temp_dir.path(), &db, Arc::clone(&controls));

        let job = queue_job(&db, temp_dir.path(), "job-3", &build_zip(&[("S001.txt", b"x")]));
        let control = JobControl::new(pool.shutdown_flag());
        control.cancel();
        controls.lock().unwrap().insert("job-3".to_string(), control);
        pool.submit(job).unwrap();

        let outcome = pool.recv_outcome().unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.message.as_deref(), Some("Cancelled"));
        assert!(controls.lock().unwrap().is_empty());

        let row = job_repo::find_by_id(&db, "job-3").unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert!(row.started_at.is_none());

        pool.shutdown();
        pool.wait();
    }

    #[test]
    fn test_counter_write_failure_fails_job() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER reject_counts BEFORE UPDATE OF total_files ON jobs
                 BEGIN SELECT RAISE(ABORT, 'store unavailable'); END;",
            )?;
            Ok(())
        })
        .unwrap();
        let pool = pool(temp_dir.path(), &db, ControlRegistry::default());

        let job = queue_job(&db, temp_dir.path(), "job-4", &build_zip(&[("S001.txt", b"x")]));
        pool.submit(job).unwrap();

        let outcome = pool.recv_outcome().unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);
        let row = job_repo::find_by_id(&db, "job-4").unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert!(row.message.unwrap().contains("store unavailable"));

        pool.shutdown();
        pool.wait();
    }
}
