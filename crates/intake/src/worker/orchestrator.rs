use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::broadcast;

use crate::config::{validate_session, Config, SessionSpec};
use crate::db::job_repo::{self, JobFilter, JobRow};
use crate::db::submission_repo;
use crate::db::{Database, DatabaseError};
use crate::error::{IntakeError, Result, StorageError, WorkerError};
use crate::model::JobStatus;
use crate::pipeline::{JobControl, JobProgressEvent, PipelineConfig, PipelineError};
use crate::storage::FileStorage;
use crate::worker::job::{CreatedSubmission, IngestJob, JobOutcome, ProcessingResult, UnassignedFile};
use crate::worker::pool::{ControlRegistry, WorkerPool};

/// Accepts uploads, owns the job lifecycle and reports results.
pub struct Orchestrator {
    db: Database,
    config: Arc<PipelineConfig>,
    uploads: FileStorage,
    controls: ControlRegistry,
    pool: WorkerPool,
}

impl Orchestrator {
    pub fn new(
        config: Arc<PipelineConfig>,
        db: Database,
        worker_count: usize,
        lock_timeout: Duration,
    ) -> Self {
        Self::with_progress_sender(config, db, worker_count, lock_timeout, None)
    }

    pub fn with_progress_sender(
        config: Arc<PipelineConfig>,
        db: Database,
        worker_count: usize,
        lock_timeout: Duration,
        progress_sender: Option<Arc<broadcast::Sender<JobProgressEvent>>>,
    ) -> Self {
        let controls = ControlRegistry::default();
        let pool = WorkerPool::new(
            Arc::clone(&config),
            db.clone(),
            Arc::clone(&controls),
            worker_count,
            lock_timeout,
            progress_sender,
        );
        Self {
            uploads: FileStorage::new(&config.upload_directory),
            db,
            config,
            controls,
            pool,
        }
    }

    pub fn from_config(config: &Config, db: Database) -> Self {
        Self::new(
            Arc::new(PipelineConfig::from_config(config)),
            db,
            config.worker_count,
            Duration::from_secs(config.session_lock_timeout_secs),
        )
    }

    /// Stores the uploaded archive and queues a job for it.
    pub fn submit<R: Read>(
        &self,
        session: SessionSpec,
        archive_name: &str,
        reader: &mut R,
    ) -> Result<String> {
        self.enqueue(session, archive_name, reader, None)
    }

    fn enqueue<R: Read>(
        &self,
        session: SessionSpec,
        archive_name: &str,
        reader: &mut R,
        retry_of: Option<&str>,
    ) -> Result<String> {
        if self.pool.is_shutdown() {
            return Err(WorkerError::ChannelClosed.into());
        }
        validate_session(&session, &self.config.naming)?;

        let id = uuid::Uuid::new_v4().to_string();
        let upload_path = self.uploads.store_upload(&id, archive_name, reader)?;
        let job = IngestJob {
            extract_path: self.config.extract_directory.join(&id),
            id,
            session,
            archive_name: archive_name.to_string(),
            upload_path,
        };
        job_repo::insert(&self.db, &job.to_row(retry_of)?)?;
        info!(
            "Queued job {} for exam session {} ({})",
            job.id, job.session.exam_session_id, job.archive_name
        );

        let id = job.id.clone();
        self.dispatch(job)?;
        Ok(id)
    }

    fn dispatch(&self, job: IngestJob) -> Result<()> {
        self.controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.id.clone(), JobControl::new(self.pool.shutdown_flag()));
        let id = job.id.clone();
        if let Err(e) = self.pool.submit(job) {
            self.controls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            return Err(e.into());
        }
        Ok(())
    }

    /// The job report, built from the job row and the rows it committed.
    pub fn get_result(&self, job_id: &str) -> Result<ProcessingResult> {
        let row = self.find_job(job_id)?;
        let totals = submission_repo::job_totals(&self.db, job_id)?;
        let created_submissions = submission_repo::list_created_by_job(&self.db, job_id)?
            .into_iter()
            .map(|(submission, first_file)| CreatedSubmission {
                submission_id: submission.id,
                student_id: submission.student_id,
                student_name: submission.student_name,
                file_name: first_file,
            })
            .collect();
        let unassigned_files: Vec<UnassignedFile> = match row.unassigned_files.as_deref() {
            Some(json) => serde_json::from_str(json).map_err(|e| DatabaseError::Json {
                column: "unassigned_files",
                source: e,
            })?,
            None => Vec::new(),
        };

        Ok(ProcessingResult {
            status: JobStatus::parse(&row.status, &row.id),
            job_id: row.id,
            upload_path: row.upload_path,
            extract_path: row.extract_path,
            total_files: row.total_files as u64,
            submissions_created: totals.submissions_created,
            violations_created: totals.violations_created,
            images_extracted: totals.images_extracted,
            duplicate_files: row.duplicate_files as u64,
            processed_files: row.processed_files as u64,
            error_files: row.error_files as u64,
            message: row.message,
            created_submissions,
            unassigned_files,
        })
    }

    /// Jobs matching `filter`, newest first, with the total match count.
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<(Vec<JobRow>, u64)> {
        Ok(job_repo::query(&self.db, filter)?)
    }

    /// Queues the stored archive of a terminal job again as a new job.
    pub fn retry(&self, job_id: &str) -> Result<String> {
        let row = self.find_job(job_id)?;
        let status = JobStatus::parse(&row.status, &row.id);
        if !status.is_terminal() {
            return Err(WorkerError::NotRetryable {
                job_id: row.id,
                status: status.to_string(),
            }
            .into());
        }

        let previous = IngestJob::from_row(&row)?;
        let mut archive =
            File::open(&previous.upload_path).map_err(|e| StorageError::ReadFile {
                path: previous.upload_path.clone(),
                source: e,
            })?;
        let id = self.enqueue(previous.session, &previous.archive_name, &mut archive, Some(job_id))?;
        info!("Job {} retried as {}", job_id, id);
        Ok(id)
    }

    /// Requeues every Queued or Running job, oldest first. Called at startup.
    pub fn resume_incomplete(&self) -> Result<Vec<String>> {
        let mut resumed = Vec::new();
        for row in job_repo::list_incomplete(&self.db)? {
            match IngestJob::from_row(&row) {
                Ok(job) => {
                    let id = job.id.clone();
                    self.dispatch(job)?;
                    resumed.push(id);
                }
                Err(e) => {
                    warn!("Cannot resume job {}: {}", row.id, e);
                    job_repo::finish(&self.db, &row.id, JobStatus::Failed.as_str(), Some(&e.to_string()))?;
                }
            }
        }
        if !resumed.is_empty() {
            info!("Resumed {} incomplete job(s)", resumed.len());
        }
        Ok(resumed)
    }

    /// Requests cooperative cancellation. A job no worker has claimed yet is
    /// failed right away. Returns false when the job is already terminal.
    pub fn cancel(&self, job_id: &str) -> Result<bool> {
        let row = self.find_job(job_id)?;
        if JobStatus::parse(&row.status, &row.id).is_terminal() {
            return Ok(false);
        }

        if let Some(control) = self
            .controls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
        {
            control.cancel();
        }
        if job_repo::cancel_queued(&self.db, job_id, &PipelineError::Cancelled.to_string())? {
            info!("Cancelled queued job {}", job_id);
        }
        Ok(true)
    }

    pub fn recv_outcome(&self) -> Option<JobOutcome> {
        self.pool.recv_outcome()
    }

    pub fn recv_outcome_timeout(&self, timeout: Duration) -> Option<JobOutcome> {
        self.pool.recv_outcome_timeout(timeout)
    }

    pub fn try_recv_outcome(&self) -> Option<JobOutcome> {
        self.pool.try_recv_outcome()
    }

    pub fn upload_directory(&self) -> PathBuf {
        self.uploads.root().to_path_buf()
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.pool.is_shutdown()
    }

    /// Stops accepting work and joins the workers.
    pub fn wait(self) {
        self.pool.wait();
    }

    fn find_job(&self, job_id: &str) -> Result<JobRow> {
        job_repo::find_by_id(&self.db, job_id)?
            .ok_or_else(|| IntakeError::JobNotFound(job_id.to_string()))
    }
}
