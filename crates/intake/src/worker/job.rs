use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::SessionSpec;
use crate::db::job_repo::JobRow;
use crate::db::DatabaseError;
use crate::model::JobStatus;

/// A job as handed to a worker.
#[derive(Debug, Clone)]
pub struct IngestJob {
    pub id: String,
    pub session: SessionSpec,
    pub archive_name: String,
    pub upload_path: PathBuf,
    pub extract_path: PathBuf,
}

impl IngestJob {
    pub fn from_row(row: &JobRow) -> Result<Self, DatabaseError> {
        let session: SessionSpec =
            serde_json::from_str(&row.session_spec).map_err(|e| DatabaseError::Json {
                column: "session_spec",
                source: e,
            })?;
        Ok(Self {
            id: row.id.clone(),
            session,
            archive_name: row.archive_name.clone(),
            upload_path: PathBuf::from(&row.upload_path),
            extract_path: PathBuf::from(&row.extract_path),
        })
    }

    /// A fresh Queued row for this job.
    pub fn to_row(&self, retry_of: Option<&str>) -> Result<JobRow, DatabaseError> {
        let session_spec = serde_json::to_string(&self.session).map_err(|e| DatabaseError::Json {
            column: "session_spec",
            source: e,
        })?;
        let now = chrono::Utc::now().to_rfc3339();
        Ok(JobRow {
            id: self.id.clone(),
            exam_session_id: self.session.exam_session_id.clone(),
            exam_id: self.session.exam_id.clone(),
            session_spec,
            archive_name: self.archive_name.clone(),
            upload_path: self.upload_path.to_string_lossy().to_string(),
            extract_path: self.extract_path.to_string_lossy().to_string(),
            status: JobStatus::Queued.as_str().to_string(),
            total_files: 0,
            processed_files: 0,
            error_files: 0,
            duplicate_files: 0,
            unassigned_files: None,
            message: None,
            retry_of: retry_of.map(str::to_string),
            created_at: now.clone(),
            updated_at: now,
            started_at: None,
            completed_at: None,
        })
    }
}

/// What a worker reports back after handling a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job_id: String,
    /// Queued or Running when shutdown stopped the job before it finished.
    pub status: JobStatus,
    pub message: Option<String>,
}

/// A file that ended up in no submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnassignedFile {
    pub file_name: String,
    pub source_path: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSubmission {
    pub submission_id: String,
    pub student_id: String,
    pub student_name: Option<String>,
    /// First file of the submission.
    pub file_name: Option<String>,
}

/// The job report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResult {
    pub job_id: String,
    pub status: JobStatus,
    pub upload_path: String,
    pub extract_path: String,
    pub total_files: u64,
    pub submissions_created: u64,
    pub violations_created: u64,
    pub images_extracted: u64,
    pub duplicate_files: u64,
    pub processed_files: u64,
    pub error_files: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_submissions: Vec<CreatedSubmission>,
    pub unassigned_files: Vec<UnassignedFile>,
}
