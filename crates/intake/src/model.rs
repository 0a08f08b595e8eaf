//! Domain enums shared by the pipeline, the store and the job report.
//!
//! Every enum round-trips through a lowercase string column in the
//! database; unknown values are logged and mapped to a safe default.

use serde::{Deserialize, Serialize};

/// Lifecycle of an ingestion job: Queued → Running → {Completed, Failed}.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str, job_id: &str) -> Self {
        match s {
            "queued" => JobStatus::Queued,
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            other => {
                log::warn!(
                    "Unknown job status '{}' for job {}, defaulting to Failed",
                    other,
                    job_id
                );
                JobStatus::Failed
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Processing,
    Graded,
    Flagged,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Processing => "processing",
            SubmissionStatus::Graded => "graded",
            SubmissionStatus::Flagged => "flagged",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => SubmissionStatus::Processing,
            "graded" => SubmissionStatus::Graded,
            "flagged" => SubmissionStatus::Flagged,
            "pending" => SubmissionStatus::Pending,
            other => {
                log::warn!("Unknown submission status '{}', defaulting to Pending", other);
                SubmissionStatus::Pending
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    NamingMismatch,
    DuplicateContent,
    UnreadableFile,
    MissingRequiredFile,
}

impl ViolationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationType::NamingMismatch => "naming_mismatch",
            ViolationType::DuplicateContent => "duplicate_content",
            ViolationType::UnreadableFile => "unreadable_file",
            ViolationType::MissingRequiredFile => "missing_required_file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "naming_mismatch" => Some(ViolationType::NamingMismatch),
            "duplicate_content" => Some(ViolationType::DuplicateContent),
            "unreadable_file" => Some(ViolationType::UnreadableFile),
            "missing_required_file" => Some(ViolationType::MissingRequiredFile),
            _ => None,
        }
    }
}

/// Ordered from least to most serious.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Flag,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Flag => "flag",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "flag" => Severity::Flag,
            "critical" => Severity::Critical,
            _ => Severity::Warning,
        }
    }

    /// Flag and Critical put the owning submission under review.
    pub fn flags_submission(&self) -> bool {
        *self >= Severity::Flag
    }
}
