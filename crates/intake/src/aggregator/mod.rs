//! Groups classified files by student and upserts one Submission each.

pub mod draft;

use rusqlite::Connection;

use crate::db::submission_repo::{self, NewFile, NewViolation, SubmissionKey, SubmissionRow};
use crate::db::{Database, DatabaseError};
use crate::identity::Confidence;
use crate::violations::ViolationDraft;

pub use draft::{detect_image, DraftFile, DuplicateCopy, ImageMeta, SubmissionDraft, UnreadableRef};

fn confidence_str(confidence: Confidence) -> &'static str {
    match confidence {
        Confidence::Exact => "exact",
        Confidence::Partial => "partial",
        Confidence::Ancestor => "ancestor",
        Confidence::Unresolved => "unresolved",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedFile {
    /// Row id when the file was new to the submission.
    pub file_id: Option<String>,
    pub image_created: bool,
}

impl AppliedFile {
    pub fn inserted(&self) -> bool {
        self.file_id.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct AppliedSubmission {
    pub submission: SubmissionRow,
    /// True when this call created the submission.
    pub created: bool,
    pub files_inserted: usize,
    pub images_created: usize,
    pub violations_inserted: usize,
}

/// Persists drafts. Every call runs in a single transaction, so a
/// submission is either fully updated or untouched.
#[derive(Clone)]
pub struct SubmissionAggregator {
    db: Database,
}

impl SubmissionAggregator {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Adds one file to the student's submission, creating it if needed.
    pub fn apply(
        &self,
        key: &SubmissionKey,
        student_name: Option<&str>,
        job_id: &str,
        file: &DraftFile,
    ) -> Result<AppliedFile, DatabaseError> {
        self.db.with_transaction(|tx| {
            let (submission, _) = submission_repo::ensure_submission(tx, key, student_name, job_id)?;
            let applied = insert_file(tx, &submission.id, job_id, file)?;
            submission_repo::refresh_aggregate(tx, &submission.id, None)?;
            Ok(applied)
        })
    }

    /// Applies a whole draft with its evaluated violations.
    pub fn apply_draft(
        &self,
        key: &SubmissionKey,
        student_name: Option<&str>,
        job_id: &str,
        draft: &SubmissionDraft,
        violations: &[ViolationDraft],
    ) -> Result<AppliedSubmission, DatabaseError> {
        self.db.with_transaction(|tx| {
            let (submission, created) =
                submission_repo::ensure_submission(tx, key, student_name, job_id)?;

            let mut files_inserted = 0;
            let mut images_created = 0;
            for file in &draft.files {
                let applied = insert_file(tx, &submission.id, job_id, file)?;
                if applied.inserted() {
                    files_inserted += 1;
                }
                if applied.image_created {
                    images_created += 1;
                }
            }

            let mut violations_inserted = 0;
            for violation in violations {
                let inserted = submission_repo::insert_violation(
                    tx,
                    &NewViolation {
                        submission_id: &submission.id,
                        job_id,
                        kind: violation.kind.as_str(),
                        subject: &violation.subject,
                        description: &violation.description,
                        severity: violation.severity.as_str(),
                    },
                )?;
                if inserted {
                    violations_inserted += 1;
                }
            }

            let notes = processing_notes(job_id, draft, files_inserted, violations);
            let submission = submission_repo::refresh_aggregate(tx, &submission.id, Some(&notes))?;

            log::debug!(
                "Applied {} for job {}: {} new file(s), {} new violation(s), status {}",
                draft.student_id,
                job_id,
                files_inserted,
                violations_inserted,
                submission.status
            );

            Ok(AppliedSubmission {
                submission,
                created,
                files_inserted,
                images_created,
                violations_inserted,
            })
        })
    }
}

fn insert_file(
    conn: &Connection,
    submission_id: &str,
    job_id: &str,
    file: &DraftFile,
) -> Result<AppliedFile, DatabaseError> {
    let file_path = file.stored_path.to_string_lossy();
    let file_id = submission_repo::insert_file(
        conn,
        &NewFile {
            submission_id,
            job_id,
            file_name: &file.name,
            file_path: &file_path,
            source_path: &file.source_path,
            file_size: file.size,
            fingerprint: file.fingerprint.as_str(),
            mime_type: file.mime_type.as_deref(),
            confidence: confidence_str(file.confidence),
        },
    )?;

    let image_created = match (&file_id, &file.image) {
        (Some(id), Some(image)) => submission_repo::insert_image(
            conn,
            submission_id,
            id,
            job_id,
            &image.mime_type,
            (image.width, image.height),
        )?,
        _ => false,
    };

    Ok(AppliedFile {
        file_id,
        image_created,
    })
}

fn processing_notes(
    job_id: &str,
    draft: &SubmissionDraft,
    files_inserted: usize,
    violations: &[ViolationDraft],
) -> String {
    let mut notes = format!(
        "Job {}: {} file(s) received, {} new",
        job_id,
        draft.files.len(),
        files_inserted
    );
    if !draft.duplicate_copies.is_empty() {
        notes.push_str(&format!(
            ", {} duplicate cop{} skipped",
            draft.duplicate_copies.len(),
            if draft.duplicate_copies.len() == 1 { "y" } else { "ies" }
        ));
    }
    if !draft.unreadable.is_empty() {
        notes.push_str(&format!(", {} unreadable", draft.unreadable.len()));
    }
    if !violations.is_empty() {
        notes.push_str(&format!(", {} violation(s)", violations.len()));
    }
    notes
}
