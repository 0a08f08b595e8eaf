//! Submission repository: the submission aggregate and its child rows.
//!
//! Write functions take a plain `&Connection` so the aggregator can run
//! them inside one transaction per student. Every insert is idempotent on
//! the table's natural key.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{now, Database, DatabaseError};

/// Identifies the submission a student's files belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionKey {
    pub exam_session_id: String,
    pub exam_id: String,
    pub student_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRow {
    pub id: String,
    pub exam_session_id: String,
    pub exam_id: String,
    pub student_id: String,
    pub student_name: Option<String>,
    pub status: String,
    pub submitted_at: String,
    pub processed_at: Option<String>,
    pub processing_notes: Option<String>,
    pub total_files: i64,
    pub total_size_bytes: i64,
    pub created_by_job: String,
    pub created_at: String,
    pub updated_at: String,
}

impl SubmissionRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            exam_session_id: row.get("exam_session_id")?,
            exam_id: row.get("exam_id")?,
            student_id: row.get("student_id")?,
            student_name: row.get("student_name")?,
            status: row.get("status")?,
            submitted_at: row.get("submitted_at")?,
            processed_at: row.get("processed_at")?,
            processing_notes: row.get("processing_notes")?,
            total_files: row.get("total_files")?,
            total_size_bytes: row.get("total_size_bytes")?,
            created_by_job: row.get("created_by_job")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionFileRow {
    pub id: String,
    pub submission_id: String,
    pub job_id: String,
    pub file_name: String,
    pub file_path: String,
    pub source_path: String,
    pub file_size: i64,
    pub fingerprint: String,
    pub mime_type: Option<String>,
    pub confidence: String,
    pub created_at: String,
}

impl SubmissionFileRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            submission_id: row.get("submission_id")?,
            job_id: row.get("job_id")?,
            file_name: row.get("file_name")?,
            file_path: row.get("file_path")?,
            source_path: row.get("source_path")?,
            file_size: row.get("file_size")?,
            fingerprint: row.get("fingerprint")?,
            mime_type: row.get("mime_type")?,
            confidence: row.get("confidence")?,
            created_at: row.get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationRow {
    pub id: String,
    pub submission_id: String,
    pub job_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub subject: String,
    pub description: String,
    pub severity: String,
    pub is_resolved: bool,
    pub created_at: String,
}

impl ViolationRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            submission_id: row.get("submission_id")?,
            job_id: row.get("job_id")?,
            kind: row.get("type")?,
            subject: row.get("subject")?,
            description: row.get("description")?,
            severity: row.get("severity")?,
            is_resolved: row.get("is_resolved")?,
            created_at: row.get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionImageRow {
    pub id: String,
    pub submission_id: String,
    pub submission_file_id: String,
    pub job_id: String,
    pub mime_type: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// A file row to insert.
#[derive(Debug, Clone)]
pub struct NewFile<'a> {
    pub submission_id: &'a str,
    pub job_id: &'a str,
    pub file_name: &'a str,
    pub file_path: &'a str,
    pub source_path: &'a str,
    pub file_size: u64,
    pub fingerprint: &'a str,
    pub mime_type: Option<&'a str>,
    pub confidence: &'a str,
}

/// A violation row to insert.
#[derive(Debug, Clone)]
pub struct NewViolation<'a> {
    pub submission_id: &'a str,
    pub job_id: &'a str,
    pub kind: &'a str,
    pub subject: &'a str,
    pub description: &'a str,
    pub severity: &'a str,
}

/// Rows committed by one job.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JobTotals {
    pub submissions_created: u64,
    pub violations_created: u64,
    pub images_extracted: u64,
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Finds or creates the submission for `key`. Returns the row and whether
/// this call created it.
pub fn ensure_submission(
    conn: &Connection,
    key: &SubmissionKey,
    student_name: Option<&str>,
    job_id: &str,
) -> Result<(SubmissionRow, bool), DatabaseError> {
    let ts = now();
    let inserted = conn.execute(
        "INSERT INTO submissions (id, exam_session_id, exam_id, student_id, student_name,
         status, submitted_at, created_by_job, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?6, ?6)
         ON CONFLICT(exam_session_id, student_id) DO NOTHING",
        params![
            new_id(),
            key.exam_session_id,
            key.exam_id,
            key.student_id,
            student_name,
            ts,
            job_id,
        ],
    )?;

    let row = conn.query_row(
        "SELECT * FROM submissions WHERE exam_session_id = ?1 AND student_id = ?2",
        params![key.exam_session_id, key.student_id],
        SubmissionRow::from_row,
    )?;

    if inserted == 0 && row.student_name.is_none() && student_name.is_some() {
        conn.execute(
            "UPDATE submissions SET student_name = ?2 WHERE id = ?1",
            params![row.id, student_name],
        )?;
    }

    Ok((row, inserted == 1))
}

/// Inserts a file unless the submission already holds the same content.
/// Returns the new row id, or `None` when the fingerprint was present.
pub fn insert_file(conn: &Connection, file: &NewFile<'_>) -> Result<Option<String>, DatabaseError> {
    let id = new_id();
    let inserted = conn.execute(
        "INSERT INTO submission_files (id, submission_id, job_id, file_name, file_path,
         source_path, file_size, fingerprint, mime_type, confidence, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(submission_id, fingerprint) DO NOTHING",
        params![
            id,
            file.submission_id,
            file.job_id,
            file.file_name,
            file.file_path,
            file.source_path,
            file.file_size as i64,
            file.fingerprint,
            file.mime_type,
            file.confidence,
            now(),
        ],
    )?;
    Ok((inserted == 1).then_some(id))
}

pub fn insert_image(
    conn: &Connection,
    submission_id: &str,
    submission_file_id: &str,
    job_id: &str,
    mime_type: &str,
    dimensions: (Option<u32>, Option<u32>),
) -> Result<bool, DatabaseError> {
    let inserted = conn.execute(
        "INSERT INTO submission_images (id, submission_id, submission_file_id, job_id,
         mime_type, width, height, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(submission_file_id) DO NOTHING",
        params![
            new_id(),
            submission_id,
            submission_file_id,
            job_id,
            mime_type,
            dimensions.0,
            dimensions.1,
            now(),
        ],
    )?;
    Ok(inserted == 1)
}

/// Records a violation unless the same (type, subject) is already on file.
pub fn insert_violation(conn: &Connection, v: &NewViolation<'_>) -> Result<bool, DatabaseError> {
    let inserted = conn.execute(
        "INSERT INTO violations (id, submission_id, job_id, type, subject, description,
         severity, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(submission_id, type, subject) DO NOTHING",
        params![
            new_id(),
            v.submission_id,
            v.job_id,
            v.kind,
            v.subject,
            v.description,
            v.severity,
            now(),
        ],
    )?;
    Ok(inserted == 1)
}

/// Recomputes totals from the file rows, re-derives the status from
/// unresolved violations and stamps the processing time.
pub fn refresh_aggregate(
    conn: &Connection,
    submission_id: &str,
    notes: Option<&str>,
) -> Result<SubmissionRow, DatabaseError> {
    let ts = now();
    conn.execute(
        "UPDATE submissions SET
           total_files = (SELECT COUNT(*) FROM submission_files WHERE submission_id = ?1),
           total_size_bytes = (SELECT COALESCE(SUM(file_size), 0) FROM submission_files
                               WHERE submission_id = ?1),
           status = CASE
             WHEN status = 'graded' THEN status
             WHEN EXISTS (SELECT 1 FROM violations WHERE submission_id = ?1
                          AND is_resolved = 0 AND severity IN ('flag', 'critical'))
               THEN 'flagged'
             ELSE status
           END,
           processing_notes = COALESCE(?2, processing_notes),
           processed_at = ?3,
           updated_at = ?3
         WHERE id = ?1",
        params![submission_id, notes, ts],
    )?;

    let row = conn.query_row(
        "SELECT * FROM submissions WHERE id = ?1",
        params![submission_id],
        SubmissionRow::from_row,
    )?;
    Ok(row)
}

pub fn find_by_student(
    db: &Database,
    exam_session_id: &str,
    student_id: &str,
) -> Result<Option<SubmissionRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM submissions WHERE exam_session_id = ?1 AND student_id = ?2",
                params![exam_session_id, student_id],
                SubmissionRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

pub fn list_for_session(
    db: &Database,
    exam_session_id: &str,
) -> Result<Vec<SubmissionRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM submissions WHERE exam_session_id = ?1 ORDER BY student_id",
        )?;
        let rows = stmt
            .query_map(params![exam_session_id], SubmissionRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Files of a submission in insertion order.
pub fn list_files(
    db: &Database,
    submission_id: &str,
) -> Result<Vec<SubmissionFileRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM submission_files WHERE submission_id = ?1 ORDER BY created_at, rowid",
        )?;
        let rows = stmt
            .query_map(params![submission_id], SubmissionFileRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn list_violations(
    db: &Database,
    submission_id: &str,
) -> Result<Vec<ViolationRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM violations WHERE submission_id = ?1 ORDER BY created_at, rowid",
        )?;
        let rows = stmt
            .query_map(params![submission_id], ViolationRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn list_images(
    db: &Database,
    submission_id: &str,
) -> Result<Vec<SubmissionImageRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, submission_id, submission_file_id, job_id, mime_type, width, height
             FROM submission_images WHERE submission_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map(params![submission_id], |row| {
                Ok(SubmissionImageRow {
                    id: row.get(0)?,
                    submission_id: row.get(1)?,
                    submission_file_id: row.get(2)?,
                    job_id: row.get(3)?,
                    mime_type: row.get(4)?,
                    width: row.get(5)?,
                    height: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Submissions created by a job, each with the name of its first file.
pub fn list_created_by_job(
    db: &Database,
    job_id: &str,
) -> Result<Vec<(SubmissionRow, Option<String>)>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT s.*, (SELECT f.file_name FROM submission_files f
                          WHERE f.submission_id = s.id
                          ORDER BY f.created_at, f.rowid LIMIT 1) AS first_file
             FROM submissions s WHERE s.created_by_job = ?1 ORDER BY s.student_id",
        )?;
        let rows = stmt
            .query_map(params![job_id], |row| {
                Ok((SubmissionRow::from_row(row)?, row.get("first_file")?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Counts committed rows tagged with `job_id`.
pub fn job_totals(db: &Database, job_id: &str) -> Result<JobTotals, DatabaseError> {
    db.with_conn(|conn| {
        let count = |sql: &str| -> Result<u64, DatabaseError> {
            Ok(conn.query_row(sql, params![job_id], |r| r.get(0))?)
        };
        Ok(JobTotals {
            submissions_created: count(
                "SELECT COUNT(*) FROM submissions WHERE created_by_job = ?1",
            )?,
            violations_created: count("SELECT COUNT(*) FROM violations WHERE job_id = ?1")?,
            images_extracted: count("SELECT COUNT(*) FROM submission_images WHERE job_id = ?1")?,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(student: &str) -> SubmissionKey {
        SubmissionKey {
            exam_session_id: "sess-1".to_string(),
            exam_id: "exam-1".to_string(),
            student_id: student.to_string(),
        }
    }

    fn file<'a>(submission_id: &'a str, name: &'a str, fingerprint: &'a str) -> NewFile<'a> {
        NewFile {
            submission_id,
            job_id: "job-1",
            file_name: name,
            file_path: name,
            source_path: name,
            file_size: 10,
            fingerprint,
            mime_type: None,
            confidence: "exact",
        }
    }

    #[test]
    fn test_ensure_submission_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let (first, created) = db
            .with_transaction(|tx| ensure_submission(tx, &key("S001"), Some("Ada"), "job-1"))
            .unwrap();
        assert!(created);
        assert_eq!(first.status, "pending");
        assert_eq!(first.student_name.as_deref(), Some("Ada"));

        let (second, created) = db
            .with_transaction(|tx| ensure_submission(tx, &key("S001"), None, "job-2"))
            .unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.created_by_job, "job-1");
    }

    #[test]
    fn test_duplicate_fingerprint_is_ignored_and_totals_recomputed() {
        let db = Database::open_in_memory().unwrap();
        let row = db
            .with_transaction(|tx| {
                let (sub, _) = ensure_submission(tx, &key("S001"), None, "job-1")?;
                assert!(insert_file(tx, &file(&sub.id, "a.txt", "aa"))?.is_some());
                assert!(insert_file(tx, &file(&sub.id, "b.txt", "bb"))?.is_some());
                assert!(insert_file(tx, &file(&sub.id, "a-again.txt", "aa"))?.is_none());
                refresh_aggregate(tx, &sub.id, Some("2 files"))
            })
            .unwrap();

        assert_eq!(row.total_files, 2);
        assert_eq!(row.total_size_bytes, 20);
        assert_eq!(row.processing_notes.as_deref(), Some("2 files"));
        assert!(row.processed_at.is_some());

        let files = list_files(&db, &row.id).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn test_flag_violation_flags_submission_but_not_graded() {
        let db = Database::open_in_memory().unwrap();
        let sub_id = db
            .with_transaction(|tx| {
                let (sub, _) = ensure_submission(tx, &key("S001"), None, "job-1")?;
                insert_file(tx, &file(&sub.id, "a.txt", "aa"))?;
                let v = NewViolation {
                    submission_id: &sub.id,
                    job_id: "job-1",
                    kind: "missing_required_file",
                    subject: "*.pdf",
                    description: "no pdf",
                    severity: "flag",
                };
                assert!(insert_violation(tx, &v)?);
                assert!(!insert_violation(tx, &v)?);
                let row = refresh_aggregate(tx, &sub.id, None)?;
                assert_eq!(row.status, "flagged");
                Ok(sub.id)
            })
            .unwrap();

        db.with_conn(|conn| {
            conn.execute(
                "UPDATE submissions SET status = 'graded' WHERE id = ?1",
                params![sub_id],
            )?;
            let row = refresh_aggregate(conn, &sub_id, None)?;
            assert_eq!(row.status, "graded");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_warning_only_stays_pending() {
        let db = Database::open_in_memory().unwrap();
        let row = db
            .with_transaction(|tx| {
                let (sub, _) = ensure_submission(tx, &key("S002"), None, "job-1")?;
                insert_violation(
                    tx,
                    &NewViolation {
                        submission_id: &sub.id,
                        job_id: "job-1",
                        kind: "duplicate_content",
                        subject: "ff",
                        description: "dup",
                        severity: "warning",
                    },
                )?;
                refresh_aggregate(tx, &sub.id, None)
            })
            .unwrap();
        assert_eq!(row.status, "pending");
    }

    #[test]
    fn test_job_totals_and_created_listing() {
        let db = Database::open_in_memory().unwrap();
        db.with_transaction(|tx| {
            let (sub, _) = ensure_submission(tx, &key("S001"), None, "job-1")?;
            let file_id = insert_file(tx, &file(&sub.id, "S001_scan.png", "aa"))?;
            insert_file(tx, &file(&sub.id, "S001_report.pdf", "bb"))?;
            if let Some(file_id) = file_id {
                insert_image(tx, &sub.id, &file_id, "job-1", "image/png", (Some(3), Some(2)))?;
            }
            ensure_submission(tx, &key("S002"), None, "job-2")?;
            Ok(())
        })
        .unwrap();

        let totals = job_totals(&db, "job-1").unwrap();
        assert_eq!(totals.submissions_created, 1);
        assert_eq!(totals.images_extracted, 1);
        assert_eq!(totals.violations_created, 0);

        let created = list_created_by_job(&db, "job-1").unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0.student_id, "S001");
        assert_eq!(created[0].1.as_deref(), Some("S001_scan.png"));

        let sub = find_by_student(&db, "sess-1", "S001").unwrap().unwrap();
        let images = list_images(&db, &sub.id).unwrap();
        assert_eq!(images[0].width, Some(3));
        assert_eq!(list_for_session(&db, "sess-1").unwrap().len(), 2);
    }
}
