//! Job repository: lifecycle operations for the `jobs` table.
//!
//! Status transitions are guarded in SQL so a terminal job is never
//! modified again, whatever the caller does.

use rusqlite::{params, OptionalExtension, Row};

use super::{now, Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub exam_session_id: String,
    pub exam_id: String,
    /// JSON-encoded `SessionSpec`.
    pub session_spec: String,
    pub archive_name: String,
    pub upload_path: String,
    pub extract_path: String,
    pub status: String,
    pub total_files: i64,
    pub processed_files: i64,
    pub error_files: i64,
    pub duplicate_files: i64,
    /// JSON array of files no student could be found for.
    pub unassigned_files: Option<String>,
    pub message: Option<String>,
    pub retry_of: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            exam_session_id: row.get("exam_session_id")?,
            exam_id: row.get("exam_id")?,
            session_spec: row.get("session_spec")?,
            archive_name: row.get("archive_name")?,
            upload_path: row.get("upload_path")?,
            extract_path: row.get("extract_path")?,
            status: row.get("status")?,
            total_files: row.get("total_files")?,
            processed_files: row.get("processed_files")?,
            error_files: row.get("error_files")?,
            duplicate_files: row.get("duplicate_files")?,
            unassigned_files: row.get("unassigned_files")?,
            message: row.get("message")?,
            retry_of: row.get("retry_of")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

/// File counters of one pass over a job's archive.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FileCounts {
    pub total_files: u64,
    pub processed_files: u64,
    pub error_files: u64,
    pub duplicate_files: u64,
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<String>,
    pub exam_session_id: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts a new job row.
pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, exam_session_id, exam_id, session_spec, archive_name,
             upload_path, extract_path, status, total_files, processed_files, error_files,
             duplicate_files, unassigned_files, message, retry_of, created_at, updated_at,
             started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
             ?17, ?18, ?19)",
            params![
                job.id,
                job.exam_session_id,
                job.exam_id,
                job.session_spec,
                job.archive_name,
                job.upload_path,
                job.extract_path,
                job.status,
                job.total_files,
                job.processed_files,
                job.error_files,
                job.duplicate_files,
                job.unassigned_files,
                job.message,
                job.retry_of,
                job.created_at,
                job.updated_at,
                job.started_at,
                job.completed_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM jobs WHERE id = ?1",
                params![id],
                JobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Moves a Queued job (or a Running one left behind by a crash) to
/// Running. Returns false when the job is terminal or unknown.
pub fn claim(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let ts = now();
        let changed = conn.execute(
            "UPDATE jobs SET status = 'running', started_at = COALESCE(started_at, ?2),
             updated_at = ?2, message = NULL
             WHERE id = ?1 AND status IN ('queued', 'running')",
            params![id, ts],
        )?;
        Ok(changed == 1)
    })
}

/// Stores the counters of the current pass. Ignored once the job is terminal.
pub fn record_counts(
    db: &Database,
    id: &str,
    counts: &FileCounts,
    unassigned_json: Option<&str>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET total_files = ?2, processed_files = ?3, error_files = ?4,
             duplicate_files = ?5, unassigned_files = ?6, updated_at = ?7
             WHERE id = ?1 AND status = 'running'",
            params![
                id,
                counts.total_files as i64,
                counts.processed_files as i64,
                counts.error_files as i64,
                counts.duplicate_files as i64,
                unassigned_json,
                now(),
            ],
        )?;
        Ok(changed == 1)
    })
}

/// Moves a job to a terminal status. Only a Running job can finish, except
/// that a Queued job may be failed directly (cancelled before it started).
pub fn finish(
    db: &Database,
    id: &str,
    status: &str,
    message: Option<&str>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let ts = now();
        let changed = conn.execute(
            "UPDATE jobs SET status = ?2, message = ?3, updated_at = ?4, completed_at = ?4
             WHERE id = ?1 AND (status = 'running' OR (status = 'queued' AND ?2 = 'failed'))",
            params![id, status, message, ts],
        )?;
        Ok(changed == 1)
    })
}

/// Fails a job that no worker has claimed yet. Returns false once the job
/// is Running or terminal.
pub fn cancel_queued(db: &Database, id: &str, message: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let ts = now();
        let changed = conn.execute(
            "UPDATE jobs SET status = 'failed', message = ?2, updated_at = ?3, completed_at = ?3
             WHERE id = ?1 AND status = 'queued'",
            params![id, message, ts],
        )?;
        Ok(changed == 1)
    })
}

/// Jobs that never reached a terminal status, oldest first.
pub fn list_incomplete(db: &Database) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE status IN ('queued', 'running') ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Queries jobs with filters, returning (rows, total_count).
pub fn query(db: &Database, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status.clone()));
        }
        if let Some(ref session) = filter.exam_session_id {
            conditions.push(format!("exam_session_id = ?{}", param_values.len() + 1));
            param_values.push(Box::new(session.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM jobs {} ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<JobRow> = stmt
            .query_map(params_ref.as_slice(), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_job(id: &str) -> JobRow {
        JobRow {
            id: id.to_string(),
            exam_session_id: "sess-1".to_string(),
            exam_id: "exam-1".to_string(),
            session_spec: r#"{"examSessionId":"sess-1","examId":"exam-1"}"#.to_string(),
            archive_name: "session42.zip".to_string(),
            upload_path: "/tmp/uploads/session42.zip".to_string(),
            extract_path: format!("/tmp/extracted/{}", id),
            status: "queued".to_string(),
            total_files: 0,
            processed_files: 0,
            error_files: 0,
            duplicate_files: 0,
            unassigned_files: None,
            message: None,
            retry_of: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_db();
        insert(&db, &sample_job("job-1")).unwrap();

        let found = find_by_id(&db, "job-1").unwrap().unwrap();
        assert_eq!(found.archive_name, "session42.zip");
        assert_eq!(found.status, "queued");
        assert!(found.started_at.is_none());
    }

    #[test]
    fn test_find_nonexistent() {
        let db = test_db();
        assert!(find_by_id(&db, "nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_claim_queued_and_reclaim_running() {
        let db = test_db();
        insert(&db, &sample_job("c1")).unwrap();

        assert!(claim(&db, "c1").unwrap());
        let first = find_by_id(&db, "c1").unwrap().unwrap();
        assert_eq!(first.status, "running");
        assert!(first.started_at.is_some());

        // A crashed Running job can be claimed again.
        assert!(claim(&db, "c1").unwrap());
        let again = find_by_id(&db, "c1").unwrap().unwrap();
        assert_eq!(again.started_at, first.started_at);
    }

    #[test]
    fn test_terminal_job_is_immutable() {
        let db = test_db();
        insert(&db, &sample_job("t1")).unwrap();
        claim(&db, "t1").unwrap();
        assert!(finish(&db, "t1", "completed", None).unwrap());

        assert!(!claim(&db, "t1").unwrap());
        assert!(!finish(&db, "t1", "failed", Some("late")).unwrap());
        let counts = FileCounts {
            total_files: 9,
            ..Default::default()
        };
        assert!(!record_counts(&db, "t1", &counts, None).unwrap());

        let found = find_by_id(&db, "t1").unwrap().unwrap();
        assert_eq!(found.status, "completed");
        assert_eq!(found.total_files, 0);
        assert!(found.message.is_none());
        assert!(found.completed_at.is_some());
    }

    #[test]
    fn test_queued_job_cannot_complete_without_running() {
        let db = test_db();
        insert(&db, &sample_job("q1")).unwrap();
        assert!(!finish(&db, "q1", "completed", None).unwrap());
        assert!(finish(&db, "q1", "failed", Some("cancelled")).unwrap());
    }

    #[test]
    fn test_cancel_queued_only_touches_queued() {
        let db = test_db();
        insert(&db, &sample_job("x1")).unwrap();
        insert(&db, &sample_job("x2")).unwrap();
        claim(&db, "x2").unwrap();

        assert!(cancel_queued(&db, "x1", "Cancelled").unwrap());
        assert!(!cancel_queued(&db, "x2", "Cancelled").unwrap());

        let cancelled = find_by_id(&db, "x1").unwrap().unwrap();
        assert_eq!(cancelled.status, "failed");
        assert_eq!(cancelled.message.as_deref(), Some("Cancelled"));
        assert_eq!(find_by_id(&db, "x2").unwrap().unwrap().status, "running");
    }

    #[test]
    fn test_record_counts() {
        let db = test_db();
        insert(&db, &sample_job("r1")).unwrap();
        claim(&db, "r1").unwrap();

        let counts = FileCounts {
            total_files: 4,
            processed_files: 2,
            error_files: 1,
            duplicate_files: 1,
        };
        assert!(record_counts(&db, "r1", &counts, Some("[]")).unwrap());

        let found = find_by_id(&db, "r1").unwrap().unwrap();
        assert_eq!(found.total_files, 4);
        assert_eq!(found.processed_files, 2);
        assert_eq!(found.error_files, 1);
        assert_eq!(found.duplicate_files, 1);
        assert_eq!(found.unassigned_files.as_deref(), Some("[]"));
    }

    #[test]
    fn test_list_incomplete() {
        let db = test_db();
        insert(&db, &sample_job("i1")).unwrap();
        let mut second = sample_job("i2");
        second.created_at = "2026-01-02T00:00:00Z".to_string();
        insert(&db, &second).unwrap();
        let mut done = sample_job("i3");
        done.status = "completed".to_string();
        insert(&db, &done).unwrap();
        claim(&db, "i2").unwrap();

        let ids: Vec<String> = list_incomplete(&db)
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec!["i1", "i2"]);
    }

    #[test]
    fn test_query_with_filters() {
        let db = test_db();
        insert(&db, &sample_job("f1")).unwrap();
        let mut other = sample_job("f2");
        other.exam_session_id = "sess-2".to_string();
        insert(&db, &other).unwrap();

        let (rows, total) = query(
            &db,
            &JobFilter {
                exam_session_id: Some("sess-2".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].id, "f2");

        let (rows, total) = query(
            &db,
            &JobFilter {
                limit: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows.len(), 1);
    }
}
