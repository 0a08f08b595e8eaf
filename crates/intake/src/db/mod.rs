//! SQLite persistence for jobs, submissions and their children.
//!
//! A single connection behind `Arc<Mutex<_>>`; every repository function
//! takes a `&Database` and runs inside `with_conn` or `with_transaction`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, Transaction};

pub mod error;
pub mod job_repo;
pub mod migrations;
pub mod submission_repo;

pub use error::DatabaseError;

/// Shared handle to the ingestion database. Clones share one connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens the database file, creating parent directories, and brings
    /// the schema up to date.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let db = Self::prepare(conn)?;
        log::info!("Database ready at {}", path.display());
        Ok(db)
    }

    /// Fresh in-memory database with the full schema.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self, DatabaseError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        migrations::run_all(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Provides locked access to the underlying connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&conn)
    }

    /// Runs `f` inside a transaction. Commits when `f` returns `Ok`; any
    /// error drops the transaction, which rolls it back.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, DatabaseError>,
    {
        let mut conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

/// Returns the canonical database path: `~/.intake/data/intake.db`.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".intake").join("data").join("intake.db"))
}

/// Current time as stored in every timestamp column.
pub(crate) fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migration_count(db: &Database) -> u32 {
        db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))?)
        })
        .unwrap()
    }

    #[test]
    fn test_open_in_memory_applies_schema() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(migration_count(&db), 3);
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("intake.db");
        let db = Database::open(&path).unwrap();
        assert_eq!(migration_count(&db), 3);
        assert!(path.exists());

        drop(db);
        let reopened = Database::open(&path).unwrap();
        assert_eq!(migration_count(&reopened), 3);
    }

    #[test]
    fn test_default_database_path() {
        let path = default_database_path().unwrap();
        assert!(path.ends_with(".intake/data/intake.db"));
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<(), DatabaseError> = db.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO submissions (id, exam_session_id, exam_id, student_id,
                 submitted_at, created_by_job, created_at, updated_at)
                 VALUES ('s1', 'sess', 'exam', 'S001', 't', 'job', 't', 't')",
                [],
            )?;
            Err(DatabaseError::LockPoisoned)
        });
        assert!(result.is_err());

        let count: u32 = db
            .clone()
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM submissions", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }
}
