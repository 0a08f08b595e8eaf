use thiserror::Error;

/// Errors that end a job. Problems with single entries never get here.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid session options: {0}")]
    Session(#[from] crate::error::ConfigError),

    #[error("Archive could not be opened: {0}")]
    Unpack(#[from] crate::error::UnpackError),

    #[error("Writing extracted files failed: {0}")]
    Storage(#[from] crate::error::StorageError),

    #[error("Store failed: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Timed out after {waited_secs}s waiting for exam session '{exam_session_id}'")]
    LockTimeout {
        exam_session_id: String,
        waited_secs: u64,
    },

    #[error("Cancelled")]
    Cancelled,

    /// The pool is shutting down; the job stays Running and is resumed later.
    #[error("Interrupted by shutdown")]
    Interrupted,
}
