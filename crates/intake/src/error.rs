use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Unpack error: {0}")]
    Unpack(#[from] UnpackError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] crate::pipeline::PipelineError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Job not found: {0}")]
    JobNotFound(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid naming pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid required-file pattern '{pattern}': {reason}")]
    InvalidManifest { pattern: String, reason: String },
}

/// Errors that stop an unpacker walk before it yields anything.
///
/// Problems with individual members are reported as
/// [`crate::unpacker::FailedEntry`] items instead.
#[derive(Error, Debug)]
pub enum UnpackError {
    #[error("Failed to open archive '{path}': {source}")]
    OpenArchive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive '{path}' is not a readable container: {reason}")]
    NotAContainer { path: PathBuf, reason: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid file name: {0}")]
    InvalidName(String),

    #[error("No free file name left for '{0}'")]
    NameExhausted(PathBuf),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Job {job_id} cannot be retried while it is {status}")]
    NotRetryable { job_id: String, status: String },
}

pub type Result<T> = std::result::Result<T, IntakeError>;
