pub mod aggregator;
pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod identity;
pub mod model;
pub mod pipeline;
pub mod sanitize;
pub mod storage;
pub mod unpacker;
pub mod violations;
pub mod worker;

pub use config::{load_config, load_config_from_str, Config, SessionSpec};
pub use db::{Database, DatabaseError};
pub use error::{ConfigError, IntakeError, Result, StorageError, UnpackError, WorkerError};
pub use model::{JobStatus, Severity, SubmissionStatus, ViolationType};
pub use pipeline::{IngestionPipeline, JobProgressEvent, PipelineConfig, PipelineError};
pub use worker::{CreatedSubmission, Orchestrator, ProcessingResult, UnassignedFile};
