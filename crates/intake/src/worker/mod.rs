pub mod job;
pub mod orchestrator;
pub mod pool;
pub mod session_lock;

pub use job::{CreatedSubmission, IngestJob, JobOutcome, ProcessingResult, UnassignedFile};
pub use orchestrator::Orchestrator;
pub use pool::{ControlRegistry, WorkerPool};
pub use session_lock::{LockWait, SessionGuard, SessionLocks};

// Re-export crossbeam_channel for use in main
pub use crossbeam_channel;
