pub mod detector;

use serde::Serialize;

use crate::dedup::Fingerprint;
use crate::model::{Severity, ViolationType};

pub use detector::ViolationDetector;

/// A violation before it is attached to a persisted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationDraft {
    pub kind: ViolationType,
    pub severity: Severity,
    /// What the violation is about: a file, a pattern or a fingerprint.
    pub subject: String,
    pub description: String,
}

impl ViolationDraft {
    /// Ties a per-file violation to one file: its source path plus a
    /// content prefix. Same-named files in different folders, and a later
    /// upload of new content under the same path, each get their own row.
    pub fn for_file(mut self, source_path: &str, fingerprint: &Fingerprint) -> Self {
        self.subject = format!("{} [{}]", source_path, fingerprint.short());
        self
    }
}

/// True when any violation should put the submission under review.
pub fn flags_submission(violations: &[ViolationDraft]) -> bool {
    violations.iter().any(|v| v.severity.flags_submission())
}
