use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    pub upload_directory: String,
    pub extract_directory: String,
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_lock_timeout")]
    pub session_lock_timeout_secs: u64,
    #[serde(default)]
    pub naming: NamingConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub violations: ViolationPolicyConfig,
}

impl Config {
    /// Database location: the configured path, or `~/.intake/data/intake.db`.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database_path
            .as_ref()
            .map(PathBuf::from)
            .or_else(crate::db::default_database_path)
    }
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_lock_timeout() -> u64 {
    600
}

/// The assignment naming rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamingConfig {
    /// Regex with a named capture holding the student identity.
    #[serde(default = "default_pattern")]
    pub pattern: String,
    /// Name of the capture group holding the student identity.
    #[serde(default = "default_capture")]
    pub capture: String,
    /// Allow case/whitespace-insensitive matches (filed with a warning).
    #[serde(default = "default_true")]
    pub partial_matching: bool,
    /// Try ancestor container names before partial leaf matches.
    #[serde(default)]
    pub ancestor_before_partial: bool,
}

pub const DEFAULT_NAMING_PATTERN: &str = r"^(?P<student_id>S\d{3,})(?:[_\-.].*)?$";

fn default_pattern() -> String {
    DEFAULT_NAMING_PATTERN.to_string()
}

fn default_capture() -> String {
    "student_id".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            pattern: default_pattern(),
            capture: default_capture(),
            partial_matching: true,
            ancestor_before_partial: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of nested container levels below the uploaded archive.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Cumulative decompressed byte budget for one walk.
    #[serde(default = "default_max_bytes")]
    pub max_decompressed_bytes: u64,
    /// File extensions treated as nested containers.
    #[serde(default = "default_container_extensions")]
    pub container_extensions: Vec<String>,
}

fn default_max_depth() -> usize {
    4
}

fn default_max_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_container_extensions() -> Vec<String> {
    vec!["zip".to_string()]
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_decompressed_bytes: default_max_bytes(),
            container_extensions: default_container_extensions(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViolationPolicyConfig {
    /// Occurrences of the same content (original plus copies) at which
    /// DuplicateContent becomes a Flag instead of a Warning.
    #[serde(default)]
    pub duplicate_escalation_threshold: Option<usize>,
}

/// Per-upload options. Persisted with the job so a resumed run sees the
/// same session the original submission did.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSpec {
    pub exam_session_id: String,
    pub exam_id: String,
    /// Overrides the configured naming pattern for this assignment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub naming_pattern: Option<String>,
    /// Glob patterns every student is expected to submit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_files: Option<Vec<String>>,
    /// Student id → display name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub roster: HashMap<String, String>,
}

impl SessionSpec {
    pub fn new(exam_session_id: impl Into<String>, exam_id: impl Into<String>) -> Self {
        Self {
            exam_session_id: exam_session_id.into(),
            exam_id: exam_id.into(),
            ..Default::default()
        }
    }

    pub fn with_required_files(mut self, patterns: Vec<String>) -> Self {
        self.required_files = Some(patterns);
        self
    }

    pub fn with_naming_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.naming_pattern = Some(pattern.into());
        self
    }

    pub fn student_name(&self, student_id: &str) -> Option<&str> {
        self.roster.get(student_id).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_spec_serializes_camel_case_and_skips_empty() {
        let spec = SessionSpec::new("sess-1", "exam-9");
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("examSessionId"));
        assert!(!json.contains("roster"));
        assert!(!json.contains("requiredFiles"));

        let back: SessionSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_default_naming_pattern_compiles() {
        let re = regex::Regex::new(DEFAULT_NAMING_PATTERN).unwrap();
        assert!(re.is_match("S001_report"));
        assert!(!re.is_match("session42"));
    }
}
