//! Builder patterns for creating test data programmatically.

#![allow(dead_code)]

use intake::config::{Config, LimitsConfig, NamingConfig, SessionSpec, ViolationPolicyConfig};

/// Builder for creating `Config` instances.
pub struct ConfigBuilder {
    version: String,
    upload_directory: String,
    extract_directory: String,
    database_path: Option<String>,
    worker_count: usize,
    session_lock_timeout_secs: u64,
    naming: NamingConfig,
    limits: LimitsConfig,
    violations: ViolationPolicyConfig,
}

impl ConfigBuilder {
    /// Create a new builder with sensible defaults for testing.
    pub fn new() -> Self {
        Self {
            version: "1.0".to_string(),
            upload_directory: "/tmp/intake/uploads".to_string(),
            extract_directory: "/tmp/intake/extracted".to_string(),
            database_path: None,
            worker_count: 2,
            session_lock_timeout_secs: 30,
            naming: NamingConfig::default(),
            limits: LimitsConfig::default(),
            violations: ViolationPolicyConfig::default(),
        }
    }

    pub fn upload_directory(mut self, path: &str) -> Self {
        self.upload_directory = path.to_string();
        self
    }

    pub fn extract_directory(mut self, path: &str) -> Self {
        self.extract_directory = path.to_string();
        self
    }

    pub fn database_path(mut self, path: &str) -> Self {
        self.database_path = Some(path.to_string());
        self
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn session_lock_timeout_secs(mut self, secs: u64) -> Self {
        self.session_lock_timeout_secs = secs;
        self
    }

    pub fn naming_pattern(mut self, pattern: &str) -> Self {
        self.naming.pattern = pattern.to_string();
        self
    }

    pub fn partial_matching(mut self, enabled: bool) -> Self {
        self.naming.partial_matching = enabled;
        self
    }

    pub fn ancestor_before_partial(mut self, enabled: bool) -> Self {
        self.naming.ancestor_before_partial = enabled;
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.limits.max_depth = depth;
        self
    }

    pub fn max_decompressed_bytes(mut self, bytes: u64) -> Self {
        self.limits.max_decompressed_bytes = bytes;
        self
    }

    pub fn duplicate_escalation_threshold(mut self, threshold: usize) -> Self {
        self.violations.duplicate_escalation_threshold = Some(threshold);
        self
    }

    pub fn build(self) -> Config {
        Config {
            version: self.version,
            upload_directory: self.upload_directory,
            extract_directory: self.extract_directory,
            database_path: self.database_path,
            worker_count: self.worker_count,
            session_lock_timeout_secs: self.session_lock_timeout_secs,
            naming: self.naming,
            limits: self.limits,
            violations: self.violations,
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The session most tests ingest into.
pub fn session() -> SessionSpec {
    SessionSpec::new("sess-42", "exam-7")
}
