use std::path::Path;

use crate::config::schema::{Config, NamingConfig, SessionSpec};
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.worker_count == 0 {
        return Err(ConfigError::Validation {
            message: "worker_count must be at least 1".to_string(),
        });
    }

    if config.limits.max_decompressed_bytes == 0 {
        return Err(ConfigError::Validation {
            message: "limits.max_decompressed_bytes must be positive".to_string(),
        });
    }

    validate_naming_pattern(&config.naming.pattern, &config.naming.capture)
}

/// Checks that a naming pattern compiles and carries the identity capture.
pub fn validate_naming_pattern(pattern: &str, capture: &str) -> Result<(), ConfigError> {
    let regex = regex::Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    if !regex.capture_names().flatten().any(|name| name == capture) {
        return Err(ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: format!(
                "Pattern must contain named capture group '?P<{}>' or '?<{}>'",
                capture, capture
            ),
        });
    }

    Ok(())
}

/// Validates per-upload options against the loaded naming config.
pub fn validate_session(session: &SessionSpec, naming: &NamingConfig) -> Result<(), ConfigError> {
    if session.exam_session_id.trim().is_empty() {
        return Err(ConfigError::Validation {
            message: "examSessionId must not be empty".to_string(),
        });
    }

    if let Some(pattern) = &session.naming_pattern {
        validate_naming_pattern(pattern, &naming.capture)?;
    }

    if let Some(required) = &session.required_files {
        for pattern in required {
            glob::Pattern::new(pattern).map_err(|e| ConfigError::InvalidManifest {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        }
    }

    Ok(())
}
