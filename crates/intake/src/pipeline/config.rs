use std::path::PathBuf;

use crate::config::schema::{NamingConfig, ViolationPolicyConfig};
use crate::config::Config;
use crate::unpacker::UnpackLimits;

pub struct PipelineConfig {
    pub upload_directory: PathBuf,
    pub extract_directory: PathBuf,
    pub limits: UnpackLimits,
    pub naming: NamingConfig,
    pub violations: ViolationPolicyConfig,
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            upload_directory: PathBuf::from(&config.upload_directory),
            extract_directory: PathBuf::from(&config.extract_directory),
            limits: UnpackLimits::from_config(&config.limits),
            naming: config.naming.clone(),
            violations: config.violations.clone(),
        }
    }
}
