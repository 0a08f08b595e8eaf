pub mod loader;
pub mod schema;

pub use loader::{
    load_config, load_config_from_str, validate_naming_pattern, validate_session,
};
pub use schema::{
    Config, LimitsConfig, NamingConfig, SessionSpec, ViolationPolicyConfig,
    DEFAULT_NAMING_PATTERN,
};
