//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default Robot web service endpoint.
pub const DEFAULT_BASE_URL: &str = "https://robot-ws.your-server.de";

/// Default directory for persisted resource state.
pub const DEFAULT_STATE_DIR: &str = ".hrobot-state";

/// Robot account and local storage settings derived from environment
/// variables, configuration files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "HROBOT",
    discovery(
        app_name = "hrobot",
        env_var = "HROBOT_CONFIG_PATH",
        config_file_name = "hrobot.toml",
        dotfile_name = ".hrobot.toml",
        project_file_name = "hrobot.toml"
    )
)]
pub struct RobotConfig {
    /// Robot web service user.
    #[ortho_config(default = String::new())]
    pub username: String,
    /// Robot web service password.
    #[ortho_config(default = String::new())]
    pub password: String,
    /// API endpoint. Overridable for testing against a local double.
    #[ortho_config(default = DEFAULT_BASE_URL.to_owned())]
    pub base_url: String,
    /// HTTP request timeout in seconds.
    #[ortho_config(default = 30)]
    pub timeout_secs: u64,
    /// Directory for the transaction caches. Defaults to `.cache` under the
    /// working directory.
    pub cache_dir: Option<String>,
    /// Directory holding one JSON document per managed server.
    #[ortho_config(default = DEFAULT_STATE_DIR.to_owned())]
    pub state_dir: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl RobotConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to [robot] in hrobot.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("hrobot")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields. Error messages name
    /// the environment variable that supplies each missing value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a credential or the base URL
    /// is empty, or [`ConfigError::Invalid`] when the timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.username,
            &FieldMetadata::new("Robot web service user", "HROBOT_USERNAME", "username"),
        )?;
        Self::require_field(
            &self.password,
            &FieldMetadata::new(
                "Robot web service password",
                "HROBOT_PASSWORD",
                "password",
            ),
        )?;
        Self::require_field(
            &self.base_url,
            &FieldMetadata::new("Robot API base URL", "HROBOT_BASE_URL", "base_url"),
        )?;
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid(String::from(
                "timeout_secs must be greater than zero",
            )));
        }
        Ok(())
    }

    /// Returns the HTTP timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
