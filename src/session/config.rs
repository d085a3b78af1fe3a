//! SSH transport settings loaded via `ortho-config`.
//!
//! Rescue and freshly imaged hosts have no prior trust anchor, so host key
//! checking is disabled and known hosts default to `/dev/null`. Password
//! authentication is always refused; sessions authenticate with keys held by
//! the local agent or an explicit identity file.

use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;

use super::SessionError;

/// Default transport timeout for connects and individual remote commands.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 180;

/// SSH settings used when opening remote sessions.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "HROBOT_SSH",
    discovery(
        app_name = "hrobot",
        env_var = "HROBOT_CONFIG_PATH",
        config_file_name = "hrobot.toml",
        dotfile_name = ".hrobot.toml",
        project_file_name = "hrobot.toml"
    )
)]
pub struct SessionConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Remote user; rescue and installed systems both use `root`.
    #[ortho_config(default = "root".to_owned())]
    pub user: String,
    /// TCP port for SSH, also used by the reachability waits.
    #[ortho_config(default = 22)]
    pub port: u16,
    /// Connect and keep-alive budget in seconds.
    #[ortho_config(default = DEFAULT_CONNECT_TIMEOUT_SECS)]
    pub connect_timeout_secs: u64,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub known_hosts_file: String,
    /// Optional private key used instead of the agent. Supports `~/`.
    pub identity_file: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            user: String::from("root"),
            port: 22,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            known_hosts_file: String::from("/dev/null"),
            identity_file: None,
        }
    }
}

impl SessionConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, SessionError> {
        Self::load_from_iter([OsString::from("hrobot")]).map_err(|err| {
            SessionError::InvalidConfig {
                field: String::from("ssh"),
                message: err.to_string(),
            }
        })
    }

    /// Ensures required values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), SessionError> {
        require_value(&self.ssh_bin, "ssh_bin")?;
        require_value(&self.user, "user")?;
        if let Some(identity) = self.identity_file.as_deref() {
            require_value(identity, "identity_file")?;
        }
        if self.port == 0 {
            return Err(invalid("port", "must be greater than zero"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(invalid("connect_timeout_secs", "must be greater than zero"));
        }
        Ok(())
    }

    /// Returns the transport timeout as a [`Duration`].
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn require_value(value: &str, field: &str) -> Result<(), SessionError> {
    if value.trim().is_empty() {
        return Err(invalid(
            field,
            &format!(
                "set HROBOT_SSH_{} or add {field} to [ssh] in hrobot.toml",
                field.to_uppercase()
            ),
        ));
    }
    Ok(())
}

fn invalid(field: &str, message: &str) -> SessionError {
    SessionError::InvalidConfig {
        field: field.to_owned(),
        message: message.to_owned(),
    }
}
