//! Pipeline timing and cluster gateway settings.

use std::ffi::OsString;
use std::net::Ipv4Addr;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::config::ConfigError;

/// Timeouts and gateway settings for [`super::ProvisioningPipeline`].
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "HROBOT_PIPELINE",
    discovery(
        app_name = "hrobot",
        env_var = "HROBOT_CONFIG_PATH",
        config_file_name = "hrobot.toml",
        dotfile_name = ".hrobot.toml",
        project_file_name = "hrobot.toml"
    )
)]
pub struct PipelineConfig {
    /// Primary budget for the rescue and installed-OS SSH waits.
    #[ortho_config(default = 1200)]
    pub wait_timeout_secs: u64,
    /// One-off extension after the installed-OS wait times out.
    #[ortho_config(default = 900)]
    pub wait_extension_secs: u64,
    /// Budget for the reboot that follows the first-boot script.
    #[ortho_config(default = 600)]
    pub first_boot_wait_secs: u64,
    /// Pause after issuing a reboot so the old SSH daemon is gone before
    /// polling starts.
    #[ortho_config(default = 10)]
    pub reboot_settle_secs: u64,
    /// Pause between reachability attempts.
    #[ortho_config(default = 5)]
    pub poll_interval_secs: u64,
    /// Budget for one reachability attempt.
    #[ortho_config(default = 5)]
    pub attempt_timeout_secs: u64,
    /// Private gateway pinged before a cluster join.
    #[ortho_config(default = "10.0.0.120".to_owned())]
    pub gateway_ip: String,
    /// Pings attempted before the gateway is declared unreachable.
    #[ortho_config(default = 60)]
    pub gateway_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: 1200,
            wait_extension_secs: 900,
            first_boot_wait_secs: 600,
            reboot_settle_secs: 10,
            poll_interval_secs: 5,
            attempt_timeout_secs: 5,
            gateway_ip: String::from("10.0.0.120"),
            gateway_attempts: 60,
        }
    }
}

impl PipelineConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("hrobot")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks that waits are non-zero and the gateway parses.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("wait_timeout_secs", self.wait_timeout_secs),
            ("first_boot_wait_secs", self.first_boot_wait_secs),
            ("attempt_timeout_secs", self.attempt_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{field} must be greater than zero (HROBOT_PIPELINE_{})",
                    field.to_uppercase()
                )));
            }
        }
        if self.gateway_attempts == 0 {
            return Err(ConfigError::Invalid(String::from(
                "gateway_attempts must be greater than zero",
            )));
        }
        self.gateway()?;
        Ok(())
    }

    /// Parsed private gateway address.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when `gateway_ip` is not an IPv4
    /// address.
    pub fn gateway(&self) -> Result<Ipv4Addr, ConfigError> {
        self.gateway_ip.trim().parse().map_err(|_| {
            ConfigError::Invalid(format!("gateway_ip {} is not an IPv4 address", self.gateway_ip))
        })
    }

    /// Primary SSH wait.
    #[must_use]
    pub const fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// Extension of the installed-OS wait.
    #[must_use]
    pub const fn wait_extension(&self) -> Duration {
        Duration::from_secs(self.wait_extension_secs)
    }

    /// Post-first-boot reboot wait.
    #[must_use]
    pub const fn first_boot_wait(&self) -> Duration {
        Duration::from_secs(self.first_boot_wait_secs)
    }

    /// Settle delay after a reboot.
    #[must_use]
    pub const fn reboot_settle(&self) -> Duration {
        Duration::from_secs(self.reboot_settle_secs)
    }

    /// Pause between reachability attempts.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Budget for one reachability attempt.
    #[must_use]
    pub const fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}
