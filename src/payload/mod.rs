//! Script and directive rendering for imaging and first boot.
//!
//! Each payload has a typed parameter struct. Values are validated before
//! they are substituted into the `{{name}}` placeholders of the bundled
//! templates, so a parameter can never inject a placeholder or break out of
//! its line.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod cluster;
mod first_boot;
mod imaging;
mod post_install;

pub use cluster::{ClusterJoin, GatewayWait, NodeLabel};
pub use first_boot::{FirstBootScript, VlanSettings};
pub use imaging::{ImagingDirective, RAID_LEVELS};
pub use post_install::PostInstallScript;

/// Operating system architecture of the installed image.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    /// x86-64.
    #[default]
    Amd64,
    /// 64-bit ARM.
    Arm64,
}

impl Architecture {
    /// Name used in image file names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while validating payload parameters.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PayloadError {
    /// A parameter failed validation.
    #[error("invalid {field}: {reason}")]
    InvalidValue {
        /// Parameter name.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> PayloadError {
    PayloadError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

/// Rejects values that are empty, contain control characters, or contain the
/// template delimiters.
pub(crate) fn validate_value(field: &'static str, value: &str) -> Result<(), PayloadError> {
    if value.trim().is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    if value.chars().any(char::is_control) {
        return Err(invalid(field, "must not contain control characters"));
    }
    if value.contains("{{") || value.contains("}}") {
        return Err(invalid(field, "must not contain template delimiters"));
    }
    Ok(())
}

/// Replaces each `{{key}}` in `template` with its value. Values must already
/// be validated.
pub(crate) fn render(template: &str, values: &[(&str, &str)]) -> String {
    values
        .iter()
        .fold(template.to_owned(), |rendered, (key, value)| {
            rendered.replace(&format!("{{{{{key}}}}}"), value)
        })
}
