//! Derived server names.

use uuid::Uuid;

/// Length of the random suffix in hex characters.
pub const SUFFIX_LEN: usize = 6;

/// Hostname and Robot display name derived from a base name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerNames {
    /// Hostname written into the image.
    pub server_name: String,
    /// Name set in the Robot interface.
    pub robot_name: String,
}

impl ServerNames {
    /// Derives `{base}-{hash}` with a fresh random hash.
    #[must_use]
    pub fn generate(base: &str) -> Self {
        Self::with_suffix(base, &random_suffix())
    }

    /// Derives `{base}-{suffix}`.
    #[must_use]
    pub fn with_suffix(base: &str, suffix: &str) -> Self {
        let name = format!("{base}-{suffix}");
        Self {
            server_name: name.clone(),
            robot_name: name,
        }
    }
}

/// Six lowercase hex characters from three random bytes.
#[must_use]
pub fn random_suffix() -> String {
    Uuid::new_v4()
        .as_bytes()
        .iter()
        .take(SUFFIX_LEN / 2)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
