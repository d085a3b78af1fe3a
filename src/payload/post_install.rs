//! Post-install script enrolling a LUKS keyfile for unattended unlock.

use shell_escape::unix::escape;

use super::{PayloadError, render, validate_value};

const TEMPLATE: &str = include_str!("templates/post-install.sh");

/// Parameters of the post-install script run by `installimage`.
#[derive(Clone)]
pub struct PostInstallScript<'a> {
    /// Passphrase used to authorise adding the keyfile slot.
    pub passphrase: &'a str,
}

impl PostInstallScript<'_> {
    /// Renders the script with the passphrase shell-quoted.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::InvalidValue`] when the passphrase is empty or
    /// contains control characters or template delimiters.
    pub fn render(&self) -> Result<String, PayloadError> {
        validate_value("encryption passphrase", self.passphrase)?;
        let quoted = escape(self.passphrase.into());
        Ok(render(TEMPLATE, &[("passphrase", &*quoted)]))
    }
}
