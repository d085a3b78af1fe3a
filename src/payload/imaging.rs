//! The `installimage` autosetup directive.

use super::{Architecture, PayloadError, invalid, render, validate_value};
use crate::disks::DrivePair;

const TEMPLATE: &str = include_str!("templates/autosetup.conf");

/// Software RAID levels accepted by `installimage`.
pub const RAID_LEVELS: [u8; 5] = [0, 1, 5, 6, 10];

const HOSTNAME_MAX: usize = 63;

/// Parameters of the two-drive encrypted autosetup.
#[derive(Clone)]
pub struct ImagingDirective<'a> {
    /// Hostname written into the image.
    pub hostname: &'a str,
    /// Image architecture.
    pub architecture: Architecture,
    /// LUKS passphrase for the root volume.
    pub passphrase: &'a str,
    /// Software RAID level.
    pub raid_level: u8,
    /// Target drives.
    pub drives: &'a DrivePair,
    /// Skip the EFI system partition for legacy-boot machines.
    pub no_uefi: bool,
}

impl ImagingDirective<'_> {
    /// Checks every parameter without rendering.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::InvalidValue`] naming the first bad field.
    pub fn validate(&self) -> Result<(), PayloadError> {
        Self::validate_parameters(self.hostname, self.passphrase, self.raid_level)?;
        for drive in [&self.drives.primary, &self.drives.secondary] {
            validate_value("drive", &drive.path)?;
            if !drive.path.starts_with("/dev/") || drive.path.contains(char::is_whitespace) {
                return Err(invalid("drive", format!("{} is not a device path", drive.path)));
            }
        }
        Ok(())
    }

    /// Checks the drive-independent parameters, so a request can be rejected
    /// before the host is touched.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::InvalidValue`] naming the first bad field.
    pub fn validate_parameters(
        hostname: &str,
        passphrase: &str,
        raid_level: u8,
    ) -> Result<(), PayloadError> {
        validate_hostname(hostname)?;
        validate_value("encryption passphrase", passphrase)?;
        if !RAID_LEVELS.contains(&raid_level) {
            return Err(invalid(
                "raid level",
                format!("{raid_level} is not one of 0, 1, 5, 6, 10"),
            ));
        }
        Ok(())
    }

    /// Renders the directive.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::InvalidValue`] when validation fails.
    pub fn render(&self) -> Result<String, PayloadError> {
        self.validate()?;
        let partitions = if self.no_uefi {
            "PART /boot ext4 1G\nPART /     ext4 all crypt"
        } else {
            "PART /boot/efi esp 512M\nPART /boot ext4 1G\nPART /     ext4 all crypt"
        };
        let raid_level = self.raid_level.to_string();
        Ok(render(
            TEMPLATE,
            &[
                ("passphrase", self.passphrase),
                ("drive1", self.drives.primary.path.as_str()),
                ("drive2", self.drives.secondary.path.as_str()),
                ("raid_level", raid_level.as_str()),
                ("partitions", partitions),
                ("arch", self.architecture.as_str()),
                ("hostname", self.hostname),
            ],
        ))
    }
}

/// Hostnames are a single DNS label.
fn validate_hostname(hostname: &str) -> Result<(), PayloadError> {
    if hostname.is_empty() || hostname.len() > HOSTNAME_MAX {
        return Err(invalid("hostname", "must be 1 to 63 characters"));
    }
    if !hostname
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-')
    {
        return Err(invalid(
            "hostname",
            format!("{hostname} may only contain letters, digits and hyphens"),
        ));
    }
    if hostname.starts_with('-') || hostname.ends_with('-') {
        return Err(invalid("hostname", "must not start or end with a hyphen"));
    }
    Ok(())
}
