//! Physical disk discovery on the rescue host.

use std::fmt;

use thiserror::Error;
use tracing::info;

use crate::session::{CommandRunner, RemoteSession, SessionError};

/// Listing command run on the rescue host; only whole disks are printed.
pub const LISTING_COMMAND: &str = "lsblk -d -o NAME,SIZE,TYPE | grep disk";

/// Drive count the imaging layout is written for.
pub const EXPECTED_DISKS: usize = 2;

/// A whole block device reported by the listing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockDevice {
    /// Device path such as `/dev/nvme0n1`.
    pub path: String,
    /// Size column as printed by `lsblk`.
    pub size: String,
}

impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// The two drives of the mirrored layout, in listing order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DrivePair {
    /// First listed drive, treated as primary.
    pub primary: BlockDevice,
    /// Second listed drive.
    pub secondary: BlockDevice,
}

/// Errors raised while probing disks.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DiskProbeError {
    /// The listing command failed.
    #[error("Failed to detect disks: {source}")]
    Listing {
        /// Underlying session failure.
        source: SessionError,
    },
    /// The host does not have exactly the expected number of disks.
    #[error("Expected exactly {expected} disks, found {found} disks: {listing}")]
    UnexpectedCount {
        /// Required disk count.
        expected: usize,
        /// Disks actually found.
        found: usize,
        /// Raw listing for diagnosis.
        listing: String,
    },
}

impl DiskProbeError {
    /// Short summary used in pipeline failures.
    #[must_use]
    pub const fn summary(&self) -> &'static str {
        match self {
            Self::Listing { .. } => "disk detection failed",
            Self::UnexpectedCount { .. } => "invalid disk count",
        }
    }
}

/// Parses `lsblk -d -o NAME,SIZE,TYPE` output, keeping rows whose type
/// column is `disk`. Partitions, loop devices and the header are skipped.
#[must_use]
pub fn parse_listing(listing: &str) -> Vec<BlockDevice> {
    listing
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [name, size, .., kind] if *kind == "disk" => Some(BlockDevice {
                    path: format!("/dev/{name}"),
                    size: (*size).to_owned(),
                }),
                _ => None,
            }
        })
        .collect()
}

/// Runs the disk listing and enforces the two-drive layout.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiskProber;

impl DiskProber {
    /// Lists disks over `session` and returns the drive pair.
    ///
    /// # Errors
    ///
    /// Returns [`DiskProbeError::Listing`] when the command fails (including
    /// when `grep` matches nothing) or [`DiskProbeError::UnexpectedCount`]
    /// when the host has any number of disks other than two.
    pub fn probe<R: CommandRunner>(
        self,
        session: &RemoteSession<R>,
    ) -> Result<DrivePair, DiskProbeError> {
        let output = session
            .run(LISTING_COMMAND)
            .map_err(|source| DiskProbeError::Listing { source })?;
        let devices = parse_listing(&output.stdout);

        let [primary, secondary]: [BlockDevice; EXPECTED_DISKS] =
            devices
                .try_into()
                .map_err(|found: Vec<BlockDevice>| DiskProbeError::UnexpectedCount {
                    expected: EXPECTED_DISKS,
                    found: found.len(),
                    listing: output.stdout.trim().to_owned(),
                })?;

        info!(
            host = %session.host(),
            drive1 = %primary,
            drive2 = %secondary,
            "detected disks"
        );
        Ok(DrivePair { primary, secondary })
    }
}
