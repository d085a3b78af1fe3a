//! Named pipeline stages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One step of the provisioning pipeline, in execution order.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Arm the rescue system with the declared keys.
    RescueActivate,
    /// Hardware reset into rescue.
    HardReset,
    /// Wait for SSH on the rescue system.
    WaitRescueReachable,
    /// Open the rescue session.
    SessionOpen,
    /// Discover the two target drives.
    ProbeDisks,
    /// Render and upload the autosetup directive and post-install script.
    BuildAndUploadPayloads,
    /// Run `installimage`.
    RunImaging,
    /// Reboot into the installed system.
    Reboot,
    /// Wait for SSH on the installed system.
    WaitOsReachable,
    /// First-boot network setup and optional cluster join.
    FirstBootSession,
}

impl PipelineStage {
    /// Every stage in execution order.
    pub const ALL: [Self; 10] = [
        Self::RescueActivate,
        Self::HardReset,
        Self::WaitRescueReachable,
        Self::SessionOpen,
        Self::ProbeDisks,
        Self::BuildAndUploadPayloads,
        Self::RunImaging,
        Self::Reboot,
        Self::WaitOsReachable,
        Self::FirstBootSession,
    ];

    /// Stable identifier used in logs and persisted state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RescueActivate => "rescue_activate",
            Self::HardReset => "hard_reset",
            Self::WaitRescueReachable => "wait_rescue_reachable",
            Self::SessionOpen => "session_open",
            Self::ProbeDisks => "probe_disks",
            Self::BuildAndUploadPayloads => "build_and_upload_payloads",
            Self::RunImaging => "run_imaging",
            Self::Reboot => "reboot",
            Self::WaitOsReachable => "wait_os_reachable",
            Self::FirstBootSession => "first_boot_session",
        }
    }

    /// Stage a re-run should start from after `last_completed`.
    ///
    /// Rescue work cannot be resumed half way because the rescue session is
    /// gone, so anything short of a finished image restarts from rescue
    /// activation. A finished image that was never rebooted resumes at the
    /// reboot; the host is still in rescue at that point. Anything later
    /// continues with the OS wait.
    #[must_use]
    pub fn resume_point(last_completed: Option<Self>) -> Self {
        match last_completed {
            Some(Self::RunImaging) => Self::Reboot,
            Some(stage) if stage > Self::RunImaging => Self::WaitOsReachable,
            _ => Self::RescueActivate,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
