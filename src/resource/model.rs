//! Declared configuration and persisted state of a managed server.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

use crate::payload::{Architecture, NodeLabel};
use crate::pipeline::PipelineStage;

/// A string that never appears in `Debug` output.
#[derive(Clone, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wraps `value`.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the secret value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

const fn default_version() -> u32 {
    1
}

const fn default_raid_level() -> u8 {
    1
}

/// Desired configuration of one bare-metal server.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ManagedServer {
    /// Base name; the hostname is `{name}-{hash}`.
    pub name: String,
    /// Provider server number. Changing it requires a new resource.
    pub server_number: u32,
    /// Public address. Changing it requires a new resource.
    pub server_ip: IpAddr,
    /// Free-form note, stored only.
    #[serde(default)]
    pub description: String,
    /// Virtual switch the server joins.
    #[serde(default)]
    pub vswitch_id: Option<u32>,
    /// Bumping this re-runs the full pipeline.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Image architecture.
    #[serde(default)]
    pub arch: Architecture,
    /// LUKS passphrase for the root volume.
    pub encryption_passphrase: Secret,
    /// Software RAID level.
    #[serde(default = "default_raid_level")]
    pub raid_level: u8,
    /// Skip the EFI partition.
    #[serde(default)]
    pub no_uefi: bool,
    /// Keys armed in the rescue system; at least one is required.
    #[serde(default)]
    pub rescue_authorized_key_fingerprints: BTreeSet<String>,
    /// Labels applied when the node joins the cluster.
    #[serde(default)]
    pub node_labels: Vec<NodeLabel>,
    /// Taints applied when the node joins the cluster.
    #[serde(default)]
    pub taints: Vec<String>,
    /// Cluster API URL. The node joins only when URL and token are both set.
    #[serde(default)]
    pub cluster_url: Option<String>,
    /// Cluster join token.
    #[serde(default)]
    pub cluster_token: Option<Secret>,
    /// Script appended to the first-boot script.
    #[serde(default)]
    pub extra_script: Option<String>,
}

/// What is persisted for a managed server between runs.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ManagedServerState {
    /// Stamped once the first pipeline run succeeds; kept across
    /// re-provisioning.
    #[serde(default)]
    pub id: Option<String>,
    /// Configuration the state was produced from.
    pub declared: ManagedServer,
    /// Private address; fixed for the life of the resource.
    #[serde(default)]
    pub local_ip: Option<Ipv4Addr>,
    /// Hostname written into the image.
    pub server_name: String,
    /// Name set in the Robot interface.
    pub robot_name: String,
    /// Last pipeline stage that completed.
    #[serde(default)]
    pub last_completed_stage: Option<PipelineStage>,
    /// Whether the most recent pipeline run finished.
    #[serde(default)]
    pub provisioned: bool,
}

impl ManagedServerState {
    /// Resource name used as the state key.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.declared.name
    }
}
