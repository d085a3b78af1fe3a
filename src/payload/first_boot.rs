//! First-boot script: VLAN sub-interface and CPU governor.

use std::net::Ipv4Addr;

use super::{PayloadError, invalid, render};

const TEMPLATE: &str = include_str!("templates/initialize.sh");

/// Private network layout attached to each server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VlanSettings {
    /// VLAN tag of the cluster switch.
    pub vlan_id: u16,
    /// Interface MTU.
    pub mtu: u16,
    /// Router on the VLAN.
    pub gateway: Ipv4Addr,
    /// Cluster network reached through the router.
    pub cluster_network: Ipv4Addr,
    /// Prefix length of `cluster_network`.
    pub cluster_prefix: u8,
}

impl Default for VlanSettings {
    fn default() -> Self {
        Self {
            vlan_id: 4001,
            mtu: 1400,
            gateway: Ipv4Addr::new(10, 1, 0, 1),
            cluster_network: Ipv4Addr::new(10, 0, 0, 0),
            cluster_prefix: 16,
        }
    }
}

/// Parameters of `/root/initialize.sh`.
#[derive(Clone, Debug)]
pub struct FirstBootScript<'a> {
    /// Private address allocated to this server.
    pub local_ip: Ipv4Addr,
    /// VLAN layout.
    pub vlan: VlanSettings,
    /// Operator script appended verbatim.
    pub extra_script: Option<&'a str>,
}

impl FirstBootScript<'_> {
    /// Renders the script.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::InvalidValue`] when the VLAN layout is out of
    /// range or the extra script contains a NUL byte.
    pub fn render(&self) -> Result<String, PayloadError> {
        if !(1..=4094).contains(&self.vlan.vlan_id) {
            return Err(invalid("vlan id", format!("{} is out of range", self.vlan.vlan_id)));
        }
        if self.vlan.cluster_prefix > 32 {
            return Err(invalid("cluster prefix", "must be at most 32"));
        }
        if self.extra_script.is_some_and(|script| script.contains('\0')) {
            return Err(invalid("extra script", "must not contain NUL bytes"));
        }

        let local_ip = self.local_ip.to_string();
        let vlan_id = self.vlan.vlan_id.to_string();
        let mtu = self.vlan.mtu.to_string();
        let cidr = format!("{}/{}", self.vlan.cluster_network, self.vlan.cluster_prefix);
        let gateway = self.vlan.gateway.to_string();
        let mut script = render(
            TEMPLATE,
            &[
                ("local_ip", local_ip.as_str()),
                ("vlan_id", vlan_id.as_str()),
                ("mtu", mtu.as_str()),
                ("cluster_cidr", cidr.as_str()),
                ("vlan_gateway", gateway.as_str()),
            ],
        );

        if let Some(extra) = self.extra_script.filter(|extra| !extra.trim().is_empty()) {
            script.push_str("\n# operator script\n");
            script.push_str(extra);
            if !extra.ends_with('\n') {
                script.push('\n');
            }
        }
        Ok(script)
    }
}
