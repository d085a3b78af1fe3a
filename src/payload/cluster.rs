//! Gateway wait and k3s agent join commands.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use shell_escape::unix::escape;

use super::{PayloadError, invalid, render, validate_value};

const GATEWAY_TEMPLATE: &str = include_str!("templates/gateway-wait.sh");

const K3S_INSTALLER: &str = "https://get.k3s.io";

/// A Kubernetes node label.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NodeLabel {
    /// Label key.
    pub name: String,
    /// Label value.
    pub value: String,
}

/// Pings the private gateway until it answers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GatewayWait {
    /// Address to ping.
    pub gateway: Ipv4Addr,
    /// Maximum number of pings.
    pub attempts: u32,
    /// Seconds between pings.
    pub interval_secs: u32,
}

impl Default for GatewayWait {
    fn default() -> Self {
        Self {
            gateway: Ipv4Addr::new(10, 0, 0, 120),
            attempts: 60,
            interval_secs: 5,
        }
    }
}

impl GatewayWait {
    /// Renders the ping loop.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::InvalidValue`] when `attempts` is zero.
    pub fn render(&self) -> Result<String, PayloadError> {
        if self.attempts == 0 {
            return Err(invalid("gateway attempts", "must be greater than zero"));
        }
        let gateway = self.gateway.to_string();
        let attempts = self.attempts.to_string();
        let interval = self.interval_secs.to_string();
        Ok(render(
            GATEWAY_TEMPLATE,
            &[
                ("gateway", gateway.as_str()),
                ("attempts", attempts.as_str()),
                ("interval", interval.as_str()),
            ],
        ))
    }
}

/// Parameters of the k3s agent installation.
#[derive(Clone)]
pub struct ClusterJoin<'a> {
    /// API server URL such as `https://10.0.0.120:6443`.
    pub url: &'a str,
    /// Node join token.
    pub token: &'a str,
    /// Labels applied at registration.
    pub labels: &'a [NodeLabel],
    /// Taints applied at registration.
    pub taints: &'a [String],
}

impl ClusterJoin<'_> {
    /// Validates the join parameters.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::InvalidValue`] for empty values, control
    /// characters, or a URL that is not HTTP(S).
    pub fn validate(&self) -> Result<(), PayloadError> {
        validate_value("cluster url", self.url)?;
        if !(self.url.starts_with("https://") || self.url.starts_with("http://")) {
            return Err(invalid("cluster url", "must start with https:// or http://"));
        }
        validate_value("cluster token", self.token)?;
        for label in self.labels {
            validate_value("node label name", &label.name)?;
            validate_value("node label value", &label.value)?;
            if label.name.contains('=') {
                return Err(invalid("node label name", "must not contain '='"));
            }
        }
        for taint in self.taints {
            validate_value("taint", taint)?;
        }
        Ok(())
    }

    /// Builds the installer pipeline with every value shell-quoted.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::InvalidValue`] when validation fails.
    pub fn command(&self) -> Result<String, PayloadError> {
        self.validate()?;
        let mut command = format!(
            "curl -sfL {K3S_INSTALLER} | K3S_URL={} K3S_TOKEN={} sh -s - --kubelet-arg=\"--cloud-provider=external\"",
            escape(self.url.into()),
            escape(self.token.into()),
        );
        for label in self.labels {
            let pair = format!("{}={}", label.name, label.value);
            command.push_str(" --node-label ");
            command.push_str(&escape(pair.into()));
        }
        for taint in self.taints {
            let arg = format!("--kubelet-arg=register-with-taints={taint}");
            command.push(' ');
            command.push_str(&escape(arg.into()));
        }
        Ok(command)
    }
}
