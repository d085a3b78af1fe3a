//! Request and response shapes for the Robot web service.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Order transaction status.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum TransactionStatus {
    /// The provider is still preparing the server.
    #[serde(rename = "in process")]
    InProcess,
    /// The server is delivered.
    #[serde(rename = "ready")]
    Ready,
    /// The order was cancelled.
    #[serde(rename = "cancelled")]
    Cancelled,
    /// Any status this client does not know about.
    #[serde(rename = "unknown", other)]
    Unknown,
}

impl TransactionStatus {
    /// Returns `true` while the provider may still change the transaction.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::InProcess | Self::Unknown)
    }

    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InProcess => "in process",
            Self::Ready => "ready",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Product reference embedded in a transaction: either a bare id or the
/// full product description.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProductRef {
    /// Numeric product id (market orders).
    Id(u64),
    /// Product name such as `EX44`.
    Name(String),
    /// Expanded product description.
    Details(Product),
}

/// Product description returned with standard orders.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Product {
    /// Product identifier.
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Free-form description lines.
    #[serde(default)]
    pub description: Vec<String>,
    /// Included traffic.
    #[serde(default)]
    pub traffic: String,
    /// Datacentre locations; the API sends a string or a list.
    #[serde(default, deserialize_with = "one_or_many")]
    pub location: Vec<String>,
}

/// An order transaction as reported by the provider.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Transaction {
    /// Transaction identifier.
    pub id: String,
    /// Order date.
    #[serde(default)]
    pub date: String,
    /// Current status.
    pub status: TransactionStatus,
    /// Server number, assigned once the server is ready.
    #[serde(default)]
    pub server_number: Option<u32>,
    /// Public address, assigned once the server is ready.
    #[serde(default)]
    pub server_ip: Option<String>,
    /// Ordered product.
    #[serde(default)]
    pub product: Option<ProductRef>,
    /// Ordered addons.
    #[serde(default)]
    pub addons: Vec<String>,
}

#[derive(Deserialize)]
pub(crate) struct TransactionEnvelope {
    pub(crate) transaction: Transaction,
}

/// Rescue system activation result.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Rescue {
    /// Server public address.
    pub server_ip: String,
    /// Whether the rescue system is armed for the next boot.
    #[serde(default)]
    pub active: bool,
    /// One-time root password. Never used for authentication here.
    #[serde(default)]
    pub password: Option<String>,
    /// Keys installed into the rescue system.
    #[serde(default)]
    pub authorized_key: Vec<AuthorizedKeyEnvelope>,
}

/// Wrapper used by the API around key descriptions.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct AuthorizedKeyEnvelope {
    /// Key description.
    pub key: AuthorizedKey,
}

/// Key description.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct AuthorizedKey {
    /// Key fingerprint.
    pub fingerprint: String,
}

#[derive(Deserialize)]
pub(crate) struct RescueEnvelope {
    pub(crate) rescue: Rescue,
}

/// Dedicated server summary from the bulk listing.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Server {
    /// Provider-assigned server number.
    pub server_number: u32,
    /// Name shown in the Robot interface.
    #[serde(default)]
    pub server_name: String,
    /// Public address.
    #[serde(default)]
    pub server_ip: Option<String>,
    /// Server status such as `ready`.
    #[serde(default)]
    pub status: String,
    /// Product name.
    #[serde(default)]
    pub product: String,
    /// Datacentre.
    #[serde(default)]
    pub location: String,
    /// Whether cancellation is scheduled.
    #[serde(default)]
    pub cancelled: bool,
}

#[derive(Deserialize)]
pub(crate) struct ServerEnvelope {
    pub(crate) server: Server,
}

/// Layer-2 virtual switch.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VSwitch {
    /// Switch identifier.
    pub id: u32,
    /// VLAN tag.
    #[serde(default)]
    pub vlan: u16,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Whether the switch is scheduled for cancellation.
    #[serde(default)]
    pub cancelled: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum VSwitchBody {
    Wrapped { vswitch: VSwitch },
    Bare(VSwitch),
}

impl VSwitchBody {
    pub(crate) fn into_vswitch(self) -> VSwitch {
        match self {
            Self::Wrapped { vswitch } | Self::Bare(vswitch) => vswitch,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum VSwitchListBody {
    Wrapped { vswitch: Vec<VSwitch> },
    Bare(Vec<VSwitch>),
}

#[derive(Deserialize)]
pub(crate) struct ApiErrorBody {
    pub(crate) error: ApiErrorDetail,
}

#[derive(Deserialize)]
pub(crate) struct ApiErrorDetail {
    #[serde(default)]
    pub(crate) status: u16,
    #[serde(default)]
    pub(crate) code: String,
    #[serde(default)]
    pub(crate) message: String,
}

/// Parameters for a standard server order.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServerOrderRequest {
    /// Product id such as `EX44`.
    pub product_id: String,
    /// Distribution to preinstall.
    #[serde(default)]
    pub dist: Option<String>,
    /// Datacentre location such as `FSN1`.
    #[serde(default)]
    pub location: Option<String>,
    /// Root password when no keys are given.
    #[serde(default)]
    pub password: Option<String>,
    /// Fingerprints of keys to install.
    #[serde(default)]
    pub authorized_keys: Vec<String>,
    /// Addons to order.
    #[serde(default)]
    pub addons: Vec<String>,
    /// Submit as a test order.
    #[serde(default)]
    pub test: bool,
}

impl ServerOrderRequest {
    pub(crate) fn form(&self) -> Vec<(&'static str, String)> {
        let mut form = vec![("product_id", self.product_id.clone())];
        if let Some(ref dist) = self.dist {
            form.push(("dist", dist.clone()));
        }
        if let Some(ref location) = self.location {
            form.push(("location", location.clone()));
        }
        if let Some(ref password) = self.password {
            form.push(("password", password.clone()));
        }
        push_order_lists(&mut form, &self.authorized_keys, &self.addons, self.test);
        form
    }
}

/// Parameters for a server market (auction) order.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct MarketOrderRequest {
    /// Market product id.
    pub product_id: u64,
    /// Fingerprints of keys to install.
    #[serde(default)]
    pub authorized_keys: Vec<String>,
    /// Addons to order.
    #[serde(default)]
    pub addons: Vec<String>,
    /// Submit as a test order.
    #[serde(default)]
    pub test: bool,
}

impl MarketOrderRequest {
    pub(crate) fn form(&self) -> Vec<(&'static str, String)> {
        let mut form = vec![("product_id", self.product_id.to_string())];
        push_order_lists(&mut form, &self.authorized_keys, &self.addons, self.test);
        form
    }
}

fn push_order_lists(
    form: &mut Vec<(&'static str, String)>,
    keys: &[String],
    addons: &[String],
    test: bool,
) {
    form.extend(keys.iter().map(|key| ("authorized_key[]", key.clone())));
    form.extend(addons.iter().map(|addon| ("addon[]", addon.clone())));
    if test {
        form.push(("test", String::from("true")));
    }
}

/// Rescue activation parameters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RescueRequest {
    /// Rescue operating system; the provider expects `linux`.
    pub os: String,
    /// Fingerprints of keys to install into the rescue system.
    pub authorized_keys: Vec<String>,
}

impl RescueRequest {
    /// Builds a Linux rescue request for the given key fingerprints.
    #[must_use]
    pub fn linux(authorized_keys: Vec<String>) -> Self {
        Self {
            os: String::from("linux"),
            authorized_keys,
        }
    }

    pub(crate) fn form(&self) -> Vec<(&'static str, String)> {
        let os = if self.os.trim().is_empty() {
            String::from("linux")
        } else {
            self.os.clone()
        };
        let mut form = vec![("os", os)];
        form.extend(
            self.authorized_keys
                .iter()
                .map(|key| ("authorized_key[]", key.clone())),
        );
        form
    }
}

/// Reset flavours understood by `/reset/{server}`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ResetKind {
    /// Hardware reset.
    #[default]
    Hardware,
    /// Ctrl+Alt+Del.
    Software,
    /// Power cycle.
    Power,
    /// Manual reset by a technician.
    Manual,
}

impl ResetKind {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hardware => "hw",
            Self::Software => "sw",
            Self::Power => "power",
            Self::Manual => "man",
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Missing(()),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) if value.is_empty() => Vec::new(),
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
        OneOrMany::Missing(()) => Vec::new(),
    })
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        Text(String),
        Number(u64),
    }

    Ok(match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::Text(value) => value,
        StringOrNumber::Number(value) => value.to_string(),
    })
}
