//! Client for the provider's Robot web service.
//!
//! Requests are form-encoded and authenticated with HTTP basic auth. Every
//! verb returns either decoded data or a classified [`RobotError`]; a missing
//! remote object is reported as [`RobotError::NotFound`] based on the status
//! code so callers can drop vanished resources from state.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::RobotConfig;

mod error;
mod inventory;
mod types;

pub use error::RobotError;
pub use inventory::ServerInventory;
pub use types::{
    AuthorizedKey, AuthorizedKeyEnvelope, MarketOrderRequest, Product, ProductRef, Rescue,
    RescueRequest, ResetKind, Server, ServerOrderRequest, Transaction, TransactionStatus, VSwitch,
};

use types::{
    ApiErrorBody, RescueEnvelope, ServerEnvelope, TransactionEnvelope, VSwitchBody,
    VSwitchListBody,
};

/// Future returned by Robot API operations.
pub type RobotFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RobotError>> + Send + 'a>>;

/// Named verbs of the Robot API used by the provisioning core.
pub trait RobotApi: Send + Sync {
    /// Places a standard server order.
    fn order_server<'a>(&'a self, order: &'a ServerOrderRequest) -> RobotFuture<'a, Transaction>;

    /// Fetches a standard order transaction.
    fn get_order_transaction<'a>(&'a self, id: &'a str) -> RobotFuture<'a, Transaction>;

    /// Places a server market order.
    fn order_market_server<'a>(
        &'a self,
        order: &'a MarketOrderRequest,
    ) -> RobotFuture<'a, Transaction>;

    /// Fetches a server market order transaction.
    fn get_market_transaction<'a>(&'a self, id: &'a str) -> RobotFuture<'a, Transaction>;

    /// Arms the rescue system for the next boot.
    fn activate_rescue<'a>(
        &'a self,
        server_number: u32,
        request: &'a RescueRequest,
    ) -> RobotFuture<'a, Rescue>;

    /// Resets the server.
    fn reset(&self, server_number: u32, kind: ResetKind) -> RobotFuture<'_, ()>;

    /// Sets the name shown in the Robot interface.
    fn set_server_name<'a>(&'a self, server_number: u32, name: &'a str) -> RobotFuture<'a, ()>;

    /// Schedules cancellation; `None` means the end of the billing period.
    fn cancel_server<'a>(
        &'a self,
        server_number: u32,
        cancellation_date: Option<&'a str>,
    ) -> RobotFuture<'a, ()>;

    /// Attaches a server to a virtual switch.
    fn add_server_to_vswitch(&self, vswitch_id: u32, server_ip: IpAddr) -> RobotFuture<'_, ()>;

    /// Creates a virtual switch.
    fn create_vswitch<'a>(&'a self, vlan: u16, name: &'a str) -> RobotFuture<'a, VSwitch>;

    /// Fetches a virtual switch.
    fn get_vswitch(&self, id: u32) -> RobotFuture<'_, VSwitch>;

    /// Lists virtual switches.
    fn list_vswitches(&self) -> RobotFuture<'_, Vec<VSwitch>>;

    /// Updates a virtual switch.
    fn update_vswitch<'a>(&'a self, id: u32, vlan: u16, name: &'a str)
    -> RobotFuture<'a, VSwitch>;

    /// Cancels a virtual switch immediately.
    fn delete_vswitch(&self, id: u32) -> RobotFuture<'_, ()>;

    /// Lists every server on the account in one call.
    fn list_all_servers(&self) -> RobotFuture<'_, Vec<Server>>;
}

type Form = Vec<(&'static str, String)>;

/// HTTP implementation of [`RobotApi`].
#[derive(Clone, Debug)]
pub struct RobotClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl RobotClient {
    /// Builds a client from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::Config`] when credentials are missing or the
    /// HTTP client cannot be constructed.
    pub fn new(config: &RobotConfig) -> Result<Self, RobotError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|err| RobotError::Config(err.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        form: Option<Form>,
        accepted: &[StatusCode],
    ) -> Result<Vec<u8>, RobotError> {
        let url = format!("{}{path}", self.base_url);
        debug!(method = %method, path, "robot request");
        let mut request = self
            .http
            .request(method.clone(), &url)
            .basic_auth(&self.username, Some(&self.password));
        if let Some(fields) = form {
            request = request.form(&fields);
        }

        let transport = |err: reqwest::Error| RobotError::Transport {
            method: method.to_string(),
            path: path.to_owned(),
            message: err.to_string(),
        };
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        let body = response.bytes().await.map_err(transport)?;

        if accepted.contains(&status) {
            return Ok(body.to_vec());
        }

        warn!(method = %method, path, status = status.as_u16(), "robot request rejected");
        Err(classify_failure(path, status, &body))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        form: Option<Form>,
        accepted: &[StatusCode],
    ) -> Result<T, RobotError> {
        let body = self.send(method, path, form, accepted).await?;
        decode(path, &body)
    }
}

fn decode<T: DeserializeOwned>(path: &str, body: &[u8]) -> Result<T, RobotError> {
    serde_json::from_slice(body).map_err(|err| RobotError::Decode {
        path: path.to_owned(),
        message: err.to_string(),
    })
}

pub(crate) fn classify_failure(path: &str, status: StatusCode, body: &[u8]) -> RobotError {
    let parsed = serde_json::from_slice::<ApiErrorBody>(body).ok();
    let api_status = parsed.as_ref().map_or(0, |parsed| parsed.error.status);
    if status == StatusCode::NOT_FOUND || api_status == StatusCode::NOT_FOUND.as_u16() {
        return RobotError::NotFound {
            path: path.to_owned(),
        };
    }

    match parsed {
        Some(parsed) if !parsed.error.message.is_empty() => RobotError::Api {
            status: status.as_u16(),
            code: parsed.error.code,
            message: parsed.error.message,
        },
        _ => RobotError::UnexpectedStatus {
            status: status.as_u16(),
            body: String::from_utf8_lossy(body).into_owned(),
        },
    }
}

fn complete_vswitch(mut vswitch: VSwitch, vlan: u16, name: &str) -> VSwitch {
    if vswitch.vlan == 0 {
        vswitch.vlan = vlan;
    }
    if vswitch.name.is_empty() {
        name.clone_into(&mut vswitch.name);
    }
    vswitch
}

const OK: &[StatusCode] = &[StatusCode::OK];
const OK_OR_CREATED: &[StatusCode] = &[StatusCode::OK, StatusCode::CREATED];

impl RobotApi for RobotClient {
    fn order_server<'a>(&'a self, order: &'a ServerOrderRequest) -> RobotFuture<'a, Transaction> {
        Box::pin(async move {
            let envelope: TransactionEnvelope = self
                .send_json(
                    Method::POST,
                    "/order/server/transaction",
                    Some(order.form()),
                    OK_OR_CREATED,
                )
                .await?;
            Ok(envelope.transaction)
        })
    }

    fn get_order_transaction<'a>(&'a self, id: &'a str) -> RobotFuture<'a, Transaction> {
        Box::pin(async move {
            let path = format!("/order/server/transaction/{}", path_segment(id));
            let envelope: TransactionEnvelope =
                self.send_json(Method::GET, &path, None, OK).await?;
            Ok(envelope.transaction)
        })
    }

    fn order_market_server<'a>(
        &'a self,
        order: &'a MarketOrderRequest,
    ) -> RobotFuture<'a, Transaction> {
        Box::pin(async move {
            let envelope: TransactionEnvelope = self
                .send_json(
                    Method::POST,
                    "/order/server_market/transaction",
                    Some(order.form()),
                    OK_OR_CREATED,
                )
                .await?;
            Ok(envelope.transaction)
        })
    }

    fn get_market_transaction<'a>(&'a self, id: &'a str) -> RobotFuture<'a, Transaction> {
        Box::pin(async move {
            let path = format!("/order/server_market/transaction/{}", path_segment(id));
            let envelope: TransactionEnvelope =
                self.send_json(Method::GET, &path, None, OK).await?;
            Ok(envelope.transaction)
        })
    }

    fn activate_rescue<'a>(
        &'a self,
        server_number: u32,
        request: &'a RescueRequest,
    ) -> RobotFuture<'a, Rescue> {
        Box::pin(async move {
            let path = format!("/boot/{server_number}/rescue");
            let envelope: RescueEnvelope = self
                .send_json(Method::POST, &path, Some(request.form()), OK)
                .await?;
            Ok(envelope.rescue)
        })
    }

    fn reset(&self, server_number: u32, kind: ResetKind) -> RobotFuture<'_, ()> {
        Box::pin(async move {
            let path = format!("/reset/{server_number}");
            let form = vec![("type", kind.as_str().to_owned())];
            self.send(Method::POST, &path, Some(form), OK).await?;
            Ok(())
        })
    }

    fn set_server_name<'a>(&'a self, server_number: u32, name: &'a str) -> RobotFuture<'a, ()> {
        Box::pin(async move {
            let path = format!("/server/{server_number}");
            let form = vec![("server_name", name.to_owned())];
            self.send(Method::POST, &path, Some(form), OK).await?;
            Ok(())
        })
    }

    fn cancel_server<'a>(
        &'a self,
        server_number: u32,
        cancellation_date: Option<&'a str>,
    ) -> RobotFuture<'a, ()> {
        Box::pin(async move {
            let path = format!("/server/{server_number}/cancellation");
            let form = cancellation_date
                .filter(|date| !date.trim().is_empty())
                .map(|date| vec![("cancellation_date", date.to_owned())])
                .unwrap_or_default();
            self.send(Method::DELETE, &path, Some(form), OK).await?;
            Ok(())
        })
    }

    fn add_server_to_vswitch(&self, vswitch_id: u32, server_ip: IpAddr) -> RobotFuture<'_, ()> {
        Box::pin(async move {
            let path = format!("/vswitch/{vswitch_id}/server");
            let form = vec![("server[]", server_ip.to_string())];
            self.send(Method::POST, &path, Some(form), OK).await?;
            Ok(())
        })
    }

    fn create_vswitch<'a>(&'a self, vlan: u16, name: &'a str) -> RobotFuture<'a, VSwitch> {
        Box::pin(async move {
            let form = vec![("vlan", vlan.to_string()), ("name", name.to_owned())];
            let body: VSwitchBody = self
                .send_json(Method::POST, "/vswitch", Some(form), OK_OR_CREATED)
                .await?;
            Ok(complete_vswitch(body.into_vswitch(), vlan, name))
        })
    }

    fn get_vswitch(&self, id: u32) -> RobotFuture<'_, VSwitch> {
        Box::pin(async move {
            let path = format!("/vswitch/{id}");
            let body: VSwitchBody = self.send_json(Method::GET, &path, None, OK).await?;
            Ok(body.into_vswitch())
        })
    }

    fn list_vswitches(&self) -> RobotFuture<'_, Vec<VSwitch>> {
        Box::pin(async move {
            let body: VSwitchListBody = self.send_json(Method::GET, "/vswitch", None, OK).await?;
            Ok(match body {
                VSwitchListBody::Wrapped { vswitch } | VSwitchListBody::Bare(vswitch) => vswitch,
            })
        })
    }

    fn update_vswitch<'a>(
        &'a self,
        id: u32,
        vlan: u16,
        name: &'a str,
    ) -> RobotFuture<'a, VSwitch> {
        Box::pin(async move {
            let path = format!("/vswitch/{id}");
            let form = vec![("vlan", vlan.to_string()), ("name", name.to_owned())];
            let body: VSwitchBody = self.send_json(Method::POST, &path, Some(form), OK).await?;
            Ok(complete_vswitch(body.into_vswitch(), vlan, name))
        })
    }

    fn delete_vswitch(&self, id: u32) -> RobotFuture<'_, ()> {
        Box::pin(async move {
            let path = format!("/vswitch/{id}?cancellation_date=now");
            self.send(Method::DELETE, &path, None, OK).await?;
            Ok(())
        })
    }

    fn list_all_servers(&self) -> RobotFuture<'_, Vec<Server>> {
        Box::pin(async move {
            let envelopes: Vec<ServerEnvelope> =
                self.send_json(Method::GET, "/server", None, OK).await?;
            Ok(envelopes
                .into_iter()
                .map(|envelope| envelope.server)
                .collect())
        })
    }
}

fn path_segment(value: &str) -> String {
    value
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
        .collect()
}
