//! Account-wide server listing shared across lookups.

use tokio::sync::RwLock;
use tracing::debug;

use super::{RobotApi, RobotError, Server};

/// Fetches the server listing at most once and answers per-server lookups
/// from the cached copy.
///
/// Several resources refreshing at once each need one server record; the
/// inventory turns N lookups into a single `GET /server`.
#[derive(Debug, Default)]
pub struct ServerInventory {
    servers: RwLock<Option<Vec<Server>>>,
}

impl ServerInventory {
    /// Creates an empty inventory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the server with `server_number`.
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::NotFound`] when the account has no such server,
    /// or the listing error when the fetch fails. A failed fetch is not
    /// cached.
    pub async fn server<A: RobotApi + ?Sized>(
        &self,
        api: &A,
        server_number: u32,
    ) -> Result<Server, RobotError> {
        self.ensure_loaded(api).await?;
        let guard = self.servers.read().await;
        guard
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|server| server.server_number == server_number)
            .cloned()
            .ok_or_else(|| RobotError::NotFound {
                path: format!("/server/{server_number}"),
            })
    }

    /// Returns the full listing, fetching it on first use.
    ///
    /// # Errors
    ///
    /// Returns the listing error when the fetch fails.
    pub async fn all<A: RobotApi + ?Sized>(&self, api: &A) -> Result<Vec<Server>, RobotError> {
        self.ensure_loaded(api).await?;
        Ok(self.servers.read().await.clone().unwrap_or_default())
    }

    /// Drops the cached listing so the next lookup refetches.
    pub async fn invalidate(&self) {
        *self.servers.write().await = None;
    }

    async fn ensure_loaded<A: RobotApi + ?Sized>(&self, api: &A) -> Result<(), RobotError> {
        if self.servers.read().await.is_some() {
            return Ok(());
        }

        let mut guard = self.servers.write().await;
        if guard.is_none() {
            let servers = api.list_all_servers().await?;
            debug!(count = servers.len(), "server inventory loaded");
            *guard = Some(servers);
        }
        Ok(())
    }
}
