//! Server order resources.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{OrderKind, TransactionCache, TransactionError};
use crate::robot::{MarketOrderRequest, RobotApi, ServerOrderRequest, Transaction};

/// An order declaration, tagged by flavour.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderRequest {
    /// Standard product order.
    Standard(ServerOrderRequest),
    /// Server market order.
    Market(MarketOrderRequest),
}

impl OrderRequest {
    /// Flavour of this order.
    #[must_use]
    pub const fn kind(&self) -> OrderKind {
        match self {
            Self::Standard(_) => OrderKind::Standard,
            Self::Market(_) => OrderKind::Market,
        }
    }

    /// Whether the order is a dry run.
    #[must_use]
    pub const fn is_test(&self) -> bool {
        match self {
            Self::Standard(order) => order.test,
            Self::Market(order) => order.test,
        }
    }
}

/// Create/read/update/delete semantics for placed orders.
///
/// Orders are immutable once placed. Deleting an order only forgets the
/// cached transaction; it does not cancel the server.
pub struct OrderLifecycle<'a, A: RobotApi + ?Sized> {
    api: &'a A,
    standard: &'a TransactionCache,
    market: &'a TransactionCache,
}

impl<'a, A: RobotApi + ?Sized> OrderLifecycle<'a, A> {
    /// Creates a lifecycle over one cache per order flavour.
    #[must_use]
    pub const fn new(
        api: &'a A,
        standard: &'a TransactionCache,
        market: &'a TransactionCache,
    ) -> Self {
        Self {
            api,
            standard,
            market,
        }
    }

    const fn cache(&self, kind: OrderKind) -> &'a TransactionCache {
        match kind {
            OrderKind::Standard => self.standard,
            OrderKind::Market => self.market,
        }
    }

    /// Places the order and caches the resulting transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Robot`] when the provider rejects the
    /// order.
    pub async fn create(&self, request: &OrderRequest) -> Result<Transaction, TransactionError> {
        let transaction = match request {
            OrderRequest::Standard(order) => self.api.order_server(order).await?,
            OrderRequest::Market(order) => self.api.order_market_server(order).await?,
        };
        info!(
            transaction_id = %transaction.id,
            status = %transaction.status,
            kind = ?request.kind(),
            test = request.is_test(),
            "order placed"
        );
        self.cache(request.kind()).insert(transaction.clone());
        Ok(transaction)
    }

    /// Reads the transaction through the cache. A transaction the provider
    /// no longer knows is forgotten and reported as `None`.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Robot`] for failures other than
    /// not-found.
    pub async fn read(
        &self,
        kind: OrderKind,
        id: &str,
    ) -> Result<Option<Transaction>, TransactionError> {
        let cache = self.cache(kind);
        match cache.fetch(self.api, id).await {
            Ok(transaction) => Ok(Some(transaction)),
            Err(TransactionError::Robot(err)) if err.is_not_found() => {
                warn!(transaction_id = id, "transaction gone, forgetting it");
                cache.forget(id);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Orders cannot be modified.
    ///
    /// # Errors
    ///
    /// Always returns [`TransactionError::ImmutableOrder`].
    pub fn update(&self, kind: OrderKind, id: &str) -> Result<Transaction, TransactionError> {
        let status = self.cache(kind).get(id).map(|cached| cached.status);
        warn!(transaction_id = id, status = ?status, "refusing to modify a placed order");
        Err(TransactionError::ImmutableOrder { id: id.to_owned() })
    }

    /// Forgets the cached transaction.
    pub fn delete(&self, kind: OrderKind, id: &str) {
        self.cache(kind).forget(id);
        info!(transaction_id = id, "order removed from tracking");
    }
}
