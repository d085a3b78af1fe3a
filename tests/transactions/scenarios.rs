//! BDD scenarios for order transaction tracking.

use rstest_bdd_macros::scenario;

use super::test_helpers::{OrderContext, order_context};

#[scenario(
    path = "tests/features/transactions.feature",
    name = "A ready transaction is fetched from the provider only once"
)]
fn scenario_ready_cached(order_context: OrderContext) {
    let _ = order_context;
}

#[scenario(
    path = "tests/features/transactions.feature",
    name = "A pending transaction is refreshed on every read"
)]
fn scenario_pending_refetched(order_context: OrderContext) {
    let _ = order_context;
}

#[scenario(
    path = "tests/features/transactions.feature",
    name = "Cached transactions survive a restart"
)]
fn scenario_survives_restart(order_context: OrderContext) {
    let _ = order_context;
}
