//! BDD step definitions for order transaction tracking.

use hrobot::robot::{ServerOrderRequest, Transaction, TransactionStatus};
use hrobot::test_support::transaction;
use hrobot::transactions::{OrderKind, OrderLifecycle, OrderRequest, TransactionCache};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::OrderContext;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn runtime() -> Result<Runtime, StepError> {
    Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))
}

fn ready_on(id: &str, server_number: u32) -> Transaction {
    Transaction {
        server_number: Some(server_number),
        server_ip: Some(String::from("192.168.1.100")),
        ..transaction(id, TransactionStatus::Ready)
    }
}

#[given("a standard order \"{id}\" that becomes ready on server {server_number:u32}")]
fn order_becomes_ready(order_context: &OrderContext, id: String, server_number: u32) {
    order_context
        .api
        .set_order_response(transaction(&id, TransactionStatus::InProcess));
    order_context
        .api
        .push_transactions(&id, [ready_on(&id, server_number)]);
    order_context.order_id.replace(id);
}

#[given("a standard order \"{id}\" that stays in process")]
fn order_stays_pending(order_context: &OrderContext, id: String) {
    let pending = transaction(&id, TransactionStatus::InProcess);
    order_context.api.set_order_response(pending.clone());
    order_context.api.push_transactions(&id, [pending]);
    order_context.order_id.replace(id);
}

#[given("the cache is kept on disk")]
fn cache_on_disk(order_context: &OrderContext) {
    order_context.standard.replace(TransactionCache::open(
        OrderKind::Standard,
        order_context.cache_path(),
    ));
}

#[when("the order is placed")]
fn place_order(order_context: &OrderContext) -> Result<(), StepError> {
    let request = OrderRequest::Standard(ServerOrderRequest {
        product_id: String::from("AX41-NVMe"),
        location: Some(String::from("HEL1")),
        authorized_keys: vec![String::from("de:ad:be:ef")],
        ..ServerOrderRequest::default()
    });
    let standard = order_context.standard.borrow();
    let orders = OrderLifecycle::new(&order_context.api, &standard, &order_context.market);
    runtime()?
        .block_on(async { orders.create(&request).await })
        .map(|_| ())
        .map_err(|err| StepError::Assertion(err.to_string()))
}

#[when("the transaction is read twice")]
fn read_twice(order_context: &OrderContext) -> Result<(), StepError> {
    let id = order_context.order_id.borrow().clone();
    let standard = order_context.standard.borrow();
    let orders = OrderLifecycle::new(&order_context.api, &standard, &order_context.market);
    let runtime = runtime()?;
    for _ in 0..2 {
        let current = runtime
            .block_on(async { orders.read(OrderKind::Standard, &id).await })
            .map_err(|err| StepError::Assertion(err.to_string()))?;
        order_context.last_read.replace(current);
    }
    Ok(())
}

#[when("the cache is reopened")]
fn reopen(order_context: &OrderContext) {
    order_context.reopened.replace(Some(TransactionCache::open(
        OrderKind::Standard,
        order_context.cache_path(),
    )));
}

#[then("the provider was called {count:usize} times")]
fn provider_calls(order_context: &OrderContext, count: usize) -> Result<(), StepError> {
    let calls = order_context.api.calls();
    if calls.len() == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} provider calls, got {calls:?}"
        )))
    }
}

#[then("the transaction reports server {server_number:u32} at {address}")]
fn reports_server(
    order_context: &OrderContext,
    server_number: u32,
    address: String,
) -> Result<(), StepError> {
    let last = order_context.last_read.borrow();
    let Some(current) = last.as_ref() else {
        return Err(StepError::Assertion(String::from("transaction was not found")));
    };
    if current.server_number == Some(server_number)
        && current.server_ip.as_deref() == Some(address.as_str())
    {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("unexpected transaction {current:?}")))
    }
}

#[then("the reopened cache still holds the transaction")]
fn reopened_holds(order_context: &OrderContext) -> Result<(), StepError> {
    let id = order_context.order_id.borrow().clone();
    let reopened = order_context.reopened.borrow();
    let cached = reopened
        .as_ref()
        .and_then(|cache| cache.get(&id))
        .ok_or_else(|| StepError::Assertion(format!("{id} missing after reopen")))?;
    if cached.status == TransactionStatus::Ready {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("cached status is {}", cached.status)))
    }
}
