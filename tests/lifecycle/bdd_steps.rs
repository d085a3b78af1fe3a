//! BDD step definitions for the managed server lifecycle.

use std::net::Ipv4Addr;

use hrobot::resource::{ManagedServer, StateStore, seed_allocator};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{
    CONFIGURATION_ID, LifecycleContext, SERVER_NUMBER, declaration, provisioned_state,
};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn runtime() -> Result<Runtime, StepError> {
    Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))
}

fn apply(lifecycle_context: &LifecycleContext, declared: ManagedServer) -> Result<(), StepError> {
    let lifecycle = lifecycle_context.lifecycle();
    let result = runtime()?.block_on(async { lifecycle.apply(declared).await });
    lifecycle_context
        .result
        .replace(Some(result.map_err(|err| err.to_string())));
    Ok(())
}

fn stored_declaration(lifecycle_context: &LifecycleContext) -> Result<ManagedServer, StepError> {
    lifecycle_context
        .store
        .load(SERVER_NUMBER)
        .map_err(|err| StepError::Assertion(err.to_string()))?
        .map(|state| state.declared)
        .ok_or_else(|| StepError::Assertion(String::from("no stored state")))
}

#[given("a provisioned server \"{name}\" holding {address}")]
fn provisioned_server(
    lifecycle_context: &LifecycleContext,
    name: String,
    address: Ipv4Addr,
) -> Result<(), StepError> {
    lifecycle_context
        .store
        .save(&provisioned_state(&name, address))
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    let seeded = seed_allocator(&lifecycle_context.store, &lifecycle_context.allocator)
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    if seeded == 1 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("seeded {seeded} addresses")))
    }
}

#[given("the provider rejects server cancellation")]
fn cancellation_rejected(lifecycle_context: &LifecycleContext) {
    lifecycle_context.api.fail_on("cancel_server");
}

#[when("the declaration is applied with version {version:u32}")]
fn apply_version(lifecycle_context: &LifecycleContext, version: u32) -> Result<(), StepError> {
    lifecycle_context.script_imaging();
    let declared = ManagedServer {
        version,
        ..stored_declaration(lifecycle_context)?
    };
    apply(lifecycle_context, declared)
}

#[when("the declaration is applied with description \"{description}\"")]
fn apply_description(
    lifecycle_context: &LifecycleContext,
    description: String,
) -> Result<(), StepError> {
    let declared = ManagedServer {
        description,
        ..stored_declaration(lifecycle_context)?
    };
    apply(lifecycle_context, declared)
}

#[when("the declaration is applied with name \"{name}\"")]
fn apply_name(lifecycle_context: &LifecycleContext, name: String) -> Result<(), StepError> {
    let declared = ManagedServer {
        name,
        ..stored_declaration(lifecycle_context)?
    };
    apply(lifecycle_context, declared)
}

#[when("a declaration \"{name}\" without ssh keys is applied")]
fn apply_keyless(lifecycle_context: &LifecycleContext, name: String) -> Result<(), StepError> {
    let mut declared = declaration(&name);
    declared.server_number = SERVER_NUMBER + 1;
    declared.rescue_authorized_key_fingerprints.clear();
    apply(lifecycle_context, declared)
}

#[when("the server is destroyed")]
fn destroy(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let lifecycle = lifecycle_context.lifecycle();
    let removed = runtime()?
        .block_on(async { lifecycle.delete("web").await })
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    if removed {
        Ok(())
    } else {
        Err(StepError::Assertion(String::from("nothing was removed")))
    }
}

#[then("the host is imaged again")]
fn imaged_again(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let rescues = lifecycle_context.api.call_count("activate_rescue");
    let resets = lifecycle_context.api.call_count("reset");
    if rescues == 1 && resets == 1 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected one rescue and one reset, got {rescues} and {resets}"
        )))
    }
}

#[then("the server still holds {address}")]
fn still_holds(lifecycle_context: &LifecycleContext, address: Ipv4Addr) -> Result<(), StepError> {
    let result = lifecycle_context.result.borrow();
    let state = match result.as_ref() {
        Some(Ok(state)) => state,
        other => return Err(StepError::Assertion(format!("expected success, got {other:?}"))),
    };
    if state.local_ip == Some(address) && lifecycle_context.allocator.is_held(address) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {address}, got {:?}",
            state.local_ip
        )))
    }
}

#[then("the configuration id is unchanged")]
fn id_unchanged(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let result = lifecycle_context.result.borrow();
    let id = result
        .as_ref()
        .and_then(|outcome| outcome.as_ref().ok())
        .and_then(|state| state.id.clone());
    if id.as_deref() == Some(CONFIGURATION_ID) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("unexpected id {id:?}")))
    }
}

#[then("neither the provider nor the host is contacted")]
fn nothing_contacted(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let calls = lifecycle_context.api.calls();
    let commands = lifecycle_context.runner.invocations().len();
    if calls.is_empty() && commands == 0 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "provider calls {calls:?}, {commands} host commands"
        )))
    }
}

#[then("the stored description is \"{description}\"")]
fn stored_description(
    lifecycle_context: &LifecycleContext,
    description: String,
) -> Result<(), StepError> {
    let stored = stored_declaration(lifecycle_context)?;
    if stored.description == description {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "stored description is {:?}",
            stored.description
        )))
    }
}

#[then("{address} is free again")]
fn address_free(lifecycle_context: &LifecycleContext, address: Ipv4Addr) -> Result<(), StepError> {
    if lifecycle_context.allocator.is_held(address) {
        Err(StepError::Assertion(format!("{address} is still held")))
    } else {
        Ok(())
    }
}

#[then("no state remains for \"{name}\"")]
fn no_state(lifecycle_context: &LifecycleContext, name: String) -> Result<(), StepError> {
    let stored = lifecycle_context
        .store
        .find_by_name(&name)
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    if stored.is_none() && lifecycle_context.api.call_count("cancel_server") == 1 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("state for {name} remains")))
    }
}

#[then("only the robot name changes to one starting with \"{prefix}\"")]
fn only_renamed(lifecycle_context: &LifecycleContext, prefix: String) -> Result<(), StepError> {
    let calls = lifecycle_context.api.calls();
    let commands = lifecycle_context.runner.invocations().len();
    let renamed = match calls.as_slice() {
        [call] => call
            .strip_prefix(&format!("set_server_name {SERVER_NUMBER} "))
            .is_some_and(|robot_name| robot_name.starts_with(&prefix)),
        _ => false,
    };
    if renamed && commands == 0 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "provider calls {calls:?}, {commands} host commands"
        )))
    }
}

#[then("a single record is stored, under \"{name}\"")]
fn single_record(lifecycle_context: &LifecycleContext, name: String) -> Result<(), StepError> {
    let records = lifecycle_context
        .store
        .scan()
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    let names: Vec<&str> = records.iter().map(|state| state.name()).collect();
    if names == [name.as_str()] {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("stored records {names:?}")))
    }
}

#[then("the apply fails with \"{message}\"")]
fn apply_failed(lifecycle_context: &LifecycleContext, message: String) -> Result<(), StepError> {
    let result = lifecycle_context.result.borrow();
    match result.as_ref() {
        Some(Err(err)) if err.contains(&message) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected failure with {message:?}, got {other:?}"
        ))),
    }
}

#[then("only {address} is held")]
fn only_held(lifecycle_context: &LifecycleContext, address: Ipv4Addr) -> Result<(), StepError> {
    let held = lifecycle_context.allocator.in_use();
    if held == [address] {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("held addresses {held:?}")))
    }
}
