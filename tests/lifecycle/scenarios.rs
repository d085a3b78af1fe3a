//! BDD scenarios for the managed server lifecycle.

use rstest_bdd_macros::scenario;

use super::test_helpers::{LifecycleContext, lifecycle_context};

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Bumping the version re-provisions on the same address"
)]
fn scenario_version_bump(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Changing only the description leaves the host alone"
)]
fn scenario_description_only(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Renaming keeps the address and the image"
)]
fn scenario_rename(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "A declaration without keys is refused before any side effect"
)]
fn scenario_keyless(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Teardown releases the address when cancellation fails"
)]
fn scenario_teardown(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}
