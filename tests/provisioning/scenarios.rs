//! BDD scenarios for the provisioning pipeline.

use rstest_bdd_macros::scenario;

use super::test_helpers::{PipelineContext, pipeline_context};

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "Provision a rescue-ready server end to end"
)]
fn scenario_provision_end_to_end(pipeline_context: PipelineContext) {
    let _ = pipeline_context;
}

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "Refuse a host with the wrong number of disks"
)]
fn scenario_wrong_disk_count(pipeline_context: PipelineContext) {
    let _ = pipeline_context;
}

#[scenario(
    path = "tests/features/provisioning.feature",
    name = "Stop a cancelled run before touching the provider"
)]
fn scenario_cancelled_run(pipeline_context: PipelineContext) {
    let _ = pipeline_context;
}
