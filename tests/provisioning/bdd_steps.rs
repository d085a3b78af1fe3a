//! BDD step definitions for the provisioning pipeline.

use hrobot::pipeline::{DETACHED_REBOOT_COMMAND, PipelineStage, ProvisioningPipeline};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{
    PipelineContext, RunOutcome, SERVER_NUMBER, disk_listing, fast_settings,
};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a server with {count:usize} disks in rescue")]
fn server_in_rescue(pipeline_context: &PipelineContext, count: usize) {
    pipeline_context.runner.push_success(); // session probe
    pipeline_context
        .runner
        .push_output(Some(0), &disk_listing(count), "");
    // uploads, chmod, installimage, reboot, probe, upload, initialize, reboot
    pipeline_context.runner.push_successes(9);
}

#[given("a provisioning run that has been cancelled")]
fn cancelled_run(pipeline_context: &PipelineContext) {
    pipeline_context.cancel.cancel();
}

#[when("the pipeline runs from rescue activation")]
fn run_pipeline(pipeline_context: &PipelineContext) -> Result<(), StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let pipeline = ProvisioningPipeline::new(
        &pipeline_context.api,
        pipeline_context.runner.clone(),
        pipeline_context.session_config(),
        fast_settings(),
    )
    .with_cancellation(pipeline_context.cancel.clone())
    .with_observer(&pipeline_context.stages);
    let request = pipeline_context.request();
    let result =
        runtime.block_on(async { pipeline.run(&request, PipelineStage::RescueActivate).await });
    let outcome = match result {
        Ok(()) => RunOutcome::Completed,
        Err(err) => RunOutcome::Failed(err),
    };
    pipeline_context.outcome.replace(Some(outcome));
    Ok(())
}

#[then("every stage completes in order")]
fn every_stage_completes(pipeline_context: &PipelineContext) -> Result<(), StepError> {
    let outcome = pipeline_context.outcome.borrow();
    if !matches!(*outcome, Some(RunOutcome::Completed)) {
        return Err(StepError::Assertion(format!("expected success, got {outcome:?}")));
    }
    let stages = pipeline_context.stages.stages.borrow();
    if *stages == PipelineStage::ALL.to_vec() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("unexpected stage order: {stages:?}")))
    }
}

#[then("the installed system is rebooted after first boot")]
fn rebooted_after_first_boot(pipeline_context: &PipelineContext) -> Result<(), StepError> {
    let invocations = pipeline_context.runner.invocations();
    let last = invocations
        .last()
        .map(hrobot::test_support::CommandInvocation::remote_command)
        .ok_or_else(|| StepError::Assertion(String::from("no commands were run")))?;
    if last != DETACHED_REBOOT_COMMAND {
        return Err(StepError::Assertion(format!("last command was {last}")));
    }
    let expected = vec![
        format!("activate_rescue {SERVER_NUMBER} 11:22:33:44"),
        format!("reset {SERVER_NUMBER} hw"),
    ];
    let calls = pipeline_context.api.calls();
    if calls == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("unexpected provider calls: {calls:?}")))
    }
}

#[then("the pipeline fails at \"{stage}\" with \"{summary}\"")]
fn pipeline_fails(
    pipeline_context: &PipelineContext,
    stage: String,
    summary: String,
) -> Result<(), StepError> {
    let outcome = pipeline_context.outcome.borrow();
    let Some(RunOutcome::Failed(ref err)) = *outcome else {
        return Err(StepError::Assertion(format!("expected failure, got {outcome:?}")));
    };
    if err.stage.as_str() == stage && err.summary == summary {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {summary} at {stage}, got {} at {}",
            err.summary, err.stage
        )))
    }
}

#[then("nothing is uploaded to the host")]
fn nothing_uploaded(pipeline_context: &PipelineContext) -> Result<(), StepError> {
    let uploads = pipeline_context
        .runner
        .invocations()
        .iter()
        .filter(|invocation| invocation.input.is_some())
        .count();
    if uploads == 0 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("{uploads} files were uploaded")))
    }
}

#[then("the provider is never called")]
fn provider_never_called(pipeline_context: &PipelineContext) -> Result<(), StepError> {
    let calls = pipeline_context.api.calls();
    if calls.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("unexpected provider calls: {calls:?}")))
    }
}
