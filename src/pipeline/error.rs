//! Failure type returned by the pipeline.

use std::fmt;

use thiserror::Error;

use super::PipelineStage;

/// Broad classification of a pipeline failure.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ProvisionErrorKind {
    /// The request or the host layout is unusable; retrying will not help.
    Configuration,
    /// The Robot API rejected a call.
    Provider,
    /// A host did not come up in time.
    Reachability,
    /// The SSH transport failed to connect or transfer.
    Transport,
    /// A remote command exited unsuccessfully.
    RemoteCommand,
    /// The run was stopped at a stage boundary.
    Cancelled,
}

impl fmt::Display for ProvisionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Configuration => "configuration",
            Self::Provider => "provider",
            Self::Reachability => "reachability",
            Self::Transport => "transport",
            Self::RemoteCommand => "remote command",
            Self::Cancelled => "cancelled",
        })
    }
}

/// The first fatal failure of a pipeline run.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{summary}: {detail}")]
pub struct ProvisionError {
    /// Stage that failed.
    pub stage: PipelineStage,
    /// Failure classification.
    pub kind: ProvisionErrorKind,
    /// Short, stable summary such as `invalid disk count`.
    pub summary: &'static str,
    /// Human readable detail.
    pub detail: String,
}

impl ProvisionError {
    pub(crate) fn new(
        stage: PipelineStage,
        kind: ProvisionErrorKind,
        summary: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            kind,
            summary,
            detail: detail.into(),
        }
    }

    pub(crate) fn cancelled(stage: PipelineStage) -> Self {
        Self::new(
            stage,
            ProvisionErrorKind::Cancelled,
            "cancelled",
            format!("pipeline cancelled before {stage}"),
        )
    }
}
