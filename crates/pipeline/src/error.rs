use policyline_core::{DiffError, Lane, SnapshotId};
use policyline_storage::StorageError;

use crate::orchestrator::RunId;

/// Errors from [`ArtifactPromoter`](crate::ArtifactPromoter).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PromoteError {
    #[error("cannot promote an unsaved draft (snapshot id {snapshot_id})")]
    UnsavedDraft { snapshot_id: SnapshotId },

    /// The compiler rejected the rule set. The snapshot keeps its format.
    #[error("compilation of snapshot {snapshot_id} failed: {message}")]
    CompilationFailed {
        snapshot_id: SnapshotId,
        message: String,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors from [`DeploymentLedger`](crate::DeploymentLedger).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeployError {
    #[error("percent {percent} is outside 0..=100")]
    InvalidPercent { percent: u8 },

    /// Only a rollback may lower a snapshot's percent on a lane.
    #[error(
        "lane {lane} serves snapshot {snapshot_id} at {current}%; lowering it to {requested}% requires a rollback"
    )]
    NonMonotonic {
        lane: Lane,
        snapshot_id: SnapshotId,
        current: u8,
        requested: u8,
    },

    /// Forward progress may only climb one canary rung at a time.
    #[error(
        "lane {lane} is at {current}%; the next canary rung is {next}%, {requested}% would skip ahead"
    )]
    SkippedRung {
        lane: Lane,
        current: u8,
        next: u8,
        requested: u8,
    },

    /// The lane kept moving under concurrent writers and retries ran out.
    #[error("lane {lane} changed concurrently {attempts} times in a row")]
    LaneConflict { lane: Lane, attempts: u32 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors from [`Pipeline`](crate::Pipeline). Every variant names the run it
/// belongs to.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    /// The step was called out of order.
    #[error("run {run}: {message}")]
    InvalidState { run: RunId, message: String },

    /// The snapshot is not fit for the requested step (wrong format, failed
    /// validation).
    #[error("run {run}: {message}")]
    ValidationPrecondition { run: RunId, message: String },

    #[error("run {run}: the proposal source returned nothing for intent '{intent}'")]
    ProposalGenerationFailed { run: RunId, intent: String },

    #[error("run {run}: {source}")]
    BuildFailed { run: RunId, source: DiffError },

    #[error("run {run}: {source}")]
    CompilationFailed { run: RunId, source: PromoteError },

    #[error("run {run}: persistence failed: {source}")]
    PersistenceFailed { run: RunId, source: StorageError },

    #[error("run {run}: {source}")]
    Deploy { run: RunId, source: DeployError },

    /// A newer run (or a reset) superseded this one while the step was in
    /// flight. Orchestrator state was left untouched.
    #[error("run {run} is stale; run {current} is current")]
    StaleRun { run: RunId, current: RunId },
}

impl PipelineError {
    pub fn run(&self) -> RunId {
        match self {
            PipelineError::InvalidState { run, .. }
            | PipelineError::ValidationPrecondition { run, .. }
            | PipelineError::ProposalGenerationFailed { run, .. }
            | PipelineError::BuildFailed { run, .. }
            | PipelineError::CompilationFailed { run, .. }
            | PipelineError::PersistenceFailed { run, .. }
            | PipelineError::Deploy { run, .. }
            | PipelineError::StaleRun { run, .. } => *run,
        }
    }

    pub(crate) fn from_promote(run: RunId, err: PromoteError) -> Self {
        match err {
            PromoteError::Storage(source) => PipelineError::PersistenceFailed { run, source },
            PromoteError::UnsavedDraft { .. } => PipelineError::InvalidState {
                run,
                message: err.to_string(),
            },
            source @ PromoteError::CompilationFailed { .. } => {
                PipelineError::CompilationFailed { run, source }
            }
        }
    }
}
