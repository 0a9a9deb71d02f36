//! policyline-core: policy snapshot model and pure evolution logic.
//!
//! - [`model`] -- snapshots, rules, proposals, deployments, rollout events
//! - [`diff`] -- the rule diff engine ([`build_snapshot`])
//! - [`ladder`] -- the canary percentage ladder ([`calculate_canary_step`])
//! - [`wire`] -- deployment upsert request/response shapes
//! - [`clock`] -- injectable time source
//!
//! Nothing in this crate performs I/O.

pub mod clock;
pub mod diff;
pub mod digest;
pub mod ladder;
pub mod model;
pub mod wire;

pub use clock::{Clock, ManualClock, SystemClock};
pub use diff::{build_snapshot, BuildOptions, DiffError, MissingRule, RuleSetDiff, SnapshotDraft};
pub use ladder::{calculate_canary_step, CANARY_LADDER};
pub use model::{
    ArtifactFormat, Change, ChangeAction, Condition, Deployment, DeploymentId, Emission, Lane,
    Proposal, RolloutEvent, Rule, RuleId, Snapshot, SnapshotId, ValidationReport, DRAFT_ID,
};
pub use wire::{CurrentState, DeploymentOutcome, DeploymentRequest, PreviousState};
