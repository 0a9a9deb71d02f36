//! policyline-pipeline: the stateful half of policy evolution.
//!
//! - [`promoter`] -- native → wasm artifact promotion through a [`Compiler`]
//! - [`gate`] -- the validation gate and its pluggable [`RuleCheck`]s
//! - [`ledger`] -- per-lane deployments, canary progression and rollback
//! - [`orchestrator`] -- the run-scoped [`Pipeline`] tying them together
//! - [`source`] -- the [`ProposalSource`] collaborator

pub mod error;
pub mod gate;
pub mod ledger;
pub mod orchestrator;
pub mod promoter;
pub mod source;

pub use error::{DeployError, PipelineError, PromoteError};
pub use gate::{DuplicateRuleName, EmptyEmissions, NegativePriority, RuleCheck, ValidationGate};
pub use ledger::{DeploymentLedger, DEFAULT_MAX_LANE_RETRIES};
pub use orchestrator::{Pipeline, PipelineSettings, RunId, Stage};
pub use promoter::{ArtifactPromoter, CompileError, CompileOutput, Compiler, DigestCompiler};
pub use source::{ProposalSource, StaticProposalSource};
