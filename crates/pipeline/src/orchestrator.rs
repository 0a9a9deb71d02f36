//! The evolution pipeline.
//!
//! ```text
//! Idle → Proposed → Built → Promoted → Validated{passed}
//!      → Deploying{percent} → Complete | RolledBack
//! ```
//!
//! A run starts with [`Pipeline::start_evolution`] or [`Pipeline::initialize`]
//! and is identified by a generation number kept under the same lock as the
//! stage. Steps release the lock while they talk to collaborators and re-check
//! the generation before touching state again; a step whose run was
//! superseded returns [`PipelineError::StaleRun`] and changes nothing.
//! Anything it already persisted stays valid.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use policyline_core::{
    build_snapshot, ArtifactFormat, BuildOptions, DeploymentOutcome, DeploymentRequest, Lane,
    Proposal, Rule, RuleSetDiff, Snapshot, SnapshotId, ValidationReport,
};
use policyline_storage::{NewRule, NewSnapshot, PolicyStorage, StorageError};

use crate::error::PipelineError;
use crate::gate::ValidationGate;
use crate::ledger::DeploymentLedger;
use crate::promoter::{ArtifactPromoter, Compiler};
use crate::source::ProposalSource;

/// Generation number of a pipeline run. `0` means no run has started.
pub type RunId = u64;

const BOOTSTRAP_INTENT: &str = "bootstrap";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "stage", rename_all = "camelCase")]
pub enum Stage {
    #[default]
    Idle,
    Proposed,
    /// Persisted, still native.
    Built,
    /// Compiled to wasm.
    Promoted,
    Validated { passed: bool },
    /// An operator picked an existing snapshot instead of building one.
    Selected,
    Deploying { percent: u8 },
    Complete,
    RolledBack,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Idle => write!(f, "idle"),
            Stage::Proposed => write!(f, "proposed"),
            Stage::Built => write!(f, "built"),
            Stage::Promoted => write!(f, "promoted"),
            Stage::Validated { passed: true } => write!(f, "validated (pass)"),
            Stage::Validated { passed: false } => write!(f, "validated (fail)"),
            Stage::Selected => write!(f, "selected"),
            Stage::Deploying { percent } => write!(f, "deploying at {}%", percent),
            Stage::Complete => write!(f, "complete"),
            Stage::RolledBack => write!(f, "rolled back"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub build: BuildOptions,
    /// Recorded as `activated_by` on every deployment the pipeline makes.
    pub activated_by: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            build: BuildOptions::default(),
            activated_by: "pipeline".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct RunState {
    generation: RunId,
    stage: Stage,
    intent: Option<String>,
    bootstrap: bool,
    proposal: Option<Proposal>,
    snapshot: Option<Snapshot>,
    rules: Vec<Rule>,
    diff: Option<RuleSetDiff>,
    report: Option<ValidationReport>,
}

impl RunState {
    /// Drop everything and mint the next generation.
    fn restart(&mut self) -> RunId {
        let generation = self.generation + 1;
        *self = RunState {
            generation,
            ..RunState::default()
        };
        generation
    }

    fn ensure_current(&self, run: RunId) -> Result<(), PipelineError> {
        if self.generation != run {
            tracing::warn!(run, current = self.generation, "discarding result of a stale run");
            return Err(PipelineError::StaleRun {
                run,
                current: self.generation,
            });
        }
        Ok(())
    }

    fn ensure_started(&self) -> Result<RunId, PipelineError> {
        if self.generation == 0 {
            return Err(PipelineError::InvalidState {
                run: 0,
                message: "no run started; call start_evolution or initialize first".to_string(),
            });
        }
        Ok(self.generation)
    }

    fn out_of_order(&self, step: &str) -> PipelineError {
        PipelineError::InvalidState {
            run: self.generation,
            message: format!("cannot {} while {}", step, self.stage),
        }
    }

    fn current_snapshot(&self, step: &str) -> Result<Snapshot, PipelineError> {
        self.snapshot.clone().ok_or_else(|| self.out_of_order(step))
    }
}

fn persistence(run: RunId) -> impl FnOnce(StorageError) -> PipelineError {
    move |source| PipelineError::PersistenceFailed { run, source }
}

pub struct Pipeline<S> {
    storage: Arc<S>,
    source: Arc<dyn ProposalSource>,
    promoter: ArtifactPromoter,
    gate: ValidationGate,
    ledger: DeploymentLedger<S>,
    settings: PipelineSettings,
    state: Mutex<RunState>,
}

impl<S: PolicyStorage> Pipeline<S> {
    pub fn new(
        storage: Arc<S>,
        source: Arc<dyn ProposalSource>,
        compiler: Box<dyn Compiler>,
    ) -> Self {
        Self {
            ledger: DeploymentLedger::new(storage.clone()),
            storage,
            source,
            promoter: ArtifactPromoter::new(compiler),
            gate: ValidationGate::new(),
            settings: PipelineSettings::default(),
            state: Mutex::new(RunState::default()),
        }
    }

    pub fn with_gate(mut self, gate: ValidationGate) -> Self {
        self.gate = gate;
        self
    }

    /// Replace the ledger. It should wrap the same storage as the pipeline.
    pub fn with_ledger(mut self, ledger: DeploymentLedger<S>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn ledger(&self) -> &DeploymentLedger<S> {
        &self.ledger
    }

    // ── Run lifecycle ─────────────────────────────────────────────────────────

    /// Start an evolution run for `intent`, abandoning any run in flight.
    pub async fn start_evolution(&self, intent: &str) -> RunId {
        let mut state = self.state.lock().await;
        let run = state.restart();
        state.intent = Some(intent.to_string());
        tracing::info!(run, intent, "evolution run started");
        run
    }

    /// Start a bootstrap run: the proposal builds the first snapshot from
    /// nothing.
    pub async fn initialize(&self) -> RunId {
        let mut state = self.state.lock().await;
        let run = state.restart();
        state.intent = Some(BOOTSTRAP_INTENT.to_string());
        state.bootstrap = true;
        tracing::info!(run, "bootstrap run started");
        run
    }

    /// Clear all run state and mint a new generation. Results of steps still
    /// in flight will be discarded.
    pub async fn reset(&self) -> RunId {
        let run = self.state.lock().await.restart();
        tracing::info!(run, "pipeline reset");
        run
    }

    pub async fn stage(&self) -> Stage {
        self.state.lock().await.stage
    }

    pub async fn run_id(&self) -> RunId {
        self.state.lock().await.generation
    }

    pub async fn snapshot(&self) -> Option<Snapshot> {
        self.state.lock().await.snapshot.clone()
    }

    pub async fn report(&self) -> Option<ValidationReport> {
        self.state.lock().await.report.clone()
    }

    pub async fn diff(&self) -> Option<RuleSetDiff> {
        self.state.lock().await.diff.clone()
    }

    // ── Steps ─────────────────────────────────────────────────────────────────

    /// Ask the proposal source for a change-set against the env's active
    /// snapshot (or against nothing, for a bootstrap run).
    pub async fn propose(&self, context: &str) -> Result<Proposal, PipelineError> {
        let (run, intent, bootstrap) = {
            let state = self.state.lock().await;
            let run = state.ensure_started()?;
            if state.stage != Stage::Idle {
                return Err(state.out_of_order("propose"));
            }
            let intent = state.intent.clone().unwrap_or_default();
            (run, intent, state.bootstrap)
        };

        let base = if bootstrap {
            None
        } else {
            self.active_snapshot().await.map_err(persistence(run))?
        };
        let base_version = base.as_ref().map(|s| s.version.as_str());
        tracing::debug!(run, base_version, "requesting proposal");

        let proposal = self
            .source
            .generate_proposal(&intent, base_version, context)
            .await
            .ok_or_else(|| PipelineError::ProposalGenerationFailed {
                run,
                intent: intent.clone(),
            })?;

        let mut state = self.state.lock().await;
        state.ensure_current(run)?;
        tracing::info!(
            run,
            version = %proposal.new_version,
            changes = proposal.changes.len(),
            "proposal accepted"
        );
        state.proposal = Some(proposal.clone());
        state.stage = Stage::Proposed;
        Ok(proposal)
    }

    /// Apply the proposal to its base rules and persist the result as a
    /// native snapshot.
    pub async fn build(&self) -> Result<Snapshot, PipelineError> {
        let (run, proposal) = {
            let state = self.state.lock().await;
            let run = state.ensure_started()?;
            match (&state.stage, &state.proposal) {
                (Stage::Proposed, Some(proposal)) => (run, proposal.clone()),
                _ => return Err(state.out_of_order("build")),
            }
        };

        let base_rules = if proposal.base_snapshot_id > 0 {
            self.storage
                .rules_for_snapshot(proposal.base_snapshot_id)
                .await
                .map_err(persistence(run))?
        } else {
            Vec::new()
        };
        let draft = build_snapshot(&proposal, &base_rules, &self.settings.build)
            .map_err(|source| PipelineError::BuildFailed { run, source })?;
        let (snapshot, rules) = self
            .persist(&draft.snapshot, &draft.rules)
            .await
            .map_err(persistence(run))?;

        let mut state = self.state.lock().await;
        state.ensure_current(run)?;
        tracing::info!(
            run,
            snapshot_id = snapshot.id,
            added = draft.diff.added.len(),
            removed = draft.diff.removed.len(),
            modified = draft.diff.modified.len(),
            "snapshot built"
        );
        state.snapshot = Some(snapshot.clone());
        state.rules = rules;
        state.diff = Some(draft.diff);
        state.stage = Stage::Built;
        Ok(snapshot)
    }

    /// Compile the built snapshot to wasm.
    pub async fn promote(&self) -> Result<Snapshot, PipelineError> {
        let (run, snapshot, rules) = {
            let state = self.state.lock().await;
            let run = state.ensure_started()?;
            if state.stage != Stage::Built {
                return Err(state.out_of_order("promote"));
            }
            (run, state.current_snapshot("promote")?, state.rules.clone())
        };

        let promoted = self
            .promoter
            .promote(self.storage.as_ref(), &snapshot, &rules)
            .await
            .map_err(|e| PipelineError::from_promote(run, e))?;

        let mut state = self.state.lock().await;
        state.ensure_current(run)?;
        state.snapshot = Some(promoted.clone());
        state.stage = Stage::Promoted;
        Ok(promoted)
    }

    /// Run the validation gate over the current snapshot and persist the
    /// report. Requires a wasm snapshot.
    pub async fn validate(&self) -> Result<ValidationReport, PipelineError> {
        let (run, snapshot, rules) = {
            let state = self.state.lock().await;
            let run = state.ensure_started()?;
            if !matches!(
                state.stage,
                Stage::Promoted | Stage::Validated { .. } | Stage::Selected
            ) {
                return Err(state.out_of_order("validate"));
            }
            (run, state.current_snapshot("validate")?, state.rules.clone())
        };

        if snapshot.artifact_format != ArtifactFormat::Wasm {
            return Err(PipelineError::ValidationPrecondition {
                run,
                message: format!(
                    "snapshot {} is {}; validation requires wasm",
                    snapshot.id, snapshot.artifact_format
                ),
            });
        }

        let report = self.gate.run(snapshot.id, &rules);
        self.storage
            .insert_validation_report(report.clone())
            .await
            .map_err(persistence(run))?;

        let mut state = self.state.lock().await;
        state.ensure_current(run)?;
        state.stage = Stage::Validated {
            passed: report.success(),
        };
        state.report = Some(report.clone());
        Ok(report)
    }

    /// Adopt an existing snapshot for deployment, skipping build and
    /// validation.
    pub async fn select_snapshot(&self, snapshot_id: SnapshotId) -> Result<Snapshot, PipelineError> {
        let run = self.state.lock().await.ensure_started()?;

        let snapshot = self
            .storage
            .get_snapshot(snapshot_id)
            .await
            .map_err(persistence(run))?;
        let rules = self
            .storage
            .rules_for_snapshot(snapshot_id)
            .await
            .map_err(persistence(run))?;

        let mut state = self.state.lock().await;
        state.ensure_current(run)?;
        tracing::info!(run, snapshot_id, version = %snapshot.version, "snapshot selected by operator");
        state.snapshot = Some(snapshot.clone());
        state.rules = rules;
        state.report = None;
        state.stage = Stage::Selected;
        Ok(snapshot)
    }

    /// Put the current snapshot on `lane` at `percent`. The ledger refuses
    /// anything above the next canary rung, so this cannot skip ahead.
    pub async fn deploy(&self, lane: &Lane, percent: u8) -> Result<DeploymentOutcome, PipelineError> {
        let (run, snapshot_id) = self.deployable("deploy").await?;
        if percent == 0 {
            return Err(PipelineError::InvalidState {
                run,
                message: "deploying 0% is a rollback; use rollback".to_string(),
            });
        }
        let request =
            DeploymentRequest::new(snapshot_id, lane, percent, &self.settings.activated_by);
        let outcome = self
            .ledger
            .create_or_update(&request)
            .await
            .map_err(|source| PipelineError::Deploy { run, source })?;
        self.record_rollout(run, lane, &outcome).await?;
        Ok(outcome)
    }

    /// Move the current snapshot one rung up the canary ladder on `lane`.
    pub async fn advance(&self, lane: &Lane) -> Result<DeploymentOutcome, PipelineError> {
        let (run, snapshot_id) = self.deployable("advance").await?;
        let outcome = self
            .ledger
            .advance(snapshot_id, lane, &self.settings.activated_by, "")
            .await
            .map_err(|source| PipelineError::Deploy { run, source })?;
        self.record_rollout(run, lane, &outcome).await?;
        Ok(outcome)
    }

    /// Take `lane` back to 0% for the current snapshot.
    pub async fn rollback(&self, lane: &Lane) -> Result<DeploymentOutcome, PipelineError> {
        let (run, snapshot_id) = {
            let state = self.state.lock().await;
            let run = state.ensure_started()?;
            (run, state.current_snapshot("rollback")?.id)
        };
        let outcome = self
            .ledger
            .rollback(snapshot_id, lane, &self.settings.activated_by)
            .await
            .map_err(|source| PipelineError::Deploy { run, source })?;

        let mut state = self.state.lock().await;
        state.ensure_current(run)?;
        tracing::info!(run, %lane, snapshot_id, "run rolled back");
        state.stage = Stage::RolledBack;
        Ok(outcome)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    /// Run id and snapshot id if the current stage allows traffic.
    async fn deployable(&self, step: &str) -> Result<(RunId, SnapshotId), PipelineError> {
        let state = self.state.lock().await;
        let run = state.ensure_started()?;
        match state.stage {
            Stage::Validated { passed: true }
            | Stage::Selected
            | Stage::Deploying { .. }
            | Stage::Complete => Ok((run, state.current_snapshot(step)?.id)),
            Stage::Validated { passed: false } => {
                let conflicts = state.report.as_ref().map_or(0, |r| r.conflicts.len());
                Err(PipelineError::ValidationPrecondition {
                    run,
                    message: format!(
                        "validation failed with {} conflict(s); {} refused",
                        conflicts, step
                    ),
                })
            }
            _ => Err(state.out_of_order(step)),
        }
    }

    async fn record_rollout(
        &self,
        run: RunId,
        lane: &Lane,
        outcome: &DeploymentOutcome,
    ) -> Result<(), PipelineError> {
        let mut state = self.state.lock().await;
        state.ensure_current(run)?;
        let percent = outcome.current.percent;
        tracing::info!(run, %lane, percent, noop = outcome.current.noop, "rollout step");
        state.stage = if percent >= 100 {
            Stage::Complete
        } else {
            Stage::Deploying { percent }
        };
        Ok(())
    }

    async fn active_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        let env = &self.settings.build.env;
        Ok(self
            .storage
            .list_snapshots()
            .await?
            .into_iter()
            .find(|s| s.is_active && &s.env == env))
    }

    /// Store a draft and its rules in one write. Rules get fresh ids from the
    /// store; a failure leaves nothing behind, so the build can be retried.
    async fn persist(
        &self,
        draft: &Snapshot,
        rules: &[Rule],
    ) -> Result<(Snapshot, Vec<Rule>), StorageError> {
        let fields = rules
            .iter()
            .map(|rule| NewRule::from_rule(draft.id, rule))
            .collect();
        self.storage
            .create_snapshot_with_rules(NewSnapshot::from_snapshot(draft), fields)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_clears_state_and_bumps_generation() {
        let mut state = RunState {
            generation: 4,
            stage: Stage::Built,
            intent: Some("x".to_string()),
            bootstrap: true,
            ..RunState::default()
        };
        assert_eq!(state.restart(), 5);
        assert_eq!(state.stage, Stage::Idle);
        assert!(state.intent.is_none() && !state.bootstrap);
    }

    #[test]
    fn stale_generation_is_rejected() {
        let state = RunState {
            generation: 2,
            ..RunState::default()
        };
        assert!(state.ensure_current(2).is_ok());
        assert_eq!(
            state.ensure_current(1),
            Err(PipelineError::StaleRun { run: 1, current: 2 })
        );
    }

    #[test]
    fn stage_serializes_with_a_tag() {
        let json = serde_json::to_value(Stage::Deploying { percent: 25 }).unwrap();
        assert_eq!(json, serde_json::json!({"stage": "deploying", "percent": 25}));
        let idle = serde_json::to_value(Stage::Idle).unwrap();
        assert_eq!(idle, serde_json::json!({"stage": "idle"}));
    }
}
