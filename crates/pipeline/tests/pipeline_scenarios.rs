use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

use policyline_core::{
    ArtifactFormat, Change, ChangeAction, Lane, Proposal, RuleId, SnapshotId,
};
use policyline_pipeline::{
    CompileError, CompileOutput, Compiler, DeployError, DeploymentLedger, DigestCompiler,
    Pipeline, PipelineError, ProposalSource, Stage, StaticProposalSource,
};
use policyline_storage::{MemoryStorage, NewRule, NewSnapshot, PolicyStorage};

// ── Fixtures ────────────────────────────────────────────────────────────────

fn router() -> Lane {
    Lane::new("router", "global")
}

fn snapshot_fields(version: &str) -> NewSnapshot {
    NewSnapshot {
        version: version.to_string(),
        env: "prod".to_string(),
        stage: "draft".to_string(),
        artifact_format: ArtifactFormat::Native,
        checksum: None,
        size_bytes: 0,
        notes: None,
        parent_id: None,
    }
}

fn rule_fields(snapshot_id: SnapshotId, name: &str, priority: i32) -> NewRule {
    NewRule {
        snapshot_id,
        rule_name: name.to_string(),
        priority,
        engine: "wasm".to_string(),
        disabled: false,
        conditions: Vec::new(),
        emissions: Vec::new(),
    }
}

fn create(name: &str, priority: i32) -> Change {
    Change {
        action: ChangeAction::Create,
        rule_id: None,
        rule_data: Some(json!({
            "ruleName": name,
            "priority": priority,
            "emissions": [{"subtaskTypeId": 7, "relationshipType": "blocks", "params": {}}]
        })),
        rationale: format!("add {name}"),
    }
}

fn delete(rule_id: RuleId) -> Change {
    Change {
        action: ChangeAction::Delete,
        rule_id: Some(rule_id),
        rule_data: None,
        rationale: "drop it".to_string(),
    }
}

fn proposal(base: SnapshotId, version: &str, changes: Vec<Change>) -> Proposal {
    Proposal {
        id: 1,
        base_snapshot_id: base,
        new_version: version.to_string(),
        reason: "test".to_string(),
        changes,
    }
}

/// v1 (active in prod, fully rolled out on router/legacy) owning R1 with
/// priority 10.
async fn seed_v1(storage: &Arc<MemoryStorage>) -> (SnapshotId, RuleId) {
    let v1 = storage.create_snapshot(snapshot_fields("v1")).await.unwrap();
    let r1 = storage.create_rule(rule_fields(v1.id, "R1", 10)).await.unwrap();
    let ledger = DeploymentLedger::new(storage.clone());
    let legacy = Lane::new("router", "legacy");
    for _ in 0..4 {
        ledger.advance(v1.id, &legacy, "seed", "").await.unwrap();
    }
    (v1.id, r1.id)
}

fn pipeline(storage: &Arc<MemoryStorage>, source: impl ProposalSource + 'static) -> Pipeline<MemoryStorage> {
    Pipeline::new(storage.clone(), Arc::new(source), Box::new(DigestCompiler))
}

// ── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn negative_priority_rule_blocks_deployment() {
    let storage = Arc::new(MemoryStorage::new());
    let (v1, _) = seed_v1(&storage).await;
    let source = StaticProposalSource::single(proposal(v1, "v2", vec![create("R2", -1)]));
    let pipeline = pipeline(&storage, source);

    pipeline.start_evolution("add R2").await;
    pipeline.propose("").await.unwrap();
    let built = pipeline.build().await.unwrap();
    assert_eq!(built.artifact_format, ArtifactFormat::Native);
    assert_eq!(built.parent_id, Some(v1));
    let promoted = pipeline.promote().await.unwrap();
    assert_eq!(promoted.artifact_format, ArtifactFormat::Wasm);

    let report = pipeline.validate().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.passed, 1);
    assert_eq!(report.conflicts, vec!["Rule R2 has invalid priority".to_string()]);
    assert!(!report.success());
    assert_eq!(pipeline.stage().await, Stage::Validated { passed: false });

    let err = pipeline.deploy(&router(), 5).await.unwrap_err();
    assert!(matches!(err, PipelineError::ValidationPrecondition { .. }), "{err}");
    assert!(storage.list_rollout_events(Some(&router())).await.unwrap().is_empty());
    assert_eq!(pipeline.stage().await, Stage::Validated { passed: false });

    let stored = storage.latest_report(promoted.id).await.unwrap().unwrap();
    assert_eq!(stored, report);
}

#[tokio::test]
async fn canary_rollout_chains_events() {
    let storage = Arc::new(MemoryStorage::new());
    let (v1, r1) = seed_v1(&storage).await;
    let source = StaticProposalSource::single(proposal(
        v1,
        "v2",
        vec![create("R2", 3), delete(r1)],
    ));
    let pipeline = pipeline(&storage, source);

    pipeline.start_evolution("swap R1 for R2").await;
    pipeline.propose("").await.unwrap();
    let built = pipeline.build().await.unwrap();
    let diff = pipeline.diff().await.unwrap();
    assert_eq!(diff.added, vec!["R2".to_string()]);
    assert_eq!(diff.removed, vec!["R1".to_string()]);
    pipeline.promote().await.unwrap();
    assert!(pipeline.validate().await.unwrap().success());

    for percent in [5, 25, 50] {
        let out = pipeline.deploy(&router(), percent).await.unwrap();
        assert!(!out.current.noop);
    }
    assert_eq!(pipeline.stage().await, Stage::Deploying { percent: 50 });

    let events = pipeline.ledger().lane_events(&router()).await.unwrap();
    let chain: Vec<_> = events.iter().map(|e| (e.from_percent, e.to_percent)).collect();
    assert_eq!(chain, vec![(None, 5), (Some(5), 25), (Some(25), 50)]);
    assert!(events.iter().all(|e| !e.is_rollback && e.snapshot_id == built.id));

    let out = pipeline.advance(&router()).await.unwrap();
    assert_eq!(out.current.percent, 100);
    assert_eq!(pipeline.stage().await, Stage::Complete);

    // v2 is now the env's active snapshot; v1 is not.
    let active: Vec<_> = storage
        .list_snapshots()
        .await
        .unwrap()
        .into_iter()
        .filter(|s| s.is_active)
        .map(|s| s.id)
        .collect();
    assert_eq!(active, vec![built.id]);

    // The base snapshot's rules were never touched.
    let base_rules = storage.rules_for_snapshot(v1).await.unwrap();
    assert_eq!(base_rules.len(), 1);
    assert_eq!(base_rules[0].rule_name, "R1");
}

#[tokio::test]
async fn repeat_deploy_is_noop_and_rollback_deactivates() {
    let storage = Arc::new(MemoryStorage::new());
    let (v1, _) = seed_v1(&storage).await;
    let pipeline = pipeline(&storage, StaticProposalSource::default());

    pipeline.start_evolution("redeploy v1").await;
    pipeline.select_snapshot(v1).await.unwrap();
    pipeline.deploy(&router(), 5).await.unwrap();
    pipeline.deploy(&router(), 25).await.unwrap();
    let again = pipeline.deploy(&router(), 25).await.unwrap();
    assert!(again.current.noop);
    assert_eq!(pipeline.ledger().lane_events(&router()).await.unwrap().len(), 2);

    let out = pipeline.rollback(&router()).await.unwrap();
    assert_eq!(out.current.percent, 0);
    assert!(!out.current.is_active);
    assert_eq!(pipeline.stage().await, Stage::RolledBack);
    assert!(pipeline.ledger().active_deployment(&router()).await.unwrap().is_none());
}

#[tokio::test]
async fn bootstrap_builds_from_nothing() {
    let storage = Arc::new(MemoryStorage::new());
    let source = StaticProposalSource::single(proposal(0, "v1", vec![create("R1", 1)]));
    let pipeline = pipeline(&storage, source);

    let run = pipeline.initialize().await;
    assert_eq!(run, 1);
    pipeline.propose("").await.unwrap();
    let snapshot = pipeline.build().await.unwrap();
    assert!(snapshot.id > 0);
    assert_eq!(snapshot.parent_id, None);
    let rules = storage.rules_for_snapshot(snapshot.id).await.unwrap();
    assert_eq!(rules.len(), 1);
    assert!(!rules[0].disabled);
}

// ── Ordering and failures ───────────────────────────────────────────────────

#[tokio::test]
async fn steps_refuse_to_run_out_of_order() {
    let storage = Arc::new(MemoryStorage::new());
    let pipeline = pipeline(&storage, StaticProposalSource::default());

    let err = pipeline.propose("").await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidState { run: 0, .. }));

    pipeline.start_evolution("x").await;
    for err in [
        pipeline.build().await.unwrap_err(),
        pipeline.promote().await.unwrap_err(),
        pipeline.validate().await.unwrap_err(),
        pipeline.deploy(&router(), 5).await.unwrap_err(),
        pipeline.rollback(&router()).await.unwrap_err(),
    ] {
        assert!(matches!(err, PipelineError::InvalidState { run: 1, .. }), "{err}");
    }
    assert_eq!(pipeline.stage().await, Stage::Idle);
}

#[tokio::test]
async fn empty_source_fails_the_proposal_step() {
    let storage = Arc::new(MemoryStorage::new());
    let pipeline = pipeline(&storage, StaticProposalSource::default());
    let run = pipeline.start_evolution("anything").await;
    let err = pipeline.propose("").await.unwrap_err();
    assert_eq!(
        err,
        PipelineError::ProposalGenerationFailed {
            run,
            intent: "anything".to_string()
        }
    );
    assert_eq!(pipeline.stage().await, Stage::Idle);
}

#[tokio::test]
async fn validation_requires_wasm() {
    let storage = Arc::new(MemoryStorage::new());
    let (v1, _) = seed_v1(&storage).await;
    let pipeline = pipeline(&storage, StaticProposalSource::default());
    pipeline.start_evolution("inspect v1").await;
    pipeline.select_snapshot(v1).await.unwrap();
    let err = pipeline.validate().await.unwrap_err();
    assert!(matches!(err, PipelineError::ValidationPrecondition { .. }), "{err}");
    assert_eq!(pipeline.stage().await, Stage::Selected);
}

#[tokio::test]
async fn duplicate_version_is_a_persistence_failure() {
    let storage = Arc::new(MemoryStorage::new());
    let (v1, _) = seed_v1(&storage).await;
    let source = StaticProposalSource::single(proposal(v1, "v1", vec![]));
    let pipeline = pipeline(&storage, source);
    pipeline.start_evolution("x").await;
    pipeline.propose("").await.unwrap();
    let err = pipeline.build().await.unwrap_err();
    assert!(matches!(err, PipelineError::PersistenceFailed { .. }), "{err}");
    assert_eq!(pipeline.stage().await, Stage::Proposed);
}

struct Broken;

#[async_trait]
impl Compiler for Broken {
    async fn compile(&self, _: SnapshotId, _: &[policyline_core::Rule]) -> Result<CompileOutput, CompileError> {
        Err(CompileError("linker exploded".to_string()))
    }
}

#[tokio::test]
async fn compile_failure_keeps_the_run_at_built() {
    let storage = Arc::new(MemoryStorage::new());
    let source = StaticProposalSource::single(proposal(0, "v1", vec![create("R1", 1)]));
    let pipeline = Pipeline::new(storage.clone(), Arc::new(source), Box::new(Broken));
    pipeline.initialize().await;
    pipeline.propose("").await.unwrap();
    let built = pipeline.build().await.unwrap();
    let err = pipeline.promote().await.unwrap_err();
    assert!(matches!(err, PipelineError::CompilationFailed { .. }), "{err}");
    assert_eq!(pipeline.stage().await, Stage::Built);
    let stored = storage.get_snapshot(built.id).await.unwrap();
    assert_eq!(stored.artifact_format, ArtifactFormat::Native);
}

#[tokio::test]
async fn non_monotonic_deploy_surfaces_ledger_error() {
    let storage = Arc::new(MemoryStorage::new());
    let (v1, _) = seed_v1(&storage).await;
    let pipeline = pipeline(&storage, StaticProposalSource::default());
    pipeline.start_evolution("x").await;
    pipeline.select_snapshot(v1).await.unwrap();
    for percent in [5, 25, 50] {
        pipeline.deploy(&router(), percent).await.unwrap();
    }
    let err = pipeline.deploy(&router(), 25).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Deploy {
            source: DeployError::NonMonotonic { .. },
            ..
        }
    ));
    assert_eq!(pipeline.stage().await, Stage::Deploying { percent: 50 });
}

#[tokio::test]
async fn deploy_cannot_skip_canary_rungs() {
    let storage = Arc::new(MemoryStorage::new());
    let (v1, _) = seed_v1(&storage).await;
    let pipeline = pipeline(&storage, StaticProposalSource::default());
    pipeline.start_evolution("x").await;
    pipeline.select_snapshot(v1).await.unwrap();

    let err = pipeline.deploy(&router(), 100).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Deploy {
            source: DeployError::SkippedRung {
                current: 0,
                next: 5,
                requested: 100,
                ..
            },
            ..
        }
    ));
    assert_eq!(pipeline.stage().await, Stage::Selected);
    assert!(storage.list_rollout_events(Some(&router())).await.unwrap().is_empty());

    let out = pipeline.deploy(&router(), 5).await.unwrap();
    assert_eq!(out.current.percent, 5);
    assert_eq!(pipeline.stage().await, Stage::Deploying { percent: 5 });
}

#[tokio::test]
async fn rolling_back_the_last_lane_deactivates_the_snapshot() {
    let storage = Arc::new(MemoryStorage::new());
    let (v1, _) = seed_v1(&storage).await;
    let pipeline = pipeline(&storage, StaticProposalSource::default());
    pipeline.start_evolution("pull v1").await;
    pipeline.select_snapshot(v1).await.unwrap();
    pipeline.rollback(&Lane::new("router", "legacy")).await.unwrap();

    let v1_row = storage.get_snapshot(v1).await.unwrap();
    assert!(!v1_row.is_active);
}

// ── Stale runs ──────────────────────────────────────────────────────────────

/// Source that parks until released, so a test can supersede the run.
struct Gated {
    entered: Notify,
    release: Notify,
    proposal: Proposal,
}

#[async_trait]
impl ProposalSource for Gated {
    async fn generate_proposal(&self, _: &str, _: Option<&str>, _: &str) -> Option<Proposal> {
        self.entered.notify_one();
        self.release.notified().await;
        Some(self.proposal.clone())
    }
}

#[tokio::test]
async fn superseded_run_result_is_discarded() {
    let storage = Arc::new(MemoryStorage::new());
    let gated = Arc::new(Gated {
        entered: Notify::new(),
        release: Notify::new(),
        proposal: proposal(0, "v1", vec![create("R1", 1)]),
    });
    let pipeline = Arc::new(Pipeline::new(
        storage.clone(),
        gated.clone(),
        Box::new(DigestCompiler),
    ));

    let first = pipeline.start_evolution("first").await;
    let in_flight = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.propose("").await })
    };
    gated.entered.notified().await;
    let second = pipeline.reset().await;
    gated.release.notify_one();

    let err = in_flight.await.unwrap().unwrap_err();
    assert_eq!(
        err,
        PipelineError::StaleRun {
            run: first,
            current: second
        }
    );
    assert_eq!(pipeline.stage().await, Stage::Idle);
    assert_eq!(pipeline.run_id().await, second);
}
