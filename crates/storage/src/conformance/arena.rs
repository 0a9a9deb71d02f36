//! Snapshot and rule arena conformance tests.

use std::collections::BTreeSet;
use std::future::Future;

use policyline_core::{ArtifactFormat, ValidationReport};

use super::{make_rule, make_snapshot, seed_snapshot, TestResult};
use crate::record::SubtaskRemap;
use crate::{PolicyStorage, StorageError};

pub(super) async fn run_arena_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "arena",
        "create_snapshot_assigns_positive_id",
        create_snapshot_assigns_positive_id(factory).await,
    ));
    results.push(TestResult::from_result(
        "arena",
        "duplicate_version_rejected",
        duplicate_version_rejected(factory).await,
    ));
    results.push(TestResult::from_result(
        "arena",
        "snapshot_with_rules_all_or_nothing",
        snapshot_with_rules_all_or_nothing(factory).await,
    ));
    results.push(TestResult::from_result(
        "arena",
        "rules_scoped_to_snapshot",
        rules_scoped_to_snapshot(factory).await,
    ));
    results.push(TestResult::from_result(
        "arena",
        "rule_arrays_keep_order",
        rule_arrays_keep_order(factory).await,
    ));
    results.push(TestResult::from_result(
        "arena",
        "clone_duplicates_rules_under_fresh_ids",
        clone_duplicates_rules_under_fresh_ids(factory).await,
    ));
    results.push(TestResult::from_result(
        "arena",
        "clone_applies_subtask_remap",
        clone_applies_subtask_remap(factory).await,
    ));
    results.push(TestResult::from_result(
        "arena",
        "record_promotion_sets_wasm",
        record_promotion_sets_wasm(factory).await,
    ));
    results.push(TestResult::from_result(
        "arena",
        "latest_report_is_newest",
        latest_report_is_newest(factory).await,
    ));

    results
}

async fn create_snapshot_assigns_positive_id<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let a = s
        .create_snapshot(make_snapshot("v1"))
        .await
        .map_err(|e| format!("create v1: {e}"))?;
    let b = s
        .create_snapshot(make_snapshot("v2"))
        .await
        .map_err(|e| format!("create v2: {e}"))?;
    if a.id < 1 || b.id < 1 {
        return Err(format!("expected positive ids, got {} and {}", a.id, b.id));
    }
    if a.id == b.id {
        return Err(format!("ids collide: {}", a.id));
    }
    if a.is_active {
        return Err("new snapshot must not be active".to_string());
    }
    if a.created_at.is_none() {
        return Err("created_at not stamped".to_string());
    }
    let listed = s.list_snapshots().await.map_err(|e| format!("list: {e}"))?;
    if listed.len() != 2 {
        return Err(format!("expected 2 snapshots, got {}", listed.len()));
    }
    Ok(())
}

async fn duplicate_version_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_snapshot(&s, "v1").await?;
    match s.create_snapshot(make_snapshot("v1")).await {
        Err(StorageError::DuplicateVersion { version }) if version == "v1" => Ok(()),
        other => Err(format!("expected DuplicateVersion(v1), got {:?}", other)),
    }
}

async fn snapshot_with_rules_all_or_nothing<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s
        .create_snapshot_with_rules(
            make_snapshot("v1"),
            vec![make_rule(0, "R1", 1), make_rule(0, "R1", 2)],
        )
        .await
    {
        Err(StorageError::DuplicateRuleName { rule_name, .. }) if rule_name == "R1" => {}
        other => return Err(format!("expected DuplicateRuleName(R1), got {:?}", other)),
    }
    let left = s.list_snapshots().await.map_err(|e| format!("list: {e}"))?;
    let rules = s.list_rules().await.map_err(|e| format!("list_rules: {e}"))?;
    if !left.is_empty() || !rules.is_empty() {
        return Err(format!(
            "failed write left {} snapshot(s) and {} rule(s) behind",
            left.len(),
            rules.len()
        ));
    }

    let (snapshot, stored) = s
        .create_snapshot_with_rules(
            make_snapshot("v1"),
            vec![make_rule(0, "R1", 1), make_rule(0, "R2", 2)],
        )
        .await
        .map_err(|e| format!("retry: {e}"))?;
    let names: Vec<_> = stored.iter().map(|r| r.rule_name.as_str()).collect();
    if names != ["R1", "R2"] || stored.iter().any(|r| r.snapshot_id != snapshot.id) {
        return Err(format!("unexpected rules {:?} for snapshot {}", names, snapshot.id));
    }
    let listed = s
        .rules_for_snapshot(snapshot.id)
        .await
        .map_err(|e| format!("rules_for_snapshot: {e}"))?;
    if listed != stored {
        return Err("stored rules differ from the returned ones".to_string());
    }
    Ok(())
}

async fn rules_scoped_to_snapshot<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let a = seed_snapshot(&s, "v1").await?;
    let b = seed_snapshot(&s, "v2").await?;
    for (snap, name) in [(a, "R1"), (a, "R2"), (b, "R1")] {
        s.create_rule(make_rule(snap, name, 1))
            .await
            .map_err(|e| format!("create_rule {name}@{snap}: {e}"))?;
    }

    let of_a = s
        .rules_for_snapshot(a)
        .await
        .map_err(|e| format!("rules_for_snapshot: {e}"))?;
    let names: Vec<_> = of_a.iter().map(|r| r.rule_name.as_str()).collect();
    if names != ["R1", "R2"] {
        return Err(format!("expected [R1, R2] for snapshot a, got {:?}", names));
    }
    if of_a.iter().any(|r| r.snapshot_id != a) {
        return Err("rule listed under the wrong snapshot".to_string());
    }

    let all = s.list_rules().await.map_err(|e| format!("list_rules: {e}"))?;
    let ids: BTreeSet<_> = all.iter().map(|r| r.id).collect();
    if all.len() != 3 || ids.len() != 3 {
        return Err(format!("expected 3 distinct rules, got {}", all.len()));
    }
    Ok(())
}

async fn rule_arrays_keep_order<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let a = seed_snapshot(&s, "v1").await?;
    let created = s
        .create_rule(make_rule(a, "R1", 1))
        .await
        .map_err(|e| format!("create_rule: {e}"))?;
    let keys: Vec<_> = created.conditions.iter().map(|c| c.key.as_str()).collect();
    let subtasks: Vec<_> = created.emissions.iter().map(|e| e.subtask_type_id).collect();
    if keys != ["queue", "tier"] || subtasks != [10, 11] {
        return Err(format!(
            "order lost: conditions {:?}, emissions {:?}",
            keys, subtasks
        ));
    }
    Ok(())
}

async fn clone_duplicates_rules_under_fresh_ids<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let source = seed_snapshot(&s, "v1").await?;
    for name in ["R1", "R2"] {
        s.create_rule(make_rule(source, name, 3))
            .await
            .map_err(|e| format!("create_rule: {e}"))?;
    }

    let copy = s
        .clone_snapshot(source, make_snapshot("v1-copy"), &SubtaskRemap::identity())
        .await
        .map_err(|e| format!("clone_snapshot: {e}"))?;
    if copy.id == source || copy.version != "v1-copy" {
        return Err(format!("unexpected clone snapshot {:?}", copy));
    }

    let original = s
        .rules_for_snapshot(source)
        .await
        .map_err(|e| format!("rules source: {e}"))?;
    let cloned = s
        .rules_for_snapshot(copy.id)
        .await
        .map_err(|e| format!("rules clone: {e}"))?;
    if original.len() != 2 || cloned.len() != 2 {
        return Err(format!(
            "expected 2 rules on each side, got {} and {}",
            original.len(),
            cloned.len()
        ));
    }
    let original_ids: BTreeSet<_> = original.iter().map(|r| r.id).collect();
    for (a, b) in original.iter().zip(&cloned) {
        if original_ids.contains(&b.id) {
            return Err(format!("clone reused rule id {}", b.id));
        }
        if a.rule_name != b.rule_name || a.conditions != b.conditions || a.emissions != b.emissions
        {
            return Err(format!("clone of {} differs from its source", a.rule_name));
        }
    }
    Ok(())
}

async fn clone_applies_subtask_remap<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let source = seed_snapshot(&s, "v1").await?;
    s.create_rule(make_rule(source, "R1", 3))
        .await
        .map_err(|e| format!("create_rule: {e}"))?;

    let mut remap = SubtaskRemap::identity();
    remap.0.insert(10, 110);
    let copy = s
        .clone_snapshot(source, make_snapshot("v2"), &remap)
        .await
        .map_err(|e| format!("clone_snapshot: {e}"))?;

    let cloned = s
        .rules_for_snapshot(copy.id)
        .await
        .map_err(|e| format!("rules clone: {e}"))?;
    let subtasks: Vec<_> = cloned[0].emissions.iter().map(|e| e.subtask_type_id).collect();
    if subtasks != [110, 11] {
        return Err(format!("expected remapped [110, 11], got {:?}", subtasks));
    }
    let source_rules = s
        .rules_for_snapshot(source)
        .await
        .map_err(|e| format!("rules source: {e}"))?;
    if source_rules[0].emissions[0].subtask_type_id != 10 {
        return Err("remap leaked into the source snapshot".to_string());
    }
    Ok(())
}

async fn record_promotion_sets_wasm<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_snapshot(&s, "v1").await?;
    let promoted = s
        .record_promotion(id, "abc123", 2048)
        .await
        .map_err(|e| format!("record_promotion: {e}"))?;
    if promoted.artifact_format != ArtifactFormat::Wasm
        || promoted.checksum.as_deref() != Some("abc123")
        || promoted.size_bytes != 2048
    {
        return Err(format!("promotion not recorded: {:?}", promoted));
    }
    let reread = s.get_snapshot(id).await.map_err(|e| format!("get: {e}"))?;
    if reread != promoted {
        return Err("promotion not durable".to_string());
    }
    Ok(())
}

async fn latest_report_is_newest<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_snapshot(&s, "v1").await?;
    if s.latest_report(id)
        .await
        .map_err(|e| format!("latest_report: {e}"))?
        .is_some()
    {
        return Err("expected no report before validation".to_string());
    }
    for failed in [2, 0] {
        s.insert_validation_report(ValidationReport {
            snapshot_id: id,
            passed: 3 - failed,
            failed,
            conflicts: Vec::new(),
            simulation_score: 1.0,
        })
        .await
        .map_err(|e| format!("insert_validation_report: {e}"))?;
    }
    let latest = s
        .latest_report(id)
        .await
        .map_err(|e| format!("latest_report: {e}"))?
        .ok_or("report missing")?;
    if latest.failed != 0 {
        return Err(format!("expected newest report (failed=0), got {:?}", latest));
    }
    Ok(())
}
