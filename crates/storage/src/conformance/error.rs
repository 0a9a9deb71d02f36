//! Error-variant conformance tests.

use std::future::Future;

use super::{make_deployment, make_rule, make_snapshot, router, seed_snapshot, TestResult};
use crate::record::SubtaskRemap;
use crate::{PolicyStorage, StorageError};

pub(super) async fn run_error_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "error",
        "get_missing_snapshot",
        get_missing_snapshot(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "rule_under_missing_snapshot",
        rule_under_missing_snapshot(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "duplicate_rule_name_in_snapshot",
        duplicate_rule_name_in_snapshot(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "clone_missing_source",
        clone_missing_source(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "percent_above_hundred_refused",
        percent_above_hundred_refused(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "activate_missing_snapshot",
        activate_missing_snapshot(factory).await,
    ));

    results
}

async fn get_missing_snapshot<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.get_snapshot(42).await {
        Err(StorageError::SnapshotNotFound { id: 42 }) => Ok(()),
        other => Err(format!("expected SnapshotNotFound(42), got {:?}", other)),
    }
}

async fn rule_under_missing_snapshot<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.create_rule(make_rule(7, "R1", 1)).await {
        Err(StorageError::SnapshotNotFound { id: 7 }) => {}
        other => return Err(format!("expected SnapshotNotFound(7), got {:?}", other)),
    }
    let rules = s.list_rules().await.map_err(|e| format!("list_rules: {e}"))?;
    if !rules.is_empty() {
        return Err(format!("orphan rule persisted: {:?}", rules));
    }
    Ok(())
}

async fn duplicate_rule_name_in_snapshot<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let a = seed_snapshot(&s, "v1").await?;
    let b = seed_snapshot(&s, "v2").await?;
    s.create_rule(make_rule(a, "R1", 1))
        .await
        .map_err(|e| format!("first R1: {e}"))?;
    match s.create_rule(make_rule(a, "R1", 2)).await {
        Err(StorageError::DuplicateRuleName {
            snapshot_id,
            rule_name,
        }) if snapshot_id == a && rule_name == "R1" => {}
        other => return Err(format!("expected DuplicateRuleName, got {:?}", other)),
    }
    // Names are only unique within one snapshot.
    s.create_rule(make_rule(b, "R1", 1))
        .await
        .map_err(|e| format!("R1 in another snapshot: {e}"))?;
    Ok(())
}

async fn clone_missing_source<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s
        .clone_snapshot(9, make_snapshot("v2"), &SubtaskRemap::identity())
        .await
    {
        Err(StorageError::SnapshotNotFound { id: 9 }) => {}
        other => return Err(format!("expected SnapshotNotFound(9), got {:?}", other)),
    }
    let listed = s.list_snapshots().await.map_err(|e| format!("list: {e}"))?;
    if !listed.is_empty() {
        return Err("failed clone left a snapshot behind".to_string());
    }
    Ok(())
}

async fn percent_above_hundred_refused<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_snapshot(&s, "v1").await?;
    let lane = router();
    let mut txn = s
        .begin_transaction()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let staged = s
        .insert_deployment(&mut txn, make_deployment(id, &lane, 101))
        .await;
    let outcome = match staged {
        Err(e) => Err(e),
        Ok(()) => s.commit_transaction(txn).await,
    };
    match outcome {
        Err(StorageError::InvalidRecord(_)) => {}
        other => return Err(format!("expected InvalidRecord, got {:?}", other)),
    }
    let rows = s
        .list_deployments(false)
        .await
        .map_err(|e| format!("list_deployments: {e}"))?;
    if !rows.is_empty() {
        return Err("out-of-range row persisted".to_string());
    }
    Ok(())
}

async fn activate_missing_snapshot<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut txn = s
        .begin_transaction()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let outcome = match s.activate_snapshot(&mut txn, 3).await {
        Err(e) => Err(e),
        Ok(()) => s.commit_transaction(txn).await,
    };
    match outcome {
        Err(StorageError::SnapshotNotFound { id: 3 }) => Ok(()),
        other => Err(format!("expected SnapshotNotFound(3), got {:?}", other)),
    }
}
