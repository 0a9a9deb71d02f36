//! Lane transaction conformance tests: visibility, exclusivity and OCC.

use std::future::Future;

use policyline_core::Lane;

use super::{
    make_deployment, make_event, make_snapshot, router, seed_activation, seed_snapshot, TestResult,
};
use crate::{PolicyStorage, StorageError};

pub(super) async fn run_lane_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "lane",
        "empty_lane_starts_at_revision_zero",
        empty_lane_starts_at_revision_zero(factory).await,
    ));
    results.push(TestResult::from_result(
        "lane",
        "committed_activation_visible",
        committed_activation_visible(factory).await,
    ));
    results.push(TestResult::from_result(
        "lane",
        "aborted_transaction_invisible",
        aborted_transaction_invisible(factory).await,
    ));
    results.push(TestResult::from_result(
        "lane",
        "dropped_transaction_invisible",
        dropped_transaction_invisible(factory).await,
    ));
    results.push(TestResult::from_result(
        "lane",
        "reactivation_keeps_one_active_row",
        reactivation_keeps_one_active_row(factory).await,
    ));
    results.push(TestResult::from_result(
        "lane",
        "stale_revision_refused",
        stale_revision_refused(factory).await,
    ));
    results.push(TestResult::from_result(
        "lane",
        "stale_read_refused_at_commit",
        stale_read_refused_at_commit(factory).await,
    ));
    results.push(TestResult::from_result(
        "lane",
        "deployment_key_lookup",
        deployment_key_lookup(factory).await,
    ));
    results.push(TestResult::from_result(
        "lane",
        "lanes_are_independent",
        lanes_are_independent(factory).await,
    ));
    results.push(TestResult::from_result(
        "lane",
        "events_filtered_by_lane_in_order",
        events_filtered_by_lane_in_order(factory).await,
    ));
    results.push(TestResult::from_result(
        "lane",
        "activation_exclusive_per_env",
        activation_exclusive_per_env(factory).await,
    ));
    results.push(TestResult::from_result(
        "lane",
        "emptied_snapshot_loses_active_flag",
        emptied_snapshot_loses_active_flag(factory).await,
    ));

    results
}

async fn empty_lane_starts_at_revision_zero<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let record = s
        .lane_state(&router())
        .await
        .map_err(|e| format!("lane_state: {e}"))?;
    if record.revision != 0 || record.active.is_some() {
        return Err(format!("expected empty lane at revision 0, got {:?}", record));
    }
    Ok(())
}

async fn committed_activation_visible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_snapshot(&s, "v1").await?;
    let lane = router();
    seed_activation(&s, id, &lane, 5).await?;

    let record = s
        .lane_state(&lane)
        .await
        .map_err(|e| format!("lane_state: {e}"))?;
    if record.active_percent() != Some(5) {
        return Err(format!("expected active 5%, got {:?}", record.active));
    }
    if record.revision < 1 {
        return Err(format!("revision did not advance: {}", record.revision));
    }
    let events = s
        .list_rollout_events(Some(&lane))
        .await
        .map_err(|e| format!("events: {e}"))?;
    if events.len() != 1 || events[0].from_percent.is_some() || events[0].to_percent != 5 {
        return Err(format!("unexpected events {:?}", events));
    }
    Ok(())
}

async fn aborted_transaction_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
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
    s.deactivate_lane(&mut txn, &lane, 0)
        .await
        .map_err(|e| format!("deactivate: {e}"))?;
    s.insert_deployment(&mut txn, make_deployment(id, &lane, 5))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    s.append_rollout_event(&mut txn, make_event(id, &lane, None, 5))
        .await
        .map_err(|e| format!("event: {e}"))?;
    s.abort_transaction(txn)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    let rows = s
        .list_deployments(false)
        .await
        .map_err(|e| format!("list_deployments: {e}"))?;
    let events = s
        .list_rollout_events(None)
        .await
        .map_err(|e| format!("events: {e}"))?;
    if !rows.is_empty() || !events.is_empty() {
        return Err("aborted writes became visible".to_string());
    }
    Ok(())
}

async fn dropped_transaction_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_snapshot(&s, "v1").await?;
    let lane = router();
    {
        let mut txn = s
            .begin_transaction()
            .await
            .map_err(|e| format!("begin: {e}"))?;
        s.insert_deployment(&mut txn, make_deployment(id, &lane, 25))
            .await
            .map_err(|e| format!("insert: {e}"))?;
        s.activate_snapshot(&mut txn, id)
            .await
            .map_err(|e| format!("activate: {e}"))?;
    }
    let rows = s
        .list_deployments(false)
        .await
        .map_err(|e| format!("list_deployments: {e}"))?;
    let snapshot = s.get_snapshot(id).await.map_err(|e| format!("get: {e}"))?;
    if !rows.is_empty() || snapshot.is_active {
        return Err("dropped transaction left writes behind".to_string());
    }
    Ok(())
}

async fn reactivation_keeps_one_active_row<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_snapshot(&s, "v1").await?;
    let lane = router();
    for percent in [5, 25, 50] {
        seed_activation(&s, id, &lane, percent).await?;
    }

    let rows = s
        .list_deployments(false)
        .await
        .map_err(|e| format!("list_deployments: {e}"))?;
    let active = s
        .list_deployments(true)
        .await
        .map_err(|e| format!("list_deployments: {e}"))?;
    if rows.len() != 3 {
        return Err(format!("history should keep 3 rows, got {}", rows.len()));
    }
    if active.len() != 1 || active[0].percent != 50 {
        return Err(format!("expected exactly one active row at 50%, got {:?}", active));
    }
    let events = s
        .list_rollout_events(Some(&lane))
        .await
        .map_err(|e| format!("events: {e}"))?;
    let chain: Vec<_> = events.iter().map(|e| (e.from_percent, e.to_percent)).collect();
    if chain != [(None, 5), (Some(5), 25), (Some(25), 50)] {
        return Err(format!("event chain broken: {:?}", chain));
    }
    Ok(())
}

async fn stale_revision_refused<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_snapshot(&s, "v1").await?;
    let lane = router();
    seed_activation(&s, id, &lane, 5).await?;

    let mut txn = s
        .begin_transaction()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    match s.deactivate_lane(&mut txn, &lane, 0).await {
        Err(StorageError::LaneConflict {
            lane: conflicted,
            expected_revision: 0,
        }) if conflicted == lane => Ok(()),
        other => Err(format!("expected LaneConflict at revision 0, got {:?}", other)),
    }
}

async fn stale_read_refused_at_commit<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_snapshot(&s, "v1").await?;
    let lane = router();

    let mut slow = s
        .begin_transaction()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let seen = s
        .get_lane_for_update(&mut slow, &lane)
        .await
        .map_err(|e| format!("get_lane_for_update: {e}"))?;
    s.deactivate_lane(&mut slow, &lane, seen.revision)
        .await
        .map_err(|e| format!("deactivate: {e}"))?;
    s.insert_deployment(&mut slow, make_deployment(id, &lane, 25))
        .await
        .map_err(|e| format!("insert: {e}"))?;

    seed_activation(&s, id, &lane, 5).await?;

    match s.commit_transaction(slow).await {
        Err(StorageError::LaneConflict { .. }) => {}
        other => return Err(format!("expected LaneConflict at commit, got {:?}", other)),
    }
    let active = s
        .list_deployments(true)
        .await
        .map_err(|e| format!("list_deployments: {e}"))?;
    if active.len() != 1 || active[0].percent != 5 {
        return Err(format!("loser's write leaked: {:?}", active));
    }
    Ok(())
}

async fn deployment_key_lookup<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let mut record = make_deployment(id, &lane, 5);
    record.deployment_key = "deploy-1".to_string();
    s.deactivate_lane(&mut txn, &lane, 0)
        .await
        .map_err(|e| format!("deactivate: {e}"))?;
    s.insert_deployment(&mut txn, record)
        .await
        .map_err(|e| format!("insert: {e}"))?;
    s.commit_transaction(txn)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let mut txn = s
        .begin_transaction()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let hit = s
        .find_by_deployment_key(&mut txn, id, &lane, "deploy-1")
        .await
        .map_err(|e| format!("find hit: {e}"))?;
    let other_lane = s
        .find_by_deployment_key(&mut txn, id, &Lane::new("router", "eu"), "deploy-1")
        .await
        .map_err(|e| format!("find other lane: {e}"))?;
    let empty_key = s
        .find_by_deployment_key(&mut txn, id, &lane, "")
        .await
        .map_err(|e| format!("find empty: {e}"))?;
    s.abort_transaction(txn)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    match hit {
        Some(row) if row.percent == 5 && row.deployment_key == "deploy-1" => {}
        other => return Err(format!("expected keyed row at 5%, got {:?}", other)),
    }
    if other_lane.is_some() || empty_key.is_some() {
        return Err("key lookup matched outside its lane or on an empty key".to_string());
    }
    Ok(())
}

async fn lanes_are_independent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_snapshot(&s, "v1").await?;
    let us = Lane::new("router", "us");
    let eu = Lane::new("router", "eu");
    seed_activation(&s, id, &us, 25).await?;
    seed_activation(&s, id, &eu, 5).await?;

    let us_state = s.lane_state(&us).await.map_err(|e| format!("us: {e}"))?;
    let eu_state = s.lane_state(&eu).await.map_err(|e| format!("eu: {e}"))?;
    if us_state.active_percent() != Some(25) || eu_state.active_percent() != Some(5) {
        return Err(format!(
            "lanes interfered: us={:?} eu={:?}",
            us_state.active_percent(),
            eu_state.active_percent()
        ));
    }
    let active = s
        .list_deployments(true)
        .await
        .map_err(|e| format!("list_deployments: {e}"))?;
    if active.len() != 2 {
        return Err(format!("expected 2 active rows, got {}", active.len()));
    }
    Ok(())
}

async fn events_filtered_by_lane_in_order<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let id = seed_snapshot(&s, "v1").await?;
    let us = Lane::new("router", "us");
    let eu = Lane::new("router", "eu");
    seed_activation(&s, id, &us, 5).await?;
    seed_activation(&s, id, &eu, 5).await?;
    seed_activation(&s, id, &us, 25).await?;

    let all = s
        .list_rollout_events(None)
        .await
        .map_err(|e| format!("events: {e}"))?;
    let us_only = s
        .list_rollout_events(Some(&us))
        .await
        .map_err(|e| format!("events us: {e}"))?;
    if all.len() != 3 {
        return Err(format!("expected 3 events, got {}", all.len()));
    }
    let percents: Vec<_> = us_only.iter().map(|e| e.to_percent).collect();
    if percents != [5, 25] || us_only.iter().any(|e| e.lane() != us) {
        return Err(format!("unexpected us events {:?}", us_only));
    }
    Ok(())
}

async fn activation_exclusive_per_env<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let a = seed_snapshot(&s, "v1").await?;
    let b = seed_snapshot(&s, "v2").await?;
    let mut staging = make_snapshot("v3");
    staging.env = "staging".to_string();
    let c = s
        .create_snapshot(staging)
        .await
        .map_err(|e| format!("create staging: {e}"))?
        .id;

    for id in [a, c, b] {
        let mut txn = s
            .begin_transaction()
            .await
            .map_err(|e| format!("begin: {e}"))?;
        s.activate_snapshot(&mut txn, id)
            .await
            .map_err(|e| format!("activate {id}: {e}"))?;
        s.commit_transaction(txn)
            .await
            .map_err(|e| format!("commit: {e}"))?;
    }

    let active: Vec<_> = s
        .list_snapshots()
        .await
        .map_err(|e| format!("list: {e}"))?
        .into_iter()
        .filter(|snap| snap.is_active)
        .map(|snap| snap.id)
        .collect();
    if active != [b, c] {
        return Err(format!("expected active [{b}, {c}], got {:?}", active));
    }
    Ok(())
}

async fn emptied_snapshot_loses_active_flag<S, F, Fut>(factory: &F) -> Result<(), String>
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
    s.deactivate_lane(&mut txn, &lane, 0)
        .await
        .map_err(|e| format!("deactivate_lane: {e}"))?;
    s.insert_deployment(&mut txn, make_deployment(id, &lane, 25))
        .await
        .map_err(|e| format!("insert_deployment: {e}"))?;
    s.activate_snapshot(&mut txn, id)
        .await
        .map_err(|e| format!("activate: {e}"))?;
    s.commit_transaction(txn)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let mut txn = s
        .begin_transaction()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let record = s
        .get_lane_for_update(&mut txn, &lane)
        .await
        .map_err(|e| format!("get_lane_for_update: {e}"))?;
    s.deactivate_lane(&mut txn, &lane, record.revision)
        .await
        .map_err(|e| format!("deactivate_lane: {e}"))?;
    s.insert_deployment(&mut txn, make_deployment(id, &lane, 0))
        .await
        .map_err(|e| format!("insert_deployment: {e}"))?;
    s.commit_transaction(txn)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let snapshot = s.get_snapshot(id).await.map_err(|e| format!("get: {e}"))?;
    if snapshot.is_active {
        return Err("snapshot still active after its only lane went to 0%".to_string());
    }
    Ok(())
}
