use std::future::Future;
use std::sync::Arc;

use policyline_core::Lane;

use super::{make_deployment, seed_snapshot, TestResult};
use crate::{PolicyStorage, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_activation_exactly_one_wins",
        concurrent_activation_exactly_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_activation_different_lanes_all_succeed",
        concurrent_activation_different_lanes_all_succeed(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_retries_leave_one_active_row",
        concurrent_retries_leave_one_active_row(factory).await,
    ));

    results
}

/// One attempt to replace the active row of `lane`, based on `revision`.
///
/// `Ok(false)` means the attempt lost an OCC race and nothing was written.
async fn try_activate<S: PolicyStorage>(
    s: &S,
    snapshot_id: i64,
    lane: &Lane,
    revision: i64,
    percent: u8,
) -> Result<bool, StorageError> {
    let mut txn = s.begin_transaction().await?;
    match s.deactivate_lane(&mut txn, lane, revision).await {
        Ok(_) => {}
        Err(StorageError::LaneConflict { .. }) => {
            s.abort_transaction(txn).await?;
            return Ok(false);
        }
        Err(e) => {
            let _ = s.abort_transaction(txn).await;
            return Err(e);
        }
    }
    s.insert_deployment(&mut txn, make_deployment(snapshot_id, lane, percent))
        .await?;
    match s.commit_transaction(txn).await {
        Ok(()) => Ok(true),
        Err(StorageError::LaneConflict { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

// ── Same lane: exactly one wins ─────────────────────────────────────────────

/// N tasks all try to activate the same lane from revision 0. Exactly one
/// commit lands; the rest see `LaneConflict` at deactivation or at commit.
async fn concurrent_activation_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let id = seed_snapshot(storage.as_ref(), "v1").await?;
    let lane = Lane::new("router", "global");

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        let lane = lane.clone();
        handles.push(tokio::spawn(async move {
            try_activate(s.as_ref(), id, &lane, 0, 5).await
        }));
    }

    let mut winners = 0usize;
    let mut losers = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        } else {
            losers += 1;
        }
    }

    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    if losers != N - 1 {
        return Err(format!("expected {} losers, got {losers}", N - 1));
    }
    let rows = storage
        .list_deployments(false)
        .await
        .map_err(|e| format!("list_deployments: {e}"))?;
    if rows.len() != 1 {
        return Err(format!("losers wrote rows: {} total", rows.len()));
    }
    Ok(())
}

// ── Different lanes: all succeed ────────────────────────────────────────────

async fn concurrent_activation_different_lanes_all_succeed<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let id = seed_snapshot(storage.as_ref(), "v1").await?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let lane = Lane::new("router", format!("region-{i}"));
            try_activate(s.as_ref(), id, &lane, 0, 25).await
        }));
    }

    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
        if !won {
            return Err("independent lane reported a conflict".to_string());
        }
    }

    let active = storage
        .list_deployments(true)
        .await
        .map_err(|e| format!("list_deployments: {e}"))?;
    if active.len() != N {
        return Err(format!("expected {N} active rows, got {}", active.len()));
    }
    Ok(())
}

// ── Retrying writers converge ───────────────────────────────────────────────

/// N tasks retry until their activation lands. Every attempt eventually
/// commits, the lane keeps every row as history, and exactly one stays active.
async fn concurrent_retries_leave_one_active_row<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let id = seed_snapshot(storage.as_ref(), "v1").await?;
    let lane = Lane::new("router", "global");

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        let lane = lane.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let revision = s.lane_state(&lane).await?.revision;
                if try_activate(s.as_ref(), id, &lane, revision, 50).await? {
                    return Ok::<(), StorageError>(());
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    for handle in handles {
        handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
    }

    let rows = storage
        .list_deployments(false)
        .await
        .map_err(|e| format!("list_deployments: {e}"))?;
    let active = rows.iter().filter(|d| d.is_active).count();
    if rows.len() != N || active != 1 {
        return Err(format!(
            "expected {N} rows with 1 active, got {} rows with {active} active",
            rows.len()
        ));
    }
    let record = storage
        .lane_state(&lane)
        .await
        .map_err(|e| format!("lane_state: {e}"))?;
    if record.revision != N as i64 {
        return Err(format!(
            "expected revision {N}, got {}",
            record.revision
        ));
    }
    Ok(())
}
