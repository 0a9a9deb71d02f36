//! Conformance test suite for `PolicyStorage` implementations.
//!
//! A backend-agnostic suite that any `PolicyStorage` implementation can run
//! to verify correctness. The suite covers:
//!
//! - **Arena**: snapshot creation, version uniqueness, rule scoping, deep clone
//! - **Lane transactions**: commit visibility, abort/drop discard, exclusivity
//! - **OCC**: stale lane revisions are refused
//! - **Concurrency**: racing writers on one lane, independent lanes
//! - **Error handling**: correct error variants for invalid operations
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty storage instance for each test:
//!
//! ```ignore
//! use policyline_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn postgres_conformance() {
//!     let report = run_conformance_suite(|| async {
//!         create_test_postgres_storage().await
//!     }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod arena;
mod concurrent;
mod error;
mod lane;

use std::fmt;
use std::future::Future;

use policyline_core::{ArtifactFormat, Condition, Emission, Lane, RolloutEvent, SnapshotId};

use crate::record::{NewDeployment, NewRule, NewSnapshot};
use crate::PolicyStorage;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "arena", "lane").
    pub category: String,
    /// Test name (e.g. "create_snapshot_assigns_positive_id").
    pub name: String,
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn pass(category: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    fn fail(category: &str, name: &str, msg: String) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: false,
            message: Some(msg),
        }
    }

    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::pass(category, name),
            Err(msg) => Self::fail(category, name, msg),
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// storage instance, ensuring test isolation.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: PolicyStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(arena::run_arena_tests(&factory).await);
    results.extend(error::run_error_tests(&factory).await);
    results.extend(lane::run_lane_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: record constructors with sensible defaults ──────────────────────

fn make_snapshot(version: &str) -> NewSnapshot {
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

fn make_rule(snapshot_id: SnapshotId, name: &str, priority: i32) -> NewRule {
    NewRule {
        snapshot_id,
        rule_name: name.to_string(),
        priority,
        engine: "wasm".to_string(),
        disabled: false,
        conditions: vec![
            Condition {
                condition_type: "field".to_string(),
                key: "queue".to_string(),
                operator: "eq".to_string(),
                value: serde_json::json!("billing"),
            },
            Condition {
                condition_type: "field".to_string(),
                key: "tier".to_string(),
                operator: "gte".to_string(),
                value: serde_json::json!(2),
            },
        ],
        emissions: vec![
            Emission {
                subtask_type_id: 10,
                relationship_type: "blocks".to_string(),
                params: serde_json::json!({}),
            },
            Emission {
                subtask_type_id: 11,
                relationship_type: "follows".to_string(),
                params: serde_json::json!({"delay": 5}),
            },
        ],
    }
}

fn make_deployment(snapshot_id: SnapshotId, lane: &Lane, percent: u8) -> NewDeployment {
    NewDeployment {
        snapshot_id,
        lane: lane.clone(),
        percent,
        is_active: percent > 0,
        activated_by: "conformance".to_string(),
        activated_at: time::macros::datetime!(2025-01-01 00:00 UTC),
        deployment_key: String::new(),
        is_rollback: false,
    }
}

fn make_event(snapshot_id: SnapshotId, lane: &Lane, from: Option<u8>, to: u8) -> RolloutEvent {
    RolloutEvent {
        snapshot_id,
        target: lane.target.clone(),
        region: lane.region.clone(),
        from_percent: from,
        to_percent: to,
        is_rollback: false,
        activated_by: "conformance".to_string(),
        timestamp: time::macros::datetime!(2025-01-01 00:00 UTC),
    }
}

fn router() -> Lane {
    Lane::new("router", "global")
}

/// Create a snapshot and return its id, mapping errors to strings.
async fn seed_snapshot<S: PolicyStorage>(s: &S, version: &str) -> Result<SnapshotId, String> {
    s.create_snapshot(make_snapshot(version))
        .await
        .map(|snap| snap.id)
        .map_err(|e| format!("create_snapshot {version}: {e}"))
}

/// Activate `percent` on `lane` for `snapshot_id` in one committed transaction.
async fn seed_activation<S: PolicyStorage>(
    s: &S,
    snapshot_id: SnapshotId,
    lane: &Lane,
    percent: u8,
) -> Result<(), String> {
    let mut txn = s
        .begin_transaction()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let record = s
        .get_lane_for_update(&mut txn, lane)
        .await
        .map_err(|e| format!("get_lane_for_update: {e}"))?;
    s.deactivate_lane(&mut txn, lane, record.revision)
        .await
        .map_err(|e| format!("deactivate_lane: {e}"))?;
    s.insert_deployment(&mut txn, make_deployment(snapshot_id, lane, percent))
        .await
        .map_err(|e| format!("insert_deployment: {e}"))?;
    s.append_rollout_event(
        &mut txn,
        make_event(snapshot_id, lane, record.active_percent(), percent),
    )
    .await
    .map_err(|e| format!("append_rollout_event: {e}"))?;
    s.commit_transaction(txn)
        .await
        .map_err(|e| format!("commit: {e}"))
}
