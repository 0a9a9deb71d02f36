use async_trait::async_trait;

use policyline_core::{Deployment, Lane, RolloutEvent, Rule, Snapshot, SnapshotId, ValidationReport};

use crate::error::StorageError;
use crate::record::{LaneRecord, NewDeployment, NewRule, NewSnapshot, SubtaskRemap};

/// The storage trait for policyline backends.
///
/// Two kinds of write live here:
///
/// - **Arena writes** (snapshots, rules, reports) are single calls, each atomic
///   on its own. [`create_snapshot_with_rules`] stores a whole rule set in one
///   call. Rules live in one arena keyed by `(snapshot_id, rule_id)`;
///   "a snapshot's rules" is a filtered view and only [`clone_snapshot`]
///   duplicates rows.
/// - **Lane writes** (deployments, rollout events, snapshot activation) go
///   through a transaction.
///
/// ## Transaction Semantics
///
/// 1. `begin_transaction()` -- returns a `Txn`
/// 2. Read the lane with `get_lane_for_update`, then stage writes with `&mut txn`
/// 3. `commit_transaction(txn)` -- apply every staged write atomically
///    OR `abort_transaction(txn)` -- discard them
///
/// If a `Txn` is dropped without committing, nothing it staged may become
/// visible.
///
/// ## OCC Conflict Detection
///
/// Every lane carries a revision. `deactivate_lane` is conditional on
/// `revision = expected_revision`, and commit re-checks every revision the
/// transaction read. A mismatch returns `Err(StorageError::LaneConflict)`.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` to be shared in axum
/// application state and across async task boundaries.
///
/// [`clone_snapshot`]: PolicyStorage::clone_snapshot
/// [`create_snapshot_with_rules`]: PolicyStorage::create_snapshot_with_rules
#[async_trait]
pub trait PolicyStorage: Send + Sync + 'static {
    /// The transaction type used by this storage backend.
    type Txn: Send;

    // ── Snapshots and the rule arena ──────────────────────────────────────────

    /// Insert a snapshot. Returns `Err(StorageError::DuplicateVersion)` when
    /// the version label is taken.
    async fn create_snapshot(&self, fields: NewSnapshot) -> Result<Snapshot, StorageError>;

    /// Returns `Err(StorageError::SnapshotNotFound)` if absent.
    async fn get_snapshot(&self, id: SnapshotId) -> Result<Snapshot, StorageError>;

    /// All snapshots, ordered by id.
    async fn list_snapshots(&self) -> Result<Vec<Snapshot>, StorageError>;

    /// Insert a rule under an existing snapshot with a fresh id.
    ///
    /// Returns `Err(StorageError::DuplicateRuleName)` if the snapshot already
    /// owns a rule with the same name.
    async fn create_rule(&self, fields: NewRule) -> Result<Rule, StorageError>;

    /// Insert a snapshot together with its rules, all or nothing.
    ///
    /// Each rule's `snapshot_id` is replaced by the new snapshot's id. Fails
    /// with `DuplicateVersion` or `DuplicateRuleName` without leaving the
    /// snapshot or any of its rules behind.
    async fn create_snapshot_with_rules(
        &self,
        fields: NewSnapshot,
        rules: Vec<NewRule>,
    ) -> Result<(Snapshot, Vec<Rule>), StorageError>;

    /// Every rule in the arena, ordered by `(snapshot_id, id)`.
    async fn list_rules(&self) -> Result<Vec<Rule>, StorageError>;

    /// Rules owned by one snapshot, in insertion order.
    async fn rules_for_snapshot(&self, snapshot_id: SnapshotId) -> Result<Vec<Rule>, StorageError>;

    /// Deep-copy a snapshot's rules (conditions and emissions included) under
    /// a new snapshot built from `fields`. Rule ids are fresh; emission subtask
    /// types go through `remap`.
    async fn clone_snapshot(
        &self,
        source_id: SnapshotId,
        fields: NewSnapshot,
        remap: &SubtaskRemap,
    ) -> Result<Snapshot, StorageError>;

    /// Mark a snapshot as compiled: format `wasm` with the compiler's
    /// checksum and size.
    async fn record_promotion(
        &self,
        snapshot_id: SnapshotId,
        checksum: &str,
        size_bytes: u64,
    ) -> Result<Snapshot, StorageError>;

    async fn insert_validation_report(&self, report: ValidationReport) -> Result<(), StorageError>;

    /// Most recent report for `snapshot_id`, if any.
    async fn latest_report(
        &self,
        snapshot_id: SnapshotId,
    ) -> Result<Option<ValidationReport>, StorageError>;

    // ── Transaction lifecycle ─────────────────────────────────────────────────

    async fn begin_transaction(&self) -> Result<Self::Txn, StorageError>;

    /// Apply all staged writes atomically.
    async fn commit_transaction(&self, txn: Self::Txn) -> Result<(), StorageError>;

    /// Discard all staged writes.
    async fn abort_transaction(&self, txn: Self::Txn) -> Result<(), StorageError>;

    // ── Lane operations (within transaction) ─────────────────────────────────

    /// Read a lane's active row and revision, registering the revision for
    /// the commit-time OCC check.
    async fn get_lane_for_update(
        &self,
        txn: &mut Self::Txn,
        lane: &Lane,
    ) -> Result<LaneRecord, StorageError>;

    /// Row previously written for `(snapshot_id, lane)` with `deployment_key`.
    async fn find_by_deployment_key(
        &self,
        txn: &mut Self::Txn,
        snapshot_id: SnapshotId,
        lane: &Lane,
        deployment_key: &str,
    ) -> Result<Option<Deployment>, StorageError>;

    /// Deactivate every active row of `lane` (OCC on `expected_revision`).
    ///
    /// At commit, a snapshot that this leaves without an active row on any
    /// lane also loses its env-level active flag.
    ///
    /// Returns the revision the lane will carry after commit.
    async fn deactivate_lane(
        &self,
        txn: &mut Self::Txn,
        lane: &Lane,
        expected_revision: i64,
    ) -> Result<i64, StorageError>;

    async fn insert_deployment(
        &self,
        txn: &mut Self::Txn,
        record: NewDeployment,
    ) -> Result<(), StorageError>;

    async fn append_rollout_event(
        &self,
        txn: &mut Self::Txn,
        event: RolloutEvent,
    ) -> Result<(), StorageError>;

    /// Make `snapshot_id` the single active snapshot of its env.
    async fn activate_snapshot(
        &self,
        txn: &mut Self::Txn,
        snapshot_id: SnapshotId,
    ) -> Result<(), StorageError>;

    // ── Query operations (outside transaction) ────────────────────────────────

    /// Current lane state without registering an OCC read.
    async fn lane_state(&self, lane: &Lane) -> Result<LaneRecord, StorageError>;

    /// Deployment rows ordered by id, optionally only the active ones.
    async fn list_deployments(&self, active_only: bool) -> Result<Vec<Deployment>, StorageError>;

    /// Rollout events in append order, optionally restricted to one lane.
    async fn list_rollout_events(
        &self,
        lane: Option<&Lane>,
    ) -> Result<Vec<RolloutEvent>, StorageError>;
}
