//! In-memory storage backend, used by tests and by `policyline serve`
//! when no database is configured.
//!
//! Lane transactions stage their writes and apply them under one write lock
//! at commit. Commit re-checks every lane revision the transaction read, then
//! validates the staged writes as a batch, and only then applies them in
//! place.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use policyline_core::{
    ArtifactFormat, Clock, Deployment, DeploymentId, Lane, RolloutEvent, Rule, RuleId, Snapshot,
    SnapshotId, SystemClock, ValidationReport,
};

use crate::error::StorageError;
use crate::record::{LaneRecord, NewDeployment, NewRule, NewSnapshot, SubtaskRemap};
use crate::traits::PolicyStorage;

#[derive(Debug, Default)]
struct State {
    snapshots: BTreeMap<SnapshotId, Snapshot>,
    rules: BTreeMap<(SnapshotId, RuleId), Rule>,
    reports: Vec<ValidationReport>,
    deployments: BTreeMap<DeploymentId, Deployment>,
    events: Vec<RolloutEvent>,
    lane_revisions: HashMap<Lane, i64>,
    last_snapshot_id: SnapshotId,
    last_rule_id: RuleId,
    last_deployment_id: DeploymentId,
}

impl State {
    fn snapshot(&self, id: SnapshotId) -> Result<&Snapshot, StorageError> {
        self.snapshots
            .get(&id)
            .ok_or(StorageError::SnapshotNotFound { id })
    }

    fn rules_of(&self, snapshot_id: SnapshotId) -> impl Iterator<Item = &Rule> {
        self.rules
            .range((snapshot_id, RuleId::MIN)..=(snapshot_id, RuleId::MAX))
            .map(|(_, rule)| rule)
    }

    fn revision(&self, lane: &Lane) -> i64 {
        self.lane_revisions.get(lane).copied().unwrap_or(0)
    }

    fn active_in(&self, lane: &Lane) -> Option<&Deployment> {
        self.deployments
            .values()
            .find(|d| d.is_active && d.target == lane.target && d.region == lane.region)
    }

    fn lane_record(&self, lane: &Lane) -> LaneRecord {
        LaneRecord {
            lane: lane.clone(),
            active: self.active_in(lane).cloned(),
            revision: self.revision(lane),
        }
    }

    fn ensure_version_free(&self, version: &str) -> Result<(), StorageError> {
        if self.snapshots.values().any(|s| s.version == version) {
            return Err(StorageError::DuplicateVersion {
                version: version.to_string(),
            });
        }
        Ok(())
    }

    fn insert_snapshot(&mut self, fields: NewSnapshot, now: time::OffsetDateTime) -> Snapshot {
        self.last_snapshot_id += 1;
        let snapshot = Snapshot {
            id: self.last_snapshot_id,
            version: fields.version,
            env: fields.env,
            stage: fields.stage,
            is_active: false,
            artifact_format: fields.artifact_format,
            checksum: fields.checksum,
            size_bytes: fields.size_bytes,
            created_at: Some(now),
            notes: fields.notes,
            parent_id: fields.parent_id,
        };
        self.snapshots.insert(snapshot.id, snapshot.clone());
        snapshot
    }

    fn insert_rule(&mut self, fields: NewRule) -> Rule {
        self.last_rule_id += 1;
        let rule = Rule {
            id: self.last_rule_id,
            snapshot_id: fields.snapshot_id,
            rule_name: fields.rule_name,
            priority: fields.priority,
            engine: fields.engine,
            disabled: fields.disabled,
            conditions: fields.conditions,
            emissions: fields.emissions,
        };
        self.rules.insert((rule.snapshot_id, rule.id), rule.clone());
        rule
    }

    /// Check staged lane writes against the current state without applying
    /// them. A transaction that passes here cannot fail in [`apply`](Self::apply).
    fn check(&self, staged: &[Staged]) -> Result<(), StorageError> {
        let mut occupied: HashMap<&Lane, bool> = HashMap::new();
        for write in staged {
            match write {
                Staged::Deactivate(lane) => {
                    occupied.insert(lane, false);
                }
                Staged::Insert(record) => {
                    self.snapshot(record.snapshot_id)?;
                    let taken = *occupied
                        .entry(&record.lane)
                        .or_insert_with(|| self.active_in(&record.lane).is_some());
                    if record.is_active && taken {
                        return Err(StorageError::InvalidRecord(format!(
                            "lane {} already has an active deployment",
                            record.lane
                        )));
                    }
                    occupied.insert(&record.lane, taken || record.is_active);
                }
                Staged::Event(_) => {}
                Staged::Activate(snapshot_id) => {
                    self.snapshot(*snapshot_id)?;
                }
            }
        }
        Ok(())
    }

    /// Apply writes that already passed [`check`](Self::check).
    fn apply(&mut self, staged: Vec<Staged>) {
        let mut touched = BTreeSet::new();
        let mut demoted = BTreeSet::new();
        for write in staged {
            match write {
                Staged::Deactivate(lane) => {
                    for d in self.deployments.values_mut() {
                        if d.is_active && d.target == lane.target && d.region == lane.region {
                            d.is_active = false;
                            demoted.insert(d.snapshot_id);
                        }
                    }
                    touched.insert(lane);
                }
                Staged::Insert(record) => {
                    self.last_deployment_id += 1;
                    let row = Deployment {
                        id: self.last_deployment_id,
                        snapshot_id: record.snapshot_id,
                        target: record.lane.target.clone(),
                        region: record.lane.region.clone(),
                        percent: record.percent,
                        is_active: record.is_active,
                        activated_by: record.activated_by,
                        activated_at: record.activated_at,
                        deployment_key: record.deployment_key,
                        is_rollback: record.is_rollback,
                    };
                    self.deployments.insert(row.id, row);
                    touched.insert(record.lane);
                }
                Staged::Event(event) => self.events.push(event),
                Staged::Activate(snapshot_id) => {
                    let Some(env) = self.snapshots.get(&snapshot_id).map(|s| s.env.clone()) else {
                        continue;
                    };
                    for s in self.snapshots.values_mut() {
                        if s.env == env {
                            s.is_active = s.id == snapshot_id;
                        }
                    }
                }
            }
        }
        // A snapshot pulled off its last lane stops being the env's active one.
        for snapshot_id in demoted {
            let serving = self
                .deployments
                .values()
                .any(|d| d.is_active && d.snapshot_id == snapshot_id);
            if !serving {
                if let Some(s) = self.snapshots.get_mut(&snapshot_id) {
                    s.is_active = false;
                }
            }
        }
        for lane in touched {
            *self.lane_revisions.entry(lane).or_insert(0) += 1;
        }
    }
}

#[derive(Debug)]
enum Staged {
    Deactivate(Lane),
    Insert(NewDeployment),
    Event(RolloutEvent),
    Activate(SnapshotId),
}

/// Staged lane writes plus the lane revisions they were based on.
#[derive(Debug, Default)]
pub struct MemoryTxn {
    reads: BTreeMap<Lane, i64>,
    staged: Vec<Staged>,
}

/// Thread-safe in-memory backend.
#[derive(Clone)]
pub struct MemoryStorage {
    state: Arc<RwLock<State>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// A backend whose `created_at` stamps come from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            clock,
        }
    }
}

#[async_trait]
impl PolicyStorage for MemoryStorage {
    type Txn = MemoryTxn;

    async fn create_snapshot(&self, fields: NewSnapshot) -> Result<Snapshot, StorageError> {
        let mut state = self.state.write().await;
        state.ensure_version_free(&fields.version)?;
        Ok(state.insert_snapshot(fields, self.clock.now()))
    }

    async fn get_snapshot(&self, id: SnapshotId) -> Result<Snapshot, StorageError> {
        self.state.read().await.snapshot(id).cloned()
    }

    async fn list_snapshots(&self) -> Result<Vec<Snapshot>, StorageError> {
        Ok(self.state.read().await.snapshots.values().cloned().collect())
    }

    async fn create_rule(&self, fields: NewRule) -> Result<Rule, StorageError> {
        let mut state = self.state.write().await;
        state.snapshot(fields.snapshot_id)?;
        if state
            .rules_of(fields.snapshot_id)
            .any(|r| r.rule_name == fields.rule_name)
        {
            return Err(StorageError::DuplicateRuleName {
                snapshot_id: fields.snapshot_id,
                rule_name: fields.rule_name,
            });
        }
        Ok(state.insert_rule(fields))
    }

    async fn create_snapshot_with_rules(
        &self,
        fields: NewSnapshot,
        rules: Vec<NewRule>,
    ) -> Result<(Snapshot, Vec<Rule>), StorageError> {
        let mut state = self.state.write().await;
        state.ensure_version_free(&fields.version)?;
        {
            let mut names = BTreeSet::new();
            if let Some(dup) = rules.iter().find(|r| !names.insert(r.rule_name.as_str())) {
                return Err(StorageError::DuplicateRuleName {
                    snapshot_id: state.last_snapshot_id + 1,
                    rule_name: dup.rule_name.clone(),
                });
            }
        }

        let snapshot = state.insert_snapshot(fields, self.clock.now());
        let stored = rules
            .into_iter()
            .map(|mut rule| {
                rule.snapshot_id = snapshot.id;
                state.insert_rule(rule)
            })
            .collect();
        Ok((snapshot, stored))
    }

    async fn list_rules(&self) -> Result<Vec<Rule>, StorageError> {
        Ok(self.state.read().await.rules.values().cloned().collect())
    }

    async fn rules_for_snapshot(&self, snapshot_id: SnapshotId) -> Result<Vec<Rule>, StorageError> {
        let state = self.state.read().await;
        state.snapshot(snapshot_id)?;
        Ok(state.rules_of(snapshot_id).cloned().collect())
    }

    async fn clone_snapshot(
        &self,
        source_id: SnapshotId,
        fields: NewSnapshot,
        remap: &SubtaskRemap,
    ) -> Result<Snapshot, StorageError> {
        let mut state = self.state.write().await;
        state.snapshot(source_id)?;
        state.ensure_version_free(&fields.version)?;

        let copies: Vec<Rule> = state.rules_of(source_id).cloned().collect();
        let snapshot = state.insert_snapshot(fields, self.clock.now());
        for rule in copies {
            let mut fields = NewRule::from_rule(snapshot.id, &rule);
            for emission in &mut fields.emissions {
                emission.subtask_type_id = remap.map(emission.subtask_type_id);
            }
            state.insert_rule(fields);
        }
        tracing::debug!(source_id, snapshot_id = snapshot.id, "cloned snapshot");
        Ok(snapshot)
    }

    async fn record_promotion(
        &self,
        snapshot_id: SnapshotId,
        checksum: &str,
        size_bytes: u64,
    ) -> Result<Snapshot, StorageError> {
        let mut state = self.state.write().await;
        let snapshot = state
            .snapshots
            .get_mut(&snapshot_id)
            .ok_or(StorageError::SnapshotNotFound { id: snapshot_id })?;
        snapshot.artifact_format = ArtifactFormat::Wasm;
        snapshot.checksum = Some(checksum.to_string());
        snapshot.size_bytes = size_bytes;
        Ok(snapshot.clone())
    }

    async fn insert_validation_report(&self, report: ValidationReport) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        state.snapshot(report.snapshot_id)?;
        state.reports.push(report);
        Ok(())
    }

    async fn latest_report(
        &self,
        snapshot_id: SnapshotId,
    ) -> Result<Option<ValidationReport>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .reports
            .iter()
            .rev()
            .find(|r| r.snapshot_id == snapshot_id)
            .cloned())
    }

    async fn begin_transaction(&self) -> Result<MemoryTxn, StorageError> {
        Ok(MemoryTxn::default())
    }

    async fn commit_transaction(&self, txn: MemoryTxn) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        for (lane, expected) in &txn.reads {
            if state.revision(lane) != *expected {
                return Err(StorageError::LaneConflict {
                    lane: lane.clone(),
                    expected_revision: *expected,
                });
            }
        }
        state.check(&txn.staged)?;
        let staged = txn.staged.len();
        state.apply(txn.staged);
        tracing::debug!(staged, "committed lane transaction");
        Ok(())
    }

    async fn abort_transaction(&self, _txn: MemoryTxn) -> Result<(), StorageError> {
        Ok(())
    }

    async fn get_lane_for_update(
        &self,
        txn: &mut MemoryTxn,
        lane: &Lane,
    ) -> Result<LaneRecord, StorageError> {
        let record = self.state.read().await.lane_record(lane);
        txn.reads.entry(lane.clone()).or_insert(record.revision);
        Ok(record)
    }

    async fn find_by_deployment_key(
        &self,
        _txn: &mut MemoryTxn,
        snapshot_id: SnapshotId,
        lane: &Lane,
        deployment_key: &str,
    ) -> Result<Option<Deployment>, StorageError> {
        if deployment_key.is_empty() {
            return Ok(None);
        }
        let state = self.state.read().await;
        Ok(state
            .deployments
            .values()
            .find(|d| {
                d.snapshot_id == snapshot_id
                    && d.target == lane.target
                    && d.region == lane.region
                    && d.deployment_key == deployment_key
            })
            .cloned())
    }

    async fn deactivate_lane(
        &self,
        txn: &mut MemoryTxn,
        lane: &Lane,
        expected_revision: i64,
    ) -> Result<i64, StorageError> {
        let live = self.state.read().await.revision(lane);
        if live != expected_revision {
            return Err(StorageError::LaneConflict {
                lane: lane.clone(),
                expected_revision,
            });
        }
        txn.reads.entry(lane.clone()).or_insert(expected_revision);
        txn.staged.push(Staged::Deactivate(lane.clone()));
        Ok(expected_revision + 1)
    }

    async fn insert_deployment(
        &self,
        txn: &mut MemoryTxn,
        record: NewDeployment,
    ) -> Result<(), StorageError> {
        if record.percent > 100 {
            return Err(StorageError::InvalidRecord(format!(
                "percent {} is above 100",
                record.percent
            )));
        }
        txn.staged.push(Staged::Insert(record));
        Ok(())
    }

    async fn append_rollout_event(
        &self,
        txn: &mut MemoryTxn,
        event: RolloutEvent,
    ) -> Result<(), StorageError> {
        txn.staged.push(Staged::Event(event));
        Ok(())
    }

    async fn activate_snapshot(
        &self,
        txn: &mut MemoryTxn,
        snapshot_id: SnapshotId,
    ) -> Result<(), StorageError> {
        self.state.read().await.snapshot(snapshot_id)?;
        txn.staged.push(Staged::Activate(snapshot_id));
        Ok(())
    }

    async fn lane_state(&self, lane: &Lane) -> Result<LaneRecord, StorageError> {
        Ok(self.state.read().await.lane_record(lane))
    }

    async fn list_deployments(&self, active_only: bool) -> Result<Vec<Deployment>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .deployments
            .values()
            .filter(|d| !active_only || d.is_active)
            .cloned()
            .collect())
    }

    async fn list_rollout_events(
        &self,
        lane: Option<&Lane>,
    ) -> Result<Vec<RolloutEvent>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|e| lane.map_or(true, |l| e.target == l.target && e.region == l.region))
            .cloned()
            .collect())
    }
}
