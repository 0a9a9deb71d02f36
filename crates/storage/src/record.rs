use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use policyline_core::{
    ArtifactFormat, Condition, Deployment, Emission, Lane, Rule, Snapshot, SnapshotId,
};

/// Fields for inserting a snapshot. The store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSnapshot {
    pub version: String,
    pub env: String,
    pub stage: String,
    pub artifact_format: ArtifactFormat,
    pub checksum: Option<String>,
    pub size_bytes: u64,
    pub notes: Option<String>,
    pub parent_id: Option<SnapshotId>,
}

impl NewSnapshot {
    /// Insert fields taken from a (usually draft) snapshot.
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            version: snapshot.version.clone(),
            env: snapshot.env.clone(),
            stage: snapshot.stage.clone(),
            artifact_format: snapshot.artifact_format,
            checksum: snapshot.checksum.clone(),
            size_bytes: snapshot.size_bytes,
            notes: snapshot.notes.clone(),
            parent_id: snapshot.parent_id,
        }
    }
}

/// Fields for inserting a rule. The store assigns a fresh `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    pub snapshot_id: SnapshotId,
    pub rule_name: String,
    pub priority: i32,
    pub engine: String,
    pub disabled: bool,
    pub conditions: Vec<Condition>,
    pub emissions: Vec<Emission>,
}

impl NewRule {
    /// Copy `rule`'s body under `snapshot_id`, dropping its id.
    pub fn from_rule(snapshot_id: SnapshotId, rule: &Rule) -> Self {
        Self {
            snapshot_id,
            rule_name: rule.rule_name.clone(),
            priority: rule.priority,
            engine: rule.engine.clone(),
            disabled: rule.disabled,
            conditions: rule.conditions.clone(),
            emissions: rule.emissions.clone(),
        }
    }
}

/// Maps subtask-type ids when a snapshot is cloned into another catalog.
/// Ids without an entry are kept as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskRemap(pub BTreeMap<i64, i64>);

impl SubtaskRemap {
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn map(&self, subtask_type_id: i64) -> i64 {
        self.0.get(&subtask_type_id).copied().unwrap_or(subtask_type_id)
    }
}

/// Fields for inserting a deployment row. The store assigns `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDeployment {
    pub snapshot_id: SnapshotId,
    pub lane: Lane,
    pub percent: u8,
    pub is_active: bool,
    pub activated_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub activated_at: time::OffsetDateTime,
    pub deployment_key: String,
    pub is_rollback: bool,
}

/// A lane's current active row plus the revision used for OCC.
///
/// The revision increases by one on every committed write to the lane.
#[derive(Debug, Clone, PartialEq)]
pub struct LaneRecord {
    pub lane: Lane,
    pub active: Option<Deployment>,
    pub revision: i64,
}

impl LaneRecord {
    pub fn active_percent(&self) -> Option<u8> {
        self.active.as_ref().map(|d| d.percent)
    }
}
