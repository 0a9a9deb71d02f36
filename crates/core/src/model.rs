//! Snapshot, rule, proposal and deployment record types.
//!
//! Every type serializes with camelCase keys. Rule data carried by a
//! proposal's MODIFY/CREATE changes is expressed in the same key space, so a
//! `ruleData` object can be overlaid directly onto a serialized [`Rule`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

pub type SnapshotId = i64;
pub type RuleId = i64;
pub type DeploymentId = i64;

/// Snapshot id carried by a draft that has not been persisted yet.
pub const DRAFT_ID: SnapshotId = 0;

/// Engine assigned to rules created without an explicit `engine`.
pub const DEFAULT_ENGINE: &str = "wasm";

/// Representation of a snapshot's compiled artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    /// Uncompiled rule set, as produced by the diff engine.
    Native,
    /// Compiled artifact, eligible for validation and deployment.
    Wasm,
    #[default]
    Unset,
}

impl fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArtifactFormat::Native => "native",
            ArtifactFormat::Wasm => "wasm",
            ArtifactFormat::Unset => "unset",
        };
        f.write_str(s)
    }
}

/// An immutable, versioned bundle of policy rules plus artifact metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Store-assigned id. [`DRAFT_ID`] (or any value < 1) marks a draft.
    #[serde(default)]
    pub id: SnapshotId,
    /// Globally unique version label.
    pub version: String,
    pub env: String,
    pub stage: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub artifact_format: ArtifactFormat,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    /// Set by the store when the snapshot is persisted.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Snapshot this one evolved from. `None` for bootstrap snapshots.
    #[serde(default)]
    pub parent_id: Option<SnapshotId>,
}

impl Snapshot {
    /// True until the store has assigned a positive id.
    pub fn is_draft(&self) -> bool {
        self.id < 1
    }
}

/// One predicate of a rule. Position within [`Rule::conditions`] is significant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub condition_type: String,
    pub key: String,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}

/// One subtask a matching rule emits. Position within [`Rule::emissions`] is significant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Emission {
    pub subtask_type_id: i64,
    pub relationship_type: String,
    #[serde(default)]
    pub params: Value,
}

/// A policy rule, owned by exactly one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default)]
    pub id: RuleId,
    #[serde(default)]
    pub snapshot_id: SnapshotId,
    /// Unique within the owning snapshot.
    pub rule_name: String,
    /// Negative priorities are flagged by the validation gate.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub emissions: Vec<Emission>,
}

fn default_engine() -> String {
    DEFAULT_ENGINE.to_string()
}

/// Kind of edit a [`Change`] applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeAction {
    Create,
    Modify,
    Delete,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeAction::Create => "CREATE",
            ChangeAction::Modify => "MODIFY",
            ChangeAction::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// One ordered edit within a [`Proposal`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub action: ChangeAction,
    /// Target of MODIFY/DELETE. Ignored for CREATE.
    #[serde(default)]
    pub rule_id: Option<RuleId>,
    /// Full rule body for CREATE, partial overlay for MODIFY.
    #[serde(default)]
    pub rule_data: Option<Value>,
    #[serde(default)]
    pub rationale: String,
}

/// A structured change proposal against a base snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    #[serde(default)]
    pub id: i64,
    /// `0` means "no base" and is used to bootstrap the first snapshot.
    #[serde(default)]
    pub base_snapshot_id: SnapshotId,
    pub new_version: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub changes: Vec<Change>,
}

/// Outcome of one validation attempt over a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub snapshot_id: SnapshotId,
    pub passed: usize,
    pub failed: usize,
    pub conflicts: Vec<String>,
    pub simulation_score: f64,
}

impl ValidationReport {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// A (target, region) pair, the unit of independent deployment control.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Lane {
    pub target: String,
    pub region: String,
}

impl Lane {
    pub fn new(target: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            region: region.into(),
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.target, self.region)
    }
}

/// A stored deployment row. At most one row per lane has `is_active = true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: DeploymentId,
    pub snapshot_id: SnapshotId,
    pub target: String,
    pub region: String,
    pub percent: u8,
    pub is_active: bool,
    pub activated_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub activated_at: OffsetDateTime,
    /// Idempotency token supplied by the caller. Empty when none was given.
    pub deployment_key: String,
    pub is_rollback: bool,
}

impl Deployment {
    pub fn lane(&self) -> Lane {
        Lane::new(self.target.clone(), self.region.clone())
    }
}

/// Append-only audit record of one accepted percent change on a lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutEvent {
    pub snapshot_id: SnapshotId,
    pub target: String,
    pub region: String,
    /// Lane's active percent before the change. `None` if nothing was active.
    pub from_percent: Option<u8>,
    pub to_percent: u8,
    pub is_rollback: bool,
    pub activated_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl RolloutEvent {
    pub fn lane(&self) -> Lane {
        Lane::new(self.target.clone(), self.region.clone())
    }
}
