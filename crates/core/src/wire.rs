//! Deployment upsert request/response wire shapes.
//!
//! ```json
//! {"snapshotId": 3, "target": "router", "region": "global", "percent": 25,
//!  "isActive": true, "activatedBy": "ops", "deploymentKey": "k-1", "isRollback": false}
//! ```
//! →
//! ```json
//! {"current": {"percent": 25, "isActive": true, "noop": false}, "previous": {"percent": 5}}
//! ```

use serde::{Deserialize, Serialize};

use crate::model::{Lane, SnapshotId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRequest {
    pub snapshot_id: SnapshotId,
    pub target: String,
    pub region: String,
    pub percent: u8,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub activated_by: String,
    /// Idempotency token. Empty disables replay detection.
    #[serde(default)]
    pub deployment_key: String,
    #[serde(default)]
    pub is_rollback: bool,
}

fn default_true() -> bool {
    true
}

impl DeploymentRequest {
    pub fn new(snapshot_id: SnapshotId, lane: &Lane, percent: u8, activated_by: &str) -> Self {
        Self {
            snapshot_id,
            target: lane.target.clone(),
            region: lane.region.clone(),
            percent,
            is_active: true,
            activated_by: activated_by.to_string(),
            deployment_key: String::new(),
            is_rollback: false,
        }
    }

    /// Rollback-to-zero request for `lane`.
    pub fn rollback(snapshot_id: SnapshotId, lane: &Lane, activated_by: &str) -> Self {
        Self {
            percent: 0,
            is_active: false,
            is_rollback: true,
            ..Self::new(snapshot_id, lane, 0, activated_by)
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.deployment_key = key.into();
        self
    }

    pub fn lane(&self) -> Lane {
        Lane::new(self.target.clone(), self.region.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentState {
    pub percent: u8,
    pub is_active: bool,
    pub noop: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousState {
    pub percent: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentOutcome {
    pub current: CurrentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<PreviousState>,
    /// Set when the request matched an earlier one by deployment key.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replayed: bool,
}
