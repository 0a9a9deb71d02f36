//! Deployment ledger: per-lane activation, canary progression, rollback and
//! the rollout audit trail.
//!
//! Every accepted change runs as one storage transaction:
//!
//! 1. read the lane and its revision
//! 2. deactivate the lane's active row (OCC on the revision)
//! 3. insert the new row
//! 4. append one rollout event
//! 5. mark the snapshot active in its env (only when the row is active)
//! 6. commit
//!
//! A raced writer surfaces as `StorageError::LaneConflict`; the whole
//! transaction is retried from step 1 up to `max_lane_retries` times.
//!
//! Outside a rollback a lane never climbs past the next rung of the canary
//! ladder above its active percent, and a snapshot's own percent never drops.
//! A rollback may land on any percent; only 0% deactivates the lane.

use std::sync::Arc;

use policyline_core::ladder::CEILING;
use policyline_core::{
    calculate_canary_step, ladder, Clock, CurrentState, Deployment, DeploymentOutcome,
    DeploymentRequest, Lane, PreviousState, RolloutEvent, SnapshotId, SystemClock,
};
use policyline_storage::{NewDeployment, PolicyStorage, StorageError};

use crate::error::DeployError;

pub const DEFAULT_MAX_LANE_RETRIES: u32 = 3;

pub struct DeploymentLedger<S> {
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
    max_lane_retries: u32,
}

/// What a transaction attempt decided.
enum Decision {
    /// Nothing to write; the transaction is aborted.
    Unchanged(DeploymentOutcome),
    /// Writes are staged; the transaction must be committed.
    Staged(DeploymentOutcome),
}

impl<S: PolicyStorage> DeploymentLedger<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self::with_clock(storage, Arc::new(SystemClock))
    }

    pub fn with_clock(storage: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            max_lane_retries: DEFAULT_MAX_LANE_RETRIES,
        }
    }

    pub fn with_max_lane_retries(mut self, retries: u32) -> Self {
        self.max_lane_retries = retries;
        self
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Apply a deployment upsert to its lane.
    pub async fn create_or_update(
        &self,
        request: &DeploymentRequest,
    ) -> Result<DeploymentOutcome, DeployError> {
        if request.percent > CEILING {
            return Err(DeployError::InvalidPercent {
                percent: request.percent,
            });
        }
        let lane = request.lane();
        if !request.is_rollback && !ladder::is_rung(request.percent) {
            tracing::debug!(%lane, percent = request.percent, "percent is off the canary ladder");
        }

        let mut conflicts = 0;
        loop {
            match self.attempt(request, &lane).await {
                Err(DeployError::Storage(StorageError::LaneConflict { .. })) => {
                    conflicts += 1;
                    if conflicts > self.max_lane_retries {
                        return Err(DeployError::LaneConflict {
                            lane,
                            attempts: conflicts,
                        });
                    }
                    tracing::warn!(%lane, attempt = conflicts, "lane changed concurrently, retrying");
                }
                other => return other,
            }
        }
    }

    /// Take the lane to 0% and deactivate it. Always writes a row and an event.
    /// For a partial rollback send a request with `is_rollback` set.
    pub async fn rollback(
        &self,
        snapshot_id: SnapshotId,
        lane: &Lane,
        activated_by: &str,
    ) -> Result<DeploymentOutcome, DeployError> {
        let outcome = self
            .create_or_update(&DeploymentRequest::rollback(snapshot_id, lane, activated_by))
            .await?;
        tracing::info!(%lane, snapshot_id, "rolled back lane");
        Ok(outcome)
    }

    /// Same as [`rollback`](Self::rollback).
    pub async fn deactivate(
        &self,
        snapshot_id: SnapshotId,
        lane: &Lane,
        activated_by: &str,
    ) -> Result<DeploymentOutcome, DeployError> {
        self.rollback(snapshot_id, lane, activated_by).await
    }

    /// Move `snapshot_id` one rung up the canary ladder on `lane`.
    ///
    /// The starting point is the lane's active percent if it serves the same
    /// snapshot, otherwise 0. At the ceiling this is a no-op.
    pub async fn advance(
        &self,
        snapshot_id: SnapshotId,
        lane: &Lane,
        activated_by: &str,
        deployment_key: &str,
    ) -> Result<DeploymentOutcome, DeployError> {
        let current = self
            .active_deployment(lane)
            .await?
            .filter(|d| d.snapshot_id == snapshot_id)
            .map_or(0, |d| d.percent);
        if current >= CEILING {
            tracing::warn!(%lane, snapshot_id, "already at the top of the canary ladder");
        }
        let next = calculate_canary_step(current);
        let request = DeploymentRequest::new(snapshot_id, lane, next, activated_by)
            .with_key(deployment_key);
        self.create_or_update(&request).await
    }

    /// Rollout events of `lane`, oldest first.
    pub async fn lane_events(&self, lane: &Lane) -> Result<Vec<RolloutEvent>, DeployError> {
        Ok(self.storage.list_rollout_events(Some(lane)).await?)
    }

    pub async fn active_deployment(&self, lane: &Lane) -> Result<Option<Deployment>, DeployError> {
        Ok(self.storage.lane_state(lane).await?.active)
    }

    async fn attempt(
        &self,
        request: &DeploymentRequest,
        lane: &Lane,
    ) -> Result<DeploymentOutcome, DeployError> {
        let mut txn = self.storage.begin_transaction().await?;
        match self.decide(&mut txn, request, lane).await {
            Ok(Decision::Unchanged(outcome)) => {
                self.storage.abort_transaction(txn).await?;
                Ok(outcome)
            }
            Ok(Decision::Staged(outcome)) => {
                self.storage.commit_transaction(txn).await?;
                tracing::info!(
                    %lane,
                    snapshot_id = request.snapshot_id,
                    from = ?outcome.previous.map(|p| p.percent),
                    to = outcome.current.percent,
                    rollback = request.is_rollback,
                    "deployment applied"
                );
                Ok(outcome)
            }
            Err(e) => {
                let _ = self.storage.abort_transaction(txn).await;
                Err(e)
            }
        }
    }

    async fn decide(
        &self,
        txn: &mut S::Txn,
        request: &DeploymentRequest,
        lane: &Lane,
    ) -> Result<Decision, DeployError> {
        if let Some(row) = self
            .storage
            .find_by_deployment_key(txn, request.snapshot_id, lane, &request.deployment_key)
            .await?
        {
            tracing::info!(%lane, key = %request.deployment_key, "deployment key already applied");
            return Ok(Decision::Unchanged(DeploymentOutcome {
                current: CurrentState {
                    percent: row.percent,
                    is_active: row.is_active,
                    noop: true,
                },
                previous: None,
                replayed: true,
            }));
        }

        let record = self.storage.get_lane_for_update(txn, lane).await?;
        let previous = record.active_percent();
        let is_active = request.is_active && request.percent > 0;

        if let Some(active) = &record.active {
            let same_snapshot = active.snapshot_id == request.snapshot_id;
            // Another snapshot at the same percent swaps in, but only as an active row.
            if !request.is_rollback
                && active.percent == request.percent
                && (same_snapshot || !is_active)
            {
                tracing::warn!(%lane, percent = request.percent, "percent unchanged, nothing to do");
                return Ok(Decision::Unchanged(DeploymentOutcome {
                    current: CurrentState {
                        percent: active.percent,
                        is_active: true,
                        noop: true,
                    },
                    previous: Some(PreviousState {
                        percent: active.percent,
                    }),
                    replayed: false,
                }));
            }
            if !request.is_rollback && same_snapshot && request.percent < active.percent {
                return Err(DeployError::NonMonotonic {
                    lane: lane.clone(),
                    snapshot_id: request.snapshot_id,
                    current: active.percent,
                    requested: request.percent,
                });
            }
        }
        if !request.is_rollback {
            let current = previous.unwrap_or(0);
            let next = calculate_canary_step(current);
            if request.percent > next {
                return Err(DeployError::SkippedRung {
                    lane: lane.clone(),
                    current,
                    next,
                    requested: request.percent,
                });
            }
        }

        let now = self.clock.now();
        self.storage
            .deactivate_lane(txn, lane, record.revision)
            .await?;
        self.storage
            .insert_deployment(
                txn,
                NewDeployment {
                    snapshot_id: request.snapshot_id,
                    lane: lane.clone(),
                    percent: request.percent,
                    is_active,
                    activated_by: request.activated_by.clone(),
                    activated_at: now,
                    deployment_key: request.deployment_key.clone(),
                    is_rollback: request.is_rollback,
                },
            )
            .await?;
        self.storage
            .append_rollout_event(
                txn,
                RolloutEvent {
                    snapshot_id: request.snapshot_id,
                    target: lane.target.clone(),
                    region: lane.region.clone(),
                    from_percent: previous,
                    to_percent: request.percent,
                    is_rollback: request.is_rollback,
                    activated_by: request.activated_by.clone(),
                    timestamp: now,
                },
            )
            .await?;
        if is_active {
            self.storage
                .activate_snapshot(txn, request.snapshot_id)
                .await?;
        }

        Ok(Decision::Staged(DeploymentOutcome {
            current: CurrentState {
                percent: request.percent,
                is_active,
                noop: false,
            },
            previous: previous.map(|percent| PreviousState { percent }),
            replayed: false,
        }))
    }
}
