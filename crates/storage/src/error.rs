use policyline_core::{Lane, SnapshotId};

/// All errors that can be returned by a PolicyStorage implementation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    /// Optimistic concurrency conflict: another writer changed the lane after
    /// it was read. The expected revision was not found.
    #[error("concurrent conflict on lane {lane}: expected revision {expected_revision}")]
    LaneConflict { lane: Lane, expected_revision: i64 },

    #[error("snapshot not found: {id}")]
    SnapshotNotFound { id: SnapshotId },

    /// Snapshot versions are globally unique.
    #[error("snapshot version already exists: {version}")]
    DuplicateVersion { version: String },

    /// Rule names are unique within their snapshot.
    #[error("rule '{rule_name}' already exists in snapshot {snapshot_id}")]
    DuplicateRuleName {
        snapshot_id: SnapshotId,
        rule_name: String,
    },

    /// A record violated a store-level constraint (e.g. percent above 100).
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// A backend-specific storage error (DB connection, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}
