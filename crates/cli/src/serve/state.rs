//! Application state shared across request handlers.

use policyline_pipeline::DeploymentLedger;
use policyline_storage::{CachedStore, MemoryStorage};

pub(crate) struct AppState {
    /// Read-through cache for the list endpoints.
    pub(crate) store: CachedStore<MemoryStorage>,
    pub(crate) ledger: DeploymentLedger<MemoryStorage>,
    /// Used for rollbacks that do not name who asked for them.
    pub(crate) activated_by: String,
}
