//! Seed files: snapshots and their rules loaded into a fresh store.
//!
//! ```json
//! {"snapshots": [
//!   {"version": "v1", "env": "prod", "notes": "baseline",
//!    "rules": [{"ruleName": "R1", "priority": 10}]}
//! ]}
//! ```
//!
//! Snapshots are created in file order, so the first one gets id 1.

use std::path::Path;

use serde::Deserialize;

use policyline_core::{ArtifactFormat, Rule, Snapshot};
use policyline_storage::{NewRule, NewSnapshot, PolicyStorage};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedFile {
    pub snapshots: Vec<SeedSnapshot>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SeedSnapshot {
    pub version: String,
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

fn default_env() -> String {
    "prod".to_string()
}

pub fn read_seed(path: &Path) -> Result<SeedFile, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("could not read '{}': {}", path.display(), e))?;
    serde_json::from_str(&content)
        .map_err(|e| format!("could not parse '{}': {}", path.display(), e))
}

/// Persist every seeded snapshot and its rules. Seeded snapshots are native
/// and inactive.
pub async fn apply_seed<S: PolicyStorage>(
    storage: &S,
    seed: SeedFile,
) -> Result<Vec<Snapshot>, String> {
    let mut created = Vec::with_capacity(seed.snapshots.len());
    for entry in seed.snapshots {
        let rules = entry
            .rules
            .iter()
            .map(|rule| NewRule::from_rule(0, rule))
            .collect();
        let (snapshot, _) = storage
            .create_snapshot_with_rules(
                NewSnapshot {
                    version: entry.version.clone(),
                    env: entry.env,
                    stage: "seed".to_string(),
                    artifact_format: ArtifactFormat::Native,
                    checksum: None,
                    size_bytes: 0,
                    notes: entry.notes,
                    parent_id: None,
                },
                rules,
            )
            .await
            .map_err(|e| format!("seeding {}: {}", entry.version, e))?;
        tracing::info!(snapshot_id = snapshot.id, version = %snapshot.version, "seeded snapshot");
        created.push(snapshot);
    }
    Ok(created)
}
