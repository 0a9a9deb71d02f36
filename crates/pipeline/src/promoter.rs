//! Native → wasm artifact promotion.

use async_trait::async_trait;
use policyline_core::digest::json_digest;
use policyline_core::{ArtifactFormat, Rule, Snapshot, SnapshotId};
use policyline_storage::PolicyStorage;

use crate::error::PromoteError;

/// What a compiler reports about the artifact it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOutput {
    /// Number of rules that made it into the artifact.
    pub compiled_count: usize,
    pub artifact_hash: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct CompileError(pub String);

/// Turns a snapshot's rules into an executable artifact.
///
/// Only the artifact metadata matters here; what the artifact does at
/// evaluation time is the engine's business.
#[async_trait]
pub trait Compiler: Send + Sync {
    async fn compile(
        &self,
        snapshot_id: SnapshotId,
        rules: &[Rule],
    ) -> Result<CompileOutput, CompileError>;
}

/// Compiler that "builds" the canonical JSON of the enabled rules and
/// reports its sha256 and length.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestCompiler;

#[async_trait]
impl Compiler for DigestCompiler {
    async fn compile(
        &self,
        _snapshot_id: SnapshotId,
        rules: &[Rule],
    ) -> Result<CompileOutput, CompileError> {
        let enabled: Vec<&Rule> = rules.iter().filter(|r| !r.disabled).collect();
        let (artifact_hash, size_bytes) =
            json_digest(&enabled).map_err(|e| CompileError(e.to_string()))?;
        Ok(CompileOutput {
            compiled_count: enabled.len(),
            artifact_hash,
            size_bytes,
        })
    }
}

/// Moves persisted snapshots from `native` to `wasm`.
pub struct ArtifactPromoter {
    compiler: Box<dyn Compiler>,
}

impl ArtifactPromoter {
    pub fn new(compiler: Box<dyn Compiler>) -> Self {
        Self { compiler }
    }

    /// Promote `snapshot` to wasm, recording the compiler's checksum and size.
    ///
    /// A snapshot that is already wasm comes back unchanged without a
    /// compiler call. On compiler failure the stored snapshot is untouched.
    pub async fn promote<S: PolicyStorage>(
        &self,
        storage: &S,
        snapshot: &Snapshot,
        rules: &[Rule],
    ) -> Result<Snapshot, PromoteError> {
        if snapshot.is_draft() {
            return Err(PromoteError::UnsavedDraft {
                snapshot_id: snapshot.id,
            });
        }
        if snapshot.artifact_format == ArtifactFormat::Wasm {
            tracing::debug!(snapshot_id = snapshot.id, "already wasm, skipping compile");
            return Ok(snapshot.clone());
        }

        let output = self
            .compiler
            .compile(snapshot.id, rules)
            .await
            .map_err(|e| PromoteError::CompilationFailed {
                snapshot_id: snapshot.id,
                message: e.0,
            })?;

        let enabled = rules.iter().filter(|r| !r.disabled).count();
        if output.compiled_count != enabled {
            tracing::warn!(
                snapshot_id = snapshot.id,
                compiled = output.compiled_count,
                enabled,
                "compiled rule count differs from enabled rules"
            );
        }

        let promoted = storage
            .record_promotion(snapshot.id, &output.artifact_hash, output.size_bytes)
            .await?;
        tracing::info!(
            snapshot_id = promoted.id,
            size_bytes = promoted.size_bytes,
            "promoted snapshot to wasm"
        );
        Ok(promoted)
    }
}
