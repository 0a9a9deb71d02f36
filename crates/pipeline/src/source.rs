//! Proposal producers.
//!
//! Where a proposal comes from (a person, a script, a language model) is
//! outside the pipeline. The pipeline only needs a structured [`Proposal`]
//! or a clear "could not propose".

use std::sync::Mutex;

use async_trait::async_trait;
use policyline_core::Proposal;

/// Produces a change proposal for an intent.
///
/// Returning `None` means the source could not come up with a proposal.
#[async_trait]
pub trait ProposalSource: Send + Sync {
    async fn generate_proposal(
        &self,
        intent: &str,
        base_version: Option<&str>,
        context: &str,
    ) -> Option<Proposal>;
}

/// Hands out pre-built proposals in order, then `None`.
///
/// Used by the CLI (a proposal read from a file) and by tests.
#[derive(Debug, Default)]
pub struct StaticProposalSource {
    queue: Mutex<Vec<Proposal>>,
}

impl StaticProposalSource {
    pub fn new(proposals: Vec<Proposal>) -> Self {
        let mut queue = proposals;
        queue.reverse();
        Self {
            queue: Mutex::new(queue),
        }
    }

    pub fn single(proposal: Proposal) -> Self {
        Self::new(vec![proposal])
    }

    pub fn remaining(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl ProposalSource for StaticProposalSource {
    async fn generate_proposal(
        &self,
        intent: &str,
        base_version: Option<&str>,
        _context: &str,
    ) -> Option<Proposal> {
        let next = self.queue.lock().unwrap_or_else(|e| e.into_inner()).pop();
        if next.is_none() {
            tracing::warn!(intent, base_version, "no proposal left to hand out");
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(version: &str) -> Proposal {
        Proposal {
            id: 0,
            base_snapshot_id: 0,
            new_version: version.to_string(),
            reason: String::new(),
            changes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn hands_out_in_order_then_runs_dry() {
        let source = StaticProposalSource::new(vec![proposal("v1"), proposal("v2")]);
        let first = source.generate_proposal("x", None, "").await.unwrap();
        let second = source.generate_proposal("x", Some("v1"), "").await.unwrap();
        assert_eq!(first.new_version, "v1");
        assert_eq!(second.new_version, "v2");
        assert!(source.generate_proposal("x", None, "").await.is_none());
        assert_eq!(source.remaining(), 0);
    }
}
