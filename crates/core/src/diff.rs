//! Rule diff engine.
//!
//! Applies a proposal's ordered change-set to the rules of its base snapshot
//! and produces a draft snapshot plus its rule set. The engine is pure: it
//! never persists anything, the caller owns that.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::digest::json_digest;
use crate::model::{
    ArtifactFormat, Change, ChangeAction, Proposal, Rule, RuleId, Snapshot, DRAFT_ID,
};

/// Keys of a rule that a MODIFY overlay can never change.
const PROTECTED_FIELDS: &[&str] = &["id", "snapshotId"];

/// What to do when MODIFY or DELETE names a rule the base does not contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingRule {
    /// Skip the change and record it in [`RuleSetDiff::ignored`].
    #[default]
    Ignore,
    /// Fail the whole build with [`DiffError::RuleNotFound`].
    Reject,
}

/// Settings for [`build_snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    pub env: String,
    pub stage: String,
    pub missing_rule: MissingRule,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            env: "prod".to_string(),
            stage: "draft".to_string(),
            missing_rule: MissingRule::Ignore,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DiffError {
    /// MODIFY/DELETE named a rule that is not present (only with [`MissingRule::Reject`]).
    #[error("change {index} ({action}) targets rule {}, which is not in the base rule set", display_id(.rule_id))]
    RuleNotFound {
        index: usize,
        action: ChangeAction,
        rule_id: Option<RuleId>,
    },

    #[error("change {index} carries invalid rule data: {reason}")]
    InvalidRuleData { index: usize, reason: String },

    #[error("change {index} would create a second rule named '{rule_name}'")]
    DuplicateRuleName { index: usize, rule_name: String },

    #[error("could not serialize the resulting rule set: {0}")]
    Serialize(String),
}

fn display_id(id: &Option<RuleId>) -> String {
    id.map_or_else(|| "<none>".to_string(), |id| id.to_string())
}

/// Rule names touched by a build, in the order the changes named them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSetDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
    /// Indices of MODIFY/DELETE changes skipped because their target was absent.
    pub ignored: Vec<usize>,
}

impl RuleSetDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    /// Format the diff as human-readable text.
    pub fn to_text(&self) -> String {
        let mut lines = Vec::new();
        for name in &self.added {
            lines.push(format!("+ {}", name));
        }
        for name in &self.removed {
            lines.push(format!("- {}", name));
        }
        for name in &self.modified {
            lines.push(format!("~ {}", name));
        }
        for index in &self.ignored {
            lines.push(format!("! change {} skipped: target rule absent", index));
        }
        lines.join("\n")
    }
}

/// A built, unpersisted snapshot and the rules it owns.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotDraft {
    pub snapshot: Snapshot,
    pub rules: Vec<Rule>,
    pub diff: RuleSetDiff,
}

/// Build a draft snapshot from `proposal` applied onto `base_rules`.
///
/// Only rules whose `snapshot_id` equals `proposal.base_snapshot_id` are
/// taken as the starting set; a base id below 1 starts from nothing. Cloned
/// rules keep their ids inside the draft so MODIFY/DELETE can address them;
/// the store assigns fresh ids when the draft is persisted.
pub fn build_snapshot(
    proposal: &Proposal,
    base_rules: &[Rule],
    options: &BuildOptions,
) -> Result<SnapshotDraft, DiffError> {
    let mut rules: Vec<Rule> = if proposal.base_snapshot_id < 1 {
        Vec::new()
    } else {
        base_rules
            .iter()
            .filter(|r| r.snapshot_id == proposal.base_snapshot_id)
            .cloned()
            .map(|mut r| {
                r.snapshot_id = DRAFT_ID;
                r
            })
            .collect()
    };

    let mut next_id = rules.iter().map(|r| r.id).max().unwrap_or(0).max(0) + 1;
    let mut diff = RuleSetDiff::default();

    for (index, change) in proposal.changes.iter().enumerate() {
        match change.action {
            ChangeAction::Create => {
                let mut rule = parse_created_rule(index, change)?;
                ensure_unique_name(&rules, None, &rule.rule_name, index)?;
                rule.id = next_id;
                rule.snapshot_id = DRAFT_ID;
                rule.disabled = false;
                next_id += 1;
                diff.added.push(rule.rule_name.clone());
                rules.push(rule);
            }
            ChangeAction::Delete => match locate(&rules, change.rule_id) {
                Some(pos) => {
                    let removed = rules.remove(pos);
                    diff.removed.push(removed.rule_name);
                }
                None => skip_missing(index, change, options.missing_rule, &mut diff)?,
            },
            ChangeAction::Modify => match locate(&rules, change.rule_id) {
                Some(pos) => {
                    let merged = merge_rule(index, &rules[pos], change.rule_data.as_ref())?;
                    ensure_unique_name(&rules, Some(pos), &merged.rule_name, index)?;
                    if !diff.modified.contains(&merged.rule_name) {
                        diff.modified.push(merged.rule_name.clone());
                    }
                    rules[pos] = merged;
                }
                None => skip_missing(index, change, options.missing_rule, &mut diff)?,
            },
        }
    }

    let (checksum, size_bytes) =
        json_digest(&rules).map_err(|e| DiffError::Serialize(e.to_string()))?;

    let snapshot = Snapshot {
        id: DRAFT_ID,
        version: proposal.new_version.clone(),
        env: options.env.clone(),
        stage: options.stage.clone(),
        is_active: false,
        artifact_format: ArtifactFormat::Native,
        checksum: Some(checksum),
        size_bytes,
        created_at: None,
        notes: (!proposal.reason.is_empty()).then(|| proposal.reason.clone()),
        parent_id: (proposal.base_snapshot_id > 0).then_some(proposal.base_snapshot_id),
    };

    Ok(SnapshotDraft {
        snapshot,
        rules,
        diff,
    })
}

/// Rule ids that `proposal` deletes, for callers that want to pre-check a build.
pub fn deleted_rule_ids(proposal: &Proposal) -> BTreeSet<RuleId> {
    proposal
        .changes
        .iter()
        .filter(|c| c.action == ChangeAction::Delete)
        .filter_map(|c| c.rule_id)
        .collect()
}

fn locate(rules: &[Rule], rule_id: Option<RuleId>) -> Option<usize> {
    let rule_id = rule_id?;
    rules.iter().position(|r| r.id == rule_id)
}

fn skip_missing(
    index: usize,
    change: &Change,
    policy: MissingRule,
    diff: &mut RuleSetDiff,
) -> Result<(), DiffError> {
    match policy {
        MissingRule::Ignore => {
            diff.ignored.push(index);
            Ok(())
        }
        MissingRule::Reject => Err(DiffError::RuleNotFound {
            index,
            action: change.action,
            rule_id: change.rule_id,
        }),
    }
}

fn parse_created_rule(index: usize, change: &Change) -> Result<Rule, DiffError> {
    let data = change
        .rule_data
        .as_ref()
        .ok_or_else(|| DiffError::InvalidRuleData {
            index,
            reason: "CREATE requires ruleData".to_string(),
        })?;
    if !data.is_object() {
        return Err(DiffError::InvalidRuleData {
            index,
            reason: "ruleData must be a JSON object".to_string(),
        });
    }
    serde_json::from_value(data.clone()).map_err(|e| DiffError::InvalidRuleData {
        index,
        reason: e.to_string(),
    })
}

/// Shallow merge: each top-level key of `data` replaces the rule's key.
fn merge_rule(index: usize, rule: &Rule, data: Option<&Value>) -> Result<Rule, DiffError> {
    let Some(data) = data else {
        return Ok(rule.clone());
    };
    let overlay = data.as_object().ok_or_else(|| DiffError::InvalidRuleData {
        index,
        reason: "ruleData must be a JSON object".to_string(),
    })?;

    let mut base = serde_json::to_value(rule).map_err(|e| DiffError::Serialize(e.to_string()))?;
    if let Some(fields) = base.as_object_mut() {
        for (key, value) in overlay {
            if PROTECTED_FIELDS.contains(&key.as_str()) {
                continue;
            }
            fields.insert(key.clone(), value.clone());
        }
    }

    serde_json::from_value(base).map_err(|e| DiffError::InvalidRuleData {
        index,
        reason: e.to_string(),
    })
}

fn ensure_unique_name(
    rules: &[Rule],
    except: Option<usize>,
    name: &str,
    index: usize,
) -> Result<(), DiffError> {
    let clash = rules
        .iter()
        .enumerate()
        .any(|(pos, r)| Some(pos) != except && r.rule_name == name);
    if clash {
        return Err(DiffError::DuplicateRuleName {
            index,
            rule_name: name.to_string(),
        });
    }
    Ok(())
}
