//! Validation gate: a suite of per-rule checks producing a report.

use policyline_core::{Rule, SnapshotId, ValidationReport};

/// One conflict predicate. Returns a conflict message for an offending rule.
///
/// `all` is the complete rule set under validation, for checks that compare
/// rules with each other.
pub trait RuleCheck: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, rule: &Rule, all: &[Rule]) -> Option<String>;
}

/// Negative priority is treated as an anomaly signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct NegativePriority;

impl RuleCheck for NegativePriority {
    fn name(&self) -> &'static str {
        "negative-priority"
    }

    fn check(&self, rule: &Rule, _all: &[Rule]) -> Option<String> {
        (rule.priority < 0).then(|| format!("Rule {} has invalid priority", rule.rule_name))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DuplicateRuleName;

impl RuleCheck for DuplicateRuleName {
    fn name(&self) -> &'static str {
        "duplicate-rule-name"
    }

    fn check(&self, rule: &Rule, all: &[Rule]) -> Option<String> {
        let count = all.iter().filter(|r| r.rule_name == rule.rule_name).count();
        (count > 1).then(|| format!("Rule {} is defined {} times", rule.rule_name, count))
    }
}

/// An enabled rule that emits nothing can never have an effect.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyEmissions;

impl RuleCheck for EmptyEmissions {
    fn name(&self) -> &'static str {
        "empty-emissions"
    }

    fn check(&self, rule: &Rule, _all: &[Rule]) -> Option<String> {
        (!rule.disabled && rule.emissions.is_empty())
            .then(|| format!("Rule {} has no emissions", rule.rule_name))
    }
}

pub struct ValidationGate {
    checks: Vec<Box<dyn RuleCheck>>,
}

impl Default for ValidationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationGate {
    /// Gate with the negative-priority check only.
    pub fn new() -> Self {
        Self::with_checks(vec![Box::new(NegativePriority)])
    }

    pub fn with_checks(checks: Vec<Box<dyn RuleCheck>>) -> Self {
        Self { checks }
    }

    /// Every built-in check.
    pub fn strict() -> Self {
        Self::with_checks(vec![
            Box::new(NegativePriority),
            Box::new(DuplicateRuleName),
            Box::new(EmptyEmissions),
        ])
    }

    pub fn check_names(&self) -> Vec<&'static str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    /// Run every check over every rule.
    ///
    /// `passed` counts rules without conflicts, `failed` rules with at least
    /// one. Conflicts are listed in rule order, then check order.
    pub fn run(&self, snapshot_id: SnapshotId, rules: &[Rule]) -> ValidationReport {
        let mut conflicts = Vec::new();
        let mut failed = 0;
        for rule in rules {
            let before = conflicts.len();
            conflicts.extend(self.checks.iter().filter_map(|c| c.check(rule, rules)));
            if conflicts.len() > before {
                failed += 1;
            }
        }
        let passed = rules.len() - failed;
        let simulation_score = if rules.is_empty() {
            1.0
        } else {
            passed as f64 / rules.len() as f64
        };

        if failed > 0 {
            tracing::warn!(snapshot_id, failed, "validation found conflicts");
        } else {
            tracing::info!(snapshot_id, passed, "validation passed");
        }

        ValidationReport {
            snapshot_id,
            passed,
            failed,
            conflicts,
            simulation_score,
        }
    }
}
