//! Verdict resolution: reduce findings plus the configured default into
//! allow or drop.

use crate::record::{Finding, Verdict};
use crate::rules::{Rule, RuleAction};

/// Resolve the verdict for a set of findings.
///
/// Any finding whose rule action is `drop` -- or whose rule carries no
/// action at all -- drops the subject. An empty finding set is allowed
/// unless the configured default action is `drop`; the default is the
/// fallback for empty finding sets and for rules without an action, not a
/// blanket policy.
pub fn resolve(findings: &[Finding], rules: &[Rule], default_action: Option<RuleAction>) -> Verdict {
    if findings.is_empty() {
        return match default_action {
            Some(RuleAction::Drop) => Verdict::Drop,
            _ => Verdict::Allow,
        };
    }

    for finding in findings {
        // An unknown rule id resolves like a rule with no action: drop.
        let action = rules
            .iter()
            .find(|r| r.id == finding.rule_id)
            .and_then(|r| r.action);
        match action {
            Some(RuleAction::Allow) => {}
            Some(RuleAction::Drop) | None => return Verdict::Drop,
        }
    }

    Verdict::Allow
}
