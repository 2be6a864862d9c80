//! Rule model and evaluation engine.
//!
//! Rules are loaded once at startup and immutable afterwards; every handler
//! shares the same rule set by reference. The [`runner::RuleRunner`] facade
//! applies the applicable rules to a protocol subject and returns findings;
//! [`verdict::resolve`] reduces findings to an allow/drop verdict.

pub mod loader;
pub mod matcher;
pub mod runner;
pub mod verdict;


use serde::{Deserialize, Serialize};

use matcher::Matcher;

/// Severity of a rule, carried into every finding it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// The integer severity used on the collector wire (0..3).
    pub fn as_wire(self) -> i64 {
        match self {
            Severity::Low => 0,
            Severity::Medium => 1,
            Severity::High => 2,
            Severity::Critical => 3,
        }
    }
}

/// Action a rule requests when it matches. Rules without an action fall
/// through to the verdict resolver's drop-by-default handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Drop,
}

/// Protocol subjects a rule can apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleScope {
    HttpRequest,
    HttpResponse,
    WsMessage,
    TcpIngress,
    TcpEgress,
}

/// A compiled rule: identity, scopes, and a ready-to-run matcher.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub description: String,
    pub severity: Severity,
    pub classification: String,
    pub action: Option<RuleAction>,
    pub scopes: Vec<RuleScope>,
    pub matcher: Matcher,
}

impl Rule {
    pub fn applies_to(&self, scope: RuleScope) -> bool {
        self.scopes.contains(&scope)
    }
}
