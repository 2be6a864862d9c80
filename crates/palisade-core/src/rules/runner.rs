//! Stateless facade that applies the rule set to protocol subjects.

use std::sync::Arc;

use tracing::trace;

use crate::dump::{RequestDump, ResponseDump};
use crate::record::{Direction, Finding};
use crate::rules::matcher::{MatchHit, Subject};
use crate::rules::{Rule, RuleScope};

/// Frame type of an inspected WebSocket message. Every `ws-message` rule
/// currently runs against both kinds; the type is carried for logging and
/// for matchers that may discriminate on it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsMessageKind {
    Text,
    Binary,
}

/// Applies the shared, read-only rule set to requests, responses,
/// WebSocket messages, and TCP chunks. Rules run in load order; multiple
/// matches of one rule appear in match order.
#[derive(Debug, Clone)]
pub struct RuleRunner {
    rules: Arc<Vec<Rule>>,
}

impl RuleRunner {
    pub fn new(rules: Arc<Vec<Rule>>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Apply all `http-request` rules to the canonical dump of a request.
    pub fn run_on_request(&self, dump: &RequestDump) -> Vec<Finding> {
        let text = dump.canonical_text();
        let subject = Subject {
            text: &text,
            body: &dump.body,
            body_line_offset: dump.body_line_offset(),
        };
        self.run_scope(RuleScope::HttpRequest, &subject)
    }

    /// Apply all `http-response` rules to the canonical dump of a response.
    pub fn run_on_response(&self, dump: &ResponseDump) -> Vec<Finding> {
        let text = dump.canonical_text();
        let subject = Subject {
            text: &text,
            body: &dump.body,
            body_line_offset: dump.body_line_offset(),
        };
        self.run_scope(RuleScope::HttpResponse, &subject)
    }

    /// Apply all `ws-message` rules to a WebSocket message payload.
    pub fn run_on_ws_message(&self, kind: WsMessageKind, payload: &[u8]) -> Vec<Finding> {
        trace!(?kind, bytes = payload.len(), "running websocket rules");
        let text = String::from_utf8_lossy(payload);
        self.run_scope(RuleScope::WsMessage, &Subject::raw(&text, payload))
    }

    /// Apply the directional TCP rules to one chunk.
    pub fn run_on_tcp_chunk(&self, direction: Direction, chunk: &[u8]) -> Vec<Finding> {
        let scope = match direction {
            Direction::Ingress => RuleScope::TcpIngress,
            Direction::Egress => RuleScope::TcpEgress,
        };
        let text = String::from_utf8_lossy(chunk);
        self.run_scope(scope, &Subject::raw(&text, chunk))
    }

    fn run_scope(&self, scope: RuleScope, subject: &Subject<'_>) -> Vec<Finding> {
        let mut findings = Vec::new();
        for rule in self.rules.iter().filter(|r| r.applies_to(scope)) {
            for hit in rule.matcher.evaluate(subject) {
                findings.push(finding_for(rule, hit));
            }
        }
        findings
    }
}

fn finding_for(rule: &Rule, hit: MatchHit) -> Finding {
    let (hash, alg) = hit.body_hash.unwrap_or_default();
    Finding {
        rule_id: rule.id.clone(),
        rule_name: rule.name.clone(),
        rule_description: rule.description.clone(),
        line: hit.line,
        line_index: hit.line_index,
        length: hit.length,
        matched_string: hit.matched,
        matched_body_hash: hash,
        matched_body_hash_alg: alg,
        classification: rule.classification.clone(),
        severity: rule.severity.as_wire(),
    }
}
