//! Collector wire model: findings, verdicts, and log records.
//!
//! Field names follow the collector's JSON contract exactly; everything the
//! agent ships is serialized from these types.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// The outcome of reducing a set of findings against the configured default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Drop,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Allow => write!(f, "allow"),
            Verdict::Drop => write!(f, "drop"),
        }
    }
}

/// Which protocol handler produced a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Http,
    Websocket,
    Tcp,
    Udp,
}

/// Direction of a TCP chunk relative to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client towards upstream.
    Ingress,
    /// Upstream towards client.
    Egress,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Ingress => write!(f, "ingress"),
            Direction::Egress => write!(f, "egress"),
        }
    }
}

/// One rule match against one subject.
///
/// `line` and `line_index` locate the match inside the canonical dumped form
/// of the subject (LF-split lines, byte offset within the line). A finding
/// references its rule by id; it does not own it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub rule_id: String,
    pub rule_name: String,
    pub rule_description: String,
    pub line: i64,
    pub line_index: i64,
    pub length: i64,
    pub matched_string: String,
    #[serde(default)]
    pub matched_body_hash: String,
    #[serde(default)]
    pub matched_body_hash_alg: String,
    pub classification: String,
    /// Wire severity: 0 = low, 1 = medium, 2 = high, 3 = critical.
    pub severity: i64,
}

/// What the agent ships to the collector per inspected unit: one record per
/// HTTP exchange, one per WebSocket message, one per TCP chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub agent_id: String,
    pub remote_ip: String,
    /// Unix seconds at the time the unit was observed.
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub log_type: LogType,
    /// Base64 of the request bytes; empty for egress-only units.
    #[serde(default)]
    pub request: String,
    /// Base64 of the response bytes; empty for ingress-only units.
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub request_findings: Vec<Finding>,
    #[serde(default)]
    pub response_findings: Vec<Finding>,
    pub verdict: Verdict,
    /// TCP only: identifies the client connection this chunk belongs to.
    #[serde(rename = "streamUUID", skip_serializing_if = "Option::is_none")]
    pub stream_uuid: Option<String>,
    /// TCP only: position of this chunk in the stream's total order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_index: Option<i64>,
    /// TCP only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
}

impl LogRecord {
    /// A record with the common fields filled in and everything else empty.
    pub fn new(agent_id: &str, remote_ip: &str, log_type: LogType, verdict: Verdict) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            remote_ip: remote_ip.to_string(),
            timestamp: Utc::now().timestamp(),
            log_type,
            request: String::new(),
            response: String::new(),
            request_findings: Vec::new(),
            response_findings: Vec::new(),
            verdict,
            stream_uuid: None,
            stream_index: None,
            direction: None,
        }
    }
}
