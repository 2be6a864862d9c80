//! # palisade-agent
//!
//! The in-line Palisade agent: terminates client connections, evaluates the
//! rule set on the traffic, optionally blocks it, and forwards surviving
//! traffic to the configured backend. One listener per configured service;
//! HTTP(S) requests, WebSocket messages, and TCP chunks are each inspected
//! and shipped to the collector as structured log records.

pub mod server;
pub mod tls;
