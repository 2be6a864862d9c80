//! # palisade-core
//!
//! Core type system for Palisade -- a distributed web-application firewall.
//!
//! This crate defines the shared types used across the Palisade components:
//! the agent configuration document, the rule model and its evaluation
//! engine, the verdict resolver, the canonical HTTP dump used as the
//! substrate for rule matching, and the wire model the agent ships to the
//! collector.

pub mod config;
pub mod dump;
pub mod record;
pub mod rules;
