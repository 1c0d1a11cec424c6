//! Tasklog - an event-sourced, fail-closed orchestration core for
//! multi-agent task workflows.
//!
//! Producers propose work as JSON envelopes; the orchestrator validates
//! them, records accepted facts in an append-only log and projects the log
//! into deterministic, hash-verifiable views.

pub mod adapters;
pub mod cli;
pub mod core;
pub mod storage;
