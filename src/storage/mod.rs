//! Persistence layer.
//!
//! The event log is the single source of truth; the views and snapshots
//! written here are always derivable from it.
//!
//! # Layout
//!
//! ```text
//! .roadmap/
//! ├── activity.jsonl      append-only event log (one JSON object per line)
//! ├── activity.lock       writer lock
//! ├── roadmap.json        ┐
//! ├── issues.json         ├ projected views
//! ├── lessons.json        ┘
//! └── snapshots/          forensic copies taken on corruption
//! ```
//!
//! # Modules
//!
//! - [`event_store`] - Event store trait, JSONL and in-memory implementations
//! - [`legacy`] - Normalization of older log records
//! - [`views`] - View persistence
//! - [`snapshot`] - Forensic snapshots

pub mod event_store;
pub mod legacy;
pub mod snapshot;
pub mod views;
