//! Core domain: events, state, projection, validation and the cycle.
//!
//! The event log is the single source of truth. Everything else is derived
//! by replaying it.
//!
//! # Architecture
//!
//! ```text
//! Producer output → Validator → Events (append-only) → Projection → Views
//!                                    ↑                                 │
//!                                    └──────── Orchestrator ◀──────────┘
//! ```
//!
//! ## Events
//!
//! Events are immutable and strictly ordered by `event_seq`. See [`events`]
//! for the action vocabulary and [`EventId`](events::EventId).
//!
//! ## Views
//!
//! [`projection::project`] folds the full ordered log into the roadmap,
//! issues and lessons views. Each roadmap carries the SHA-256 of its
//! canonical JSON ([`canonical`]), which [`verify`] recomputes to detect
//! drift between the log and the stored views.
//!
//! ## Validation
//!
//! Producer output is checked against the [`contract`], the task
//! [`transitions`] table and the writable-path [`boundary`] before anything
//! is appended. Rejections are recorded facts, not errors.
//!
//! ## Errors
//!
//! All errors are structured with a category, a stable code, a message, an
//! origin and an optional recovery hint. See [`error`] for
//! [`TasklogError`](error::TasklogError) and [`Result`](error::Result).
//!
//! # Modules
//!
//! - [`events`] - Event definitions and the action vocabulary
//! - [`state`] - Task, issue and lesson types
//! - [`projection`] - Pure replay into views
//! - [`canonical`] - Canonical JSON and projection hashing
//! - [`verify`] - Stored-view verification
//! - [`validator`] - Producer output validation
//! - [`scheduler`] - Work selection and dispatch context
//! - [`cycle`] - The orchestrator
//! - [`workspace`] - On-disk workspace operations

pub mod boundary;
pub mod canonical;
pub mod clock;
pub mod contract;
pub mod cycle;
pub mod envelope;
pub mod error;
pub mod events;
pub mod policy;
pub mod projection;
pub mod scheduler;
pub mod state;
pub mod transitions;
pub mod validator;
pub mod verify;
pub mod workspace;
