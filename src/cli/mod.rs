//! CLI commands and argument parsing.
//!
//! Built on [`clap`](https://docs.rs/clap). Each command maps to one
//! [`Workspace`](crate::core::workspace::Workspace) operation.
//!
//! # Output Formats
//!
//! Commands support multiple output formats via the `-f`/`--format` flag:
//!
//! - `table` - Human-readable output (default)
//! - `json` - Machine-readable JSON wrapped in `{success, data|error}`
//! - `yaml` - The same envelope as YAML
//!
//! # Example
//!
//! ```bash,no_run
//! tasklog init
//! tasklog run --steps 9
//! tasklog verify -f json
//! ```
//!
//! # Modules
//!
//! - [`commands`] - Command definitions
//! - [`output`] - Output formatting and table rendering

pub mod commands;
pub mod output;
