//! CLI command definitions.
//!
//! Every workspace operation is reachable from here. Output is rendered by
//! [`super::output`].

use super::output::OutputFormat;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Tasklog CLI - event-sourced orchestration for multi-agent task workflows.
#[derive(Parser)]
#[command(name = "tasklog")]
#[command(
    version,
    about,
    long_about = "Event-sourced, fail-closed orchestration for multi-agent task workflows.\n\nStart with: tasklog init && tasklog run"
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Workspace root (defaults to $TASKLOG_ROOT, then the current directory)
    #[arg(long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'f', global = true, default_value = "table")]
    pub format: OutputFormat,

    /// Verbose output
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Top-level commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Show version information
    Version,

    /// Create `.roadmap/` and seed the event log
    Init(InitArgs),

    /// Run the orchestration cycle
    Run(RunArgs),

    /// Validate and apply one producer envelope
    Submit(SubmitArgs),

    /// Drain `.roadmap/inbox/*.json` in file-name order
    Process(ProcessArgs),

    /// Rebuild and save the views from the full log
    Project,

    /// Compare the stored roadmap with a fresh replay (read-only)
    Verify,

    /// Project a prefix of the log
    Replay(ReplayArgs),

    /// Show run, tasks and open issues
    Status,

    /// Task management commands
    #[command(subcommand)]
    Task(TaskCommands),

    /// Issue management commands
    #[command(subcommand)]
    Issue(IssueCommands),
}

/// Arguments for init.
#[derive(Args)]
pub struct InitArgs {
    /// Run identifier recorded on `run.start`
    #[arg(long, default_value = "RUN-0001")]
    pub run_id: String,

    /// Master correlation id recorded on `run.start`
    #[arg(long, default_value = "CID-TASKLOG-INIT")]
    pub master_correlation_id: String,

    /// Discard an existing event log
    #[arg(long)]
    pub force: bool,
}

/// Arguments for run.
#[derive(Args)]
pub struct RunArgs {
    /// Maximum number of dispatches
    #[arg(long, default_value = "1")]
    pub steps: usize,

    /// Work on an in-memory copy; nothing is persisted
    #[arg(long)]
    pub dry_run: bool,

    /// Actor id for the command producer
    #[arg(long, default_value = "agent-command")]
    pub producer_id: String,

    /// Upper bound in seconds on one producer call
    #[arg(long, requires = "producer_cmd")]
    pub producer_timeout: Option<u64>,

    /// External producer: program and arguments (consumes the rest of the line).
    /// The built-in mock producer is used when absent.
    #[arg(
        long,
        num_args = 1..,
        allow_hyphen_values = true,
        value_name = "CMD"
    )]
    pub producer_cmd: Vec<String>,
}

/// Arguments for submit.
#[derive(Args)]
pub struct SubmitArgs {
    /// Envelope file, or `-` for stdin
    pub file: String,

    /// Producer identity the output is attributed to
    #[arg(long)]
    pub actor: String,

    /// Work on an in-memory copy; nothing is persisted
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for process.
#[derive(Args)]
pub struct ProcessArgs {
    /// Work on an in-memory copy; inbox files are left in place
    #[arg(long)]
    pub dry_run: bool,
}

/// Arguments for replay.
#[derive(Args)]
pub struct ReplayArgs {
    /// Last `event_seq` (digits) or `event_id` to include
    #[arg(long)]
    pub until: Option<String>,

    /// Do not write the replayed views
    #[arg(long)]
    pub no_write: bool,
}

/// Task subcommands.
#[derive(Subcommand)]
pub enum TaskCommands {
    /// Add a task to the roadmap
    Add(TaskAddArgs),
}

/// Arguments for task add.
#[derive(Args)]
pub struct TaskAddArgs {
    /// Task ID
    #[arg(long)]
    pub id: String,

    /// Task kind (`spec`, `impl`, `qa` or a custom kind)
    #[arg(long)]
    pub kind: String,

    /// Task title
    #[arg(long)]
    pub title: String,

    /// Task description (defaults to the title)
    #[arg(long, short = 'd')]
    pub description: Option<String>,

    /// Dependency task ID (repeatable)
    #[arg(long = "depends-on")]
    pub depends_on: Vec<String>,

    /// Expected output file (repeatable)
    #[arg(long = "output")]
    pub outputs: Vec<String>,
}

/// Issue subcommands.
#[derive(Subcommand)]
pub enum IssueCommands {
    /// Resolve an open issue and unblock its tasks
    Resolve(IssueResolveArgs),
}

/// Arguments for issue resolve.
#[derive(Args)]
pub struct IssueResolveArgs {
    /// Issue ID
    pub issue_id: String,

    /// Resolution note recorded on the issue
    #[arg(long)]
    pub note: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn producer_cmd_takes_the_rest_of_the_line() {
        let cli = Cli::try_parse_from([
            "tasklog",
            "run",
            "--steps",
            "3",
            "--producer-cmd",
            "python3",
            "agent.py",
            "--fast",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Run(args)) => {
                assert_eq!(args.steps, 3);
                assert_eq!(args.producer_cmd, vec!["python3", "agent.py", "--fast"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli =
            Cli::try_parse_from(["tasklog", "status", "--root", "/tmp/w", "-f", "json"]).unwrap();
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/w")));
        assert_eq!(cli.format, OutputFormat::Json);
    }
}
