//! Tasklog CLI entrypoint.

use clap::error::ErrorKind;
use clap::Parser;
use std::ffi::OsString;
use std::io::Read;
use std::process;
use std::time::Duration;
use tasklog::adapters::{CommandConfig, CommandProducer, MockProducer, Producer};
use tasklog::cli::commands::{
    Cli, Commands, InitArgs, IssueCommands, ReplayArgs, RunArgs, SubmitArgs, TaskAddArgs,
    TaskCommands,
};
use tasklog::cli::output::{output, output_error, render_status, CliResponse, OutputFormat};
use tasklog::core::error::{ExitCode, TasklogError};
use tasklog::core::events::TaskSpec;
use tasklog::core::state::{TaskKind, VerifyStatus};
use tasklog::core::verify::VerifyReport;
use tasklog::core::workspace::{InitOptions, Workspace, WorkspaceConfig, ROOT_ENV};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable overriding the log filter.
const LOG_ENV: &str = "TASKLOG_LOG";

fn parse_format_from_args(args: &[OsString]) -> OutputFormat {
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        let s = arg.to_string_lossy();

        if s == "-f" || s == "--format" {
            if let Some(value) = iter.next() {
                return parse_format_value(&value.to_string_lossy());
            }
        }

        if let Some(value) = s.strip_prefix("--format=") {
            return parse_format_value(value);
        }
    }

    OutputFormat::Table
}

fn parse_format_value(value: &str) -> OutputFormat {
    let v = value.to_lowercase();
    if v == "json" {
        OutputFormat::Json
    } else if v == "yaml" || v == "yml" {
        OutputFormat::Yaml
    } else {
        OutputFormat::Table
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    // A second init (tests driving `run` twice) is harmless.
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(filter)
        .try_init();
}

fn print_structured<T: serde::Serialize>(value: &T, format: OutputFormat, context: &str) {
    match format {
        OutputFormat::Table => {
            if let Ok(json) = serde_json::to_string_pretty(value) {
                println!("{json}");
            }
        }
        _ => {
            if let Err(err) = output(value, format) {
                eprintln!("Failed to render {context}: {err}");
            }
        }
    }
}

fn output_help(help: &str, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            print!("{help}");
        }
        OutputFormat::Json => {
            let response = CliResponse::success(serde_json::json!({ "help": help }));
            if let Ok(json) = serde_json::to_string_pretty(&response) {
                println!("{json}");
            }
        }
        OutputFormat::Yaml => {
            let response = CliResponse::success(serde_json::json!({ "help": help }));
            if let Ok(yaml) = serde_yaml::to_string(&response) {
                print!("{yaml}");
            }
        }
    }
}

fn output_version(format: OutputFormat) {
    let version = env!("CARGO_PKG_VERSION");
    match format {
        OutputFormat::Table => {
            println!("tasklog {version}");
        }
        _ => print_structured(
            &serde_json::json!({ "name": "tasklog", "version": version }),
            format,
            "version",
        ),
    }
}

fn handle_clap_error(err: &clap::Error, format: OutputFormat) -> ExitCode {
    match err.kind() {
        ErrorKind::DisplayHelp => {
            let rendered = err.render().to_string();
            output_help(&rendered, format);
            ExitCode::Success
        }
        ErrorKind::DisplayVersion => {
            output_version(format);
            ExitCode::Success
        }
        _ => {
            eprintln!("{}", err.render());
            ExitCode::Error
        }
    }
}

fn main() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let is_broken_pipe = info
            .payload()
            .downcast_ref::<&str>()
            .is_some_and(|s| s.contains("Broken pipe"))
            || info
                .payload()
                .downcast_ref::<String>()
                .is_some_and(|s| s.contains("Broken pipe"));

        if is_broken_pipe {
            return;
        }

        default_hook(info);
    }));

    let args: Vec<OsString> = std::env::args_os().collect();
    let format = parse_format_from_args(&args);

    let result = std::panic::catch_unwind(|| Cli::try_parse_from(&args).map(run));

    match result {
        Ok(Ok(exit_code)) => process::exit(i32::from(exit_code)),
        Ok(Err(e)) => process::exit(i32::from(handle_clap_error(&e, format))),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("panic");

            if msg.contains("Broken pipe") {
                process::exit(0);
            }

            std::panic::resume_unwind(payload);
        }
    }
}

fn run(cli: Cli) -> ExitCode {
    init_tracing(cli.verbose);
    let format = cli.format;

    let Some(command) = cli.command else {
        println!("tasklog {}", env!("CARGO_PKG_VERSION"));
        println!("Use --help for usage information.");
        return ExitCode::Success;
    };
    if matches!(command, Commands::Version) {
        output_version(format);
        return ExitCode::Success;
    }

    let workspace = match Workspace::open(WorkspaceConfig::resolve(cli.root)) {
        Ok(ws) => ws,
        Err(e) => return output_error(&e, format),
    };

    let result = match command {
        Commands::Version => Ok(ExitCode::Success),
        Commands::Init(args) => handle_init(&workspace, &args, format),
        Commands::Run(args) => handle_run(&workspace, args, format),
        Commands::Submit(args) => handle_submit(&workspace, &args, format),
        Commands::Process(args) => workspace.process(args.dry_run).map(|report| {
            print_structured(&report, format, "process report");
            exit_for(report.halted.unwrap_or(VerifyStatus::Ok))
        }),
        Commands::Project => workspace.project().map(|report| {
            print_structured(&report, format, "projection");
            ExitCode::Success
        }),
        Commands::Verify => workspace.verify().map(|report| {
            print_verify(&report, format);
            exit_for(report.verify_status)
        }),
        Commands::Replay(args) => handle_replay(&workspace, &args, format),
        Commands::Status => workspace.status().map(|report| {
            if format == OutputFormat::Table {
                println!("{}", render_status(&report));
            } else {
                print_structured(&report, format, "status");
            }
            ExitCode::Success
        }),
        Commands::Task(TaskCommands::Add(args)) => handle_task_add(&workspace, args, format),
        Commands::Issue(IssueCommands::Resolve(args)) => {
            let resolution = args.note.map(|note| serde_json::json!({ "note": note }));
            workspace
                .resolve_issue(&args.issue_id, resolution)
                .map(|summary| {
                    print_structured(&summary, format, "issue resolution");
                    exit_for(summary.verify_status)
                })
        }
    };

    result.unwrap_or_else(|e| output_error(&e, format))
}

/// Failed verification maps to its own exit code.
const fn exit_for(status: VerifyStatus) -> ExitCode {
    match status {
        VerifyStatus::Mismatch | VerifyStatus::Corrupted => ExitCode::VerifyFailed,
        VerifyStatus::Ok | VerifyStatus::Unknown => ExitCode::Success,
    }
}

fn print_verify(report: &VerifyReport, format: OutputFormat) {
    if format != OutputFormat::Table {
        print_structured(report, format, "verify report");
        return;
    }
    println!("verify: {}", report.verify_status);
    println!(
        "last_event_seq: {}",
        report.last_event_seq.map_or_else(|| "-".to_string(), |seq| seq.to_string())
    );
    println!(
        "projection_hash_sha256: {}",
        report.projection_hash_sha256.as_deref().unwrap_or("-")
    );
    if let Some(reason) = &report.reason {
        println!("reason: {reason}");
    }
    if let Some(code) = &report.error_code {
        println!("error_code: {code}");
    }
}

fn handle_init(
    workspace: &Workspace,
    args: &InitArgs,
    format: OutputFormat,
) -> Result<ExitCode, TasklogError> {
    let report = workspace.init(&InitOptions {
        run_id: args.run_id.clone(),
        master_correlation_id: args.master_correlation_id.clone(),
        force: args.force,
    })?;
    print_structured(&report, format, "init report");
    Ok(exit_for(report.summary.verify_status))
}

fn handle_run(
    workspace: &Workspace,
    args: RunArgs,
    format: OutputFormat,
) -> Result<ExitCode, TasklogError> {
    let mut producer: Box<dyn Producer> = match args.producer_cmd.split_first() {
        None => Box::new(MockProducer::default()),
        Some((program, rest)) => {
            let root = &workspace.config().root;
            let mut config = CommandConfig::new(args.producer_id, program)
                .with_args(rest.iter().cloned())
                .with_env(ROOT_ENV, root.display().to_string())
                .with_working_dir(root);
            if let Some(secs) = args.producer_timeout {
                config = config.with_timeout(Duration::from_secs(secs));
            }
            Box::new(CommandProducer::new(config))
        }
    };
    let report = workspace.run(producer.as_mut(), args.steps, args.dry_run)?;
    print_structured(&report, format, "run report");
    Ok(exit_for(report.summary.verify_status))
}

fn handle_submit(
    workspace: &Workspace,
    args: &SubmitArgs,
    format: OutputFormat,
) -> Result<ExitCode, TasklogError> {
    let raw = if args.file == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).map_err(|e| {
            TasklogError::system("io_error", format!("stdin: {e}"), "cli:submit")
        })?;
        buf
    } else {
        std::fs::read_to_string(&args.file).map_err(|e| {
            TasklogError::user(
                "envelope_not_found",
                format!("{}: {e}", args.file),
                "cli:submit",
            )
        })?
    };
    let report = workspace.submit(&raw, &args.actor, args.dry_run)?;
    print_structured(&report, format, "submit report");
    Ok(exit_for(report.summary.verify_status))
}

fn handle_replay(
    workspace: &Workspace,
    args: &ReplayArgs,
    format: OutputFormat,
) -> Result<ExitCode, TasklogError> {
    let report = workspace.replay(args.until.as_deref(), !args.no_write)?;
    print_structured(&report, format, "replay report");
    Ok(ExitCode::Success)
}

fn handle_task_add(
    workspace: &Workspace,
    args: TaskAddArgs,
    format: OutputFormat,
) -> Result<ExitCode, TasklogError> {
    let mut spec = TaskSpec::new(args.id, TaskKind::from(args.kind), args.title)
        .depends_on(args.depends_on);
    for path in args.outputs {
        spec = spec.with_output(path);
    }
    if let Some(description) = args.description {
        spec = spec.with_description(description);
    }
    let summary = workspace.add_task(spec)?;
    print_structured(&summary, format, "task add");
    Ok(exit_for(summary.verify_status))
}
