//! Workspace façade.
//!
//! A workspace is a directory with a `.roadmap/` folder holding the event
//! log, the materialized views, the contract and policy documents, forensic
//! snapshots and the submission inbox. Every CLI command maps to one method
//! here.
//!
//! Mutating operations go through an [`Orchestrator`] over the file-backed
//! stores, which holds the writer lock for the duration of the call. Dry
//! runs use an in-memory copy of the log and of the stored roadmap, so they
//! never touch the workspace.

use crate::adapters::producer::Producer;
use crate::core::clock::SystemClock;
use crate::core::contract::AgentContract;
use crate::core::cycle::{Orchestrator, RunReport, StopReason, SubmitReport, Summary};
use crate::core::envelope::agent_result_schema;
use crate::core::error::{Result, TasklogError};
use crate::core::events::{
    EventBody, IssueResolvePayload, PendingEvent, RunStartPayload, TaskSpec,
};
use crate::core::policy::{CorruptionRecovery, RuntimePolicy};
use crate::core::projection::{project, Views};
use crate::core::state::{IssueStatus, RunStatus, Severity, TaskKind, TaskStatus, VerifyStatus};
use crate::core::validator::RejectReason;
use crate::core::verify::{compare, report_store_error, verify_events, VerifyReport};
use crate::storage::event_store::{read_log, EventStore, FileEventStore, InMemoryEventStore};
use crate::storage::snapshot::SnapshotStore;
use crate::storage::views::{
    render_pretty, FileViewStore, InMemoryViewStore, ViewStore, ViewStoreError,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming the workspace root.
pub const ROOT_ENV: &str = "TASKLOG_ROOT";
pub const ROADMAP_DIR: &str = ".roadmap";
/// Actor for inbox files that do not name one.
pub const EXTERNAL_ACTOR: &str = "agent-external";
pub const DEFAULT_RUN_ID: &str = "RUN-0001";
pub const DEFAULT_MASTER_CORRELATION_ID: &str = "CID-TASKLOG-INIT";
const BASELINE_ID: &str = "B-000";
/// Directories `init` creates next to `.roadmap/`.
const WORK_DIRS: [&str; 4] = ["docs/spec", "docs/qa", "src", "tests"];

/// Locations of every workspace artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceConfig {
    pub root: PathBuf,
}

impl WorkspaceConfig {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root from the flag, else `TASKLOG_ROOT`, else the current directory.
    #[must_use]
    pub fn resolve(flag: Option<PathBuf>) -> Self {
        if let Some(root) = flag {
            return Self::new(root);
        }
        if let Some(root) = env::var_os(ROOT_ENV).filter(|v| !v.is_empty()) {
            return Self::new(root);
        }
        Self::new(env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    #[must_use]
    pub fn roadmap_dir(&self) -> PathBuf {
        self.root.join(ROADMAP_DIR)
    }

    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.roadmap_dir().join("activity.jsonl")
    }

    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.roadmap_dir().join("activity.lock")
    }

    #[must_use]
    pub fn roadmap_path(&self) -> PathBuf {
        self.roadmap_dir().join("roadmap.json")
    }

    #[must_use]
    pub fn contract_path(&self) -> PathBuf {
        self.roadmap_dir().join("contract.yaml")
    }

    #[must_use]
    pub fn policy_path(&self) -> PathBuf {
        self.roadmap_dir().join("policy.yaml")
    }

    #[must_use]
    pub fn schema_path(&self) -> PathBuf {
        self.roadmap_dir().join("agent_result.schema.json")
    }

    #[must_use]
    pub fn snapshots_dir(&self) -> PathBuf {
        self.roadmap_dir().join("snapshots")
    }

    #[must_use]
    pub fn inbox_dir(&self) -> PathBuf {
        self.roadmap_dir().join("inbox")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOptions {
    pub run_id: String,
    pub master_correlation_id: String,
    /// Discard an existing log.
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            run_id: DEFAULT_RUN_ID.to_string(),
            master_correlation_id: DEFAULT_MASTER_CORRELATION_ID.to_string(),
            force: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitReport {
    pub run_id: String,
    pub root: PathBuf,
    pub tasks: Vec<String>,
    #[serde(flatten)]
    pub summary: Summary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectReport {
    pub last_event_seq: u64,
    pub projection_hash_sha256: String,
    pub tasks: usize,
    pub issues: usize,
    pub lessons: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,
    pub events_replayed: usize,
    pub last_event_seq: u64,
    pub projection_hash_sha256: String,
    pub views_written: bool,
}

/// Outcome for one inbox file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboxResult {
    pub file: String,
    pub actor: String,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub processed: usize,
    pub accepted: usize,
    pub rejected: usize,
    /// Set when verification stopped the drain; remaining files stay put.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted: Option<VerifyStatus>,
    pub results: Vec<InboxResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRow {
    pub task_id: String,
    pub task_kind: TaskKind,
    pub status: TaskStatus,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssueRow {
    pub issue_id: String,
    pub severity: Severity,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub run_status: RunStatus,
    pub verify_status: VerifyStatus,
    pub last_event_seq: u64,
    pub projection_hash_sha256: String,
    pub tasks: Vec<TaskRow>,
    pub open_issues: Vec<IssueRow>,
}

type Session = Orchestrator<Box<dyn EventStore>, Box<dyn ViewStore>, SystemClock>;

/// Either a live session or the summary of a store that could not be
/// opened because its history is corrupted.
enum Opened {
    Live(Session),
    Corrupted(Summary),
}

/// The seed chain created by `init`: spec, then implementation, then QA.
fn seed_tasks() -> Vec<TaskSpec> {
    let seed = |id: &str, kind: TaskKind, title: &str, desc: &str, target: &str, out: &str| {
        TaskSpec {
            targets: vec![target.to_string()],
            ..TaskSpec::new(id, kind, title)
                .with_description(desc)
                .with_output(out)
        }
    };
    vec![
        seed(
            "T-1000",
            TaskKind::Spec,
            "Create initial spec document",
            "Produce the initial specification artifact for the baseline.",
            "spec-core",
            "docs/spec/T-1000.md",
        ),
        seed(
            "T-1010",
            TaskKind::Impl,
            "Create initial implementation artifact",
            "Produce the initial implementation artifact that follows the approved specification.",
            "impl-core",
            "src/T-1010.txt",
        )
        .depends_on(["T-1000"]),
        seed(
            "T-1020",
            TaskKind::Qa,
            "Create initial QA report",
            "Produce the initial QA evidence artifact validating the implementation baseline.",
            "qa-core",
            "docs/qa/T-1020.md",
        )
        .depends_on(["T-1010"]),
    ]
}

fn io_error(err: &std::io::Error, path: &Path, origin: &str) -> TasklogError {
    TasklogError::system("io_error", format!("{}: {err}", path.display()), origin)
}

fn corrupted_error(report: &VerifyReport, origin: &str) -> TasklogError {
    TasklogError::verification(
        report
            .error_code
            .clone()
            .unwrap_or_else(|| "store_corrupted".to_string()),
        report
            .reason
            .clone()
            .unwrap_or_else(|| "event store is corrupted".to_string()),
        origin,
    )
    .with_hint("Inspect .roadmap/snapshots/ and repair the log manually")
}

/// Splits an inbox file stem `{actor}__{task}` into its actor.
fn inbox_actor(stem: &str) -> &str {
    match stem.split_once("__") {
        Some((actor, _)) if !actor.is_empty() => actor,
        _ => EXTERNAL_ACTOR,
    }
}

/// One workspace with its loaded contract and policy.
#[derive(Debug, Clone)]
pub struct Workspace {
    config: WorkspaceConfig,
    contract: AgentContract,
    policy: RuntimePolicy,
}

impl Workspace {
    /// Loads the contract and policy; absent documents yield defaults.
    pub fn open(config: WorkspaceConfig) -> Result<Self> {
        let contract = AgentContract::load(&config.contract_path()).map_err(|e| {
            TasklogError::user("contract_invalid", e.to_string(), "workspace:open")
                .with_context("path", config.contract_path().display().to_string())
        })?;
        let policy = RuntimePolicy::load(&config.policy_path()).map_err(|e| {
            TasklogError::user("policy_invalid", e.to_string(), "workspace:open")
                .with_context("path", config.policy_path().display().to_string())
        })?;
        Ok(Self {
            config,
            contract,
            policy,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    #[must_use]
    pub const fn policy(&self) -> &RuntimePolicy {
        &self.policy
    }

    #[must_use]
    pub const fn contract(&self) -> &AgentContract {
        &self.contract
    }

    fn view_store(&self) -> FileViewStore {
        FileViewStore::new(&self.config.root, self.config.roadmap_dir())
    }

    fn snapshots(&self) -> SnapshotStore {
        SnapshotStore::new(
            self.config.snapshots_dir(),
            self.policy.recovery.max_snapshots,
        )
    }

    fn orchestrator<S: EventStore + 'static, V: ViewStore + 'static>(
        &self,
        store: S,
        views: V,
    ) -> Session {
        Orchestrator::new(
            Box::new(store) as Box<dyn EventStore>,
            Box::new(views) as Box<dyn ViewStore>,
            SystemClock,
            self.contract.clone(),
            self.policy,
        )
        .with_snapshots(self.snapshots())
    }

    /// Opens a session over the workspace, or over an in-memory copy of it.
    fn session(&self, dry_run: bool) -> Result<Opened> {
        if dry_run {
            let events = match read_log(&self.config.log_path()) {
                Ok(events) => events,
                Err(e) if e.is_corruption() => {
                    return Ok(Opened::Corrupted(Summary::corrupted(
                        report_store_error(&e),
                        0,
                        None,
                    )))
                }
                Err(e) => return Err(e.into()),
            };
            let stored = match self.view_store().load_roadmap() {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(error = %e, "stored roadmap unreadable; dry run starts without it");
                    None
                }
            };
            let store = InMemoryEventStore::from_events(events)?;
            let views = InMemoryViewStore::new().with_roadmap(stored);
            return Ok(Opened::Live(self.orchestrator(store, views)));
        }

        match FileEventStore::open(self.config.log_path(), &self.config.lock_path()) {
            Ok(store) => Ok(Opened::Live(self.orchestrator(store, self.view_store()))),
            Err(e) if e.is_corruption() => Ok(Opened::Corrupted(self.quarantine(&e))),
            Err(e) => Err(e.into()),
        }
    }

    /// Handles a log that cannot even be opened: snapshot it when the
    /// policy says so, append nothing.
    fn quarantine(&self, err: &crate::storage::event_store::EventStoreError) -> Summary {
        let report = report_store_error(err);
        tracing::error!(code = err.code(), error = %err, "event store corrupted; halting");
        let snapshot = if self.policy.recovery.on_corruption == CorruptionRecovery::HaltAndSnapshot
        {
            self.capture_snapshot()
        } else {
            None
        };
        Summary::corrupted(report, 0, snapshot)
    }

    fn capture_snapshot(&self) -> Option<PathBuf> {
        let log = match fs::read(self.config.log_path()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "cannot read log for snapshot");
                return None;
            }
        };
        let roadmap = fs::read(self.config.roadmap_path()).ok();
        match self.snapshots().capture(Utc::now(), &log, roadmap.as_deref()) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "snapshot failed");
                None
            }
        }
    }

    /// Opens a live session or fails on a corrupted store.
    fn live_session(&self, dry_run: bool, origin: &str) -> Result<Session> {
        match self.session(dry_run)? {
            Opened::Live(session) => Ok(session),
            Opened::Corrupted(summary) => {
                let report = summary
                    .verify
                    .unwrap_or_else(|| VerifyReport::corrupted("store_corrupted", "event store is corrupted"));
                Err(corrupted_error(&report, origin))
            }
        }
    }

    /// Replays the whole log without taking the writer lock.
    fn current_views(&self, origin: &str) -> Result<Views> {
        let events = match read_log(&self.config.log_path()) {
            Ok(events) => events,
            Err(e) if e.is_corruption() => return Err(corrupted_error(&report_store_error(&e), origin)),
            Err(e) => return Err(e.into()),
        };
        project(&events).map_err(|e| corrupted_error(&VerifyReport::corrupted(e.code(), e.to_string()), origin))
    }

    /// Creates the workspace layout and seeds the log.
    pub fn init(&self, options: &InitOptions) -> Result<InitReport> {
        let roadmap_dir = self.config.roadmap_dir();
        fs::create_dir_all(&roadmap_dir)
            .map_err(|e| io_error(&e, &roadmap_dir, "workspace:init"))?;

        let mut store = FileEventStore::open(self.config.log_path(), &self.config.lock_path())?;
        if store.last_seq() > 0 {
            if !options.force {
                return Err(TasklogError::user(
                    "init_blocked",
                    "event store already contains events",
                    "workspace:init",
                )
                .with_hint("Use --force to discard the existing log and reinitialize"));
            }
            warn!(events = store.last_seq(), "discarding existing log");
            store.truncate()?;
        }

        for dir in WORK_DIRS {
            let path = self.config.root.join(dir);
            fs::create_dir_all(&path).map_err(|e| io_error(&e, &path, "workspace:init"))?;
        }
        self.write_defaults()?;

        let tasks = seed_tasks();
        let task_ids: Vec<String> = tasks.iter().map(|t| t.task_id.clone()).collect();
        let mut pending = vec![PendingEvent::orchestrator(EventBody::RunStart(
            RunStartPayload {
                run_id: Some(options.run_id.clone()),
                status: RunStatus::Initialized,
                master_correlation_id: Some(options.master_correlation_id.clone()),
                baseline_id: Some(BASELINE_ID.to_string()),
            },
        ))];
        pending.extend(
            tasks
                .into_iter()
                .map(|spec| PendingEvent::orchestrator(EventBody::TaskCreate(spec))),
        );

        let summary = self.orchestrator(store, self.view_store()).record(pending)?;
        info!(
            run_id = %options.run_id,
            last_event_seq = summary.last_event_seq,
            "workspace initialized"
        );
        Ok(InitReport {
            run_id: options.run_id.clone(),
            root: self.config.root.clone(),
            tasks: task_ids,
            summary,
        })
    }

    /// Writes the contract and policy documents unless they exist, and the
    /// output schema always.
    fn write_defaults(&self) -> Result<()> {
        let contract_path = self.config.contract_path();
        if !contract_path.exists() {
            let yaml = self.contract.to_yaml().map_err(|e| {
                TasklogError::system("serialization_error", e.to_string(), "workspace:init")
            })?;
            fs::write(&contract_path, yaml)
                .map_err(|e| io_error(&e, &contract_path, "workspace:init"))?;
        }
        let policy_path = self.config.policy_path();
        if !policy_path.exists() {
            let yaml = self.policy.to_yaml().map_err(|e| {
                TasklogError::system("serialization_error", e.to_string(), "workspace:init")
            })?;
            fs::write(&policy_path, yaml)
                .map_err(|e| io_error(&e, &policy_path, "workspace:init"))?;
        }
        let schema_path = self.config.schema_path();
        let schema = agent_result_schema()
            .and_then(|schema| render_pretty(&schema))
            .map_err(|e| {
                TasklogError::system("serialization_error", e.to_string(), "workspace:init")
            })?;
        fs::write(&schema_path, schema).map_err(|e| io_error(&e, &schema_path, "workspace:init"))
    }

    /// Rebuilds and saves the views from the full log.
    pub fn project(&self) -> Result<ProjectReport> {
        let store = FileEventStore::open(self.config.log_path(), &self.config.lock_path())?;
        let events = store.read_all()?;
        let views = project(&events)?;
        self.view_store().save(&views)?;
        drop(store);
        Ok(ProjectReport {
            last_event_seq: views.last_event_seq(),
            projection_hash_sha256: views.projection_hash().to_string(),
            tasks: views.roadmap.tasks.len(),
            issues: views.issues.issues.len(),
            lessons: views.lessons.lessons.len(),
        })
    }

    /// Read-only check of the stored roadmap against a fresh replay.
    pub fn verify(&self) -> Result<VerifyReport> {
        let events = match read_log(&self.config.log_path()) {
            Ok(events) => events,
            Err(e) if e.is_corruption() => return Ok(report_store_error(&e)),
            Err(e) => return Err(e.into()),
        };
        let report = match self.view_store().load_roadmap() {
            Ok(stored) => verify_events(&events, stored.as_ref()),
            Err(e @ ViewStoreError::Json { .. }) => {
                warn!(error = %e, "stored roadmap unreadable");
                let mut report = verify_events(&events, None);
                if report.verify_status == VerifyStatus::Mismatch {
                    report.reason = Some("roadmap_unreadable".to_string());
                }
                report
            }
            Err(e) => return Err(e.into()),
        };
        info!(status = %report.verify_status, "verify finished");
        Ok(report)
    }

    /// Projects a prefix of the log: up to an `event_seq` when `until` is
    /// numeric, else up to and including the event with that id.
    pub fn replay(&self, until: Option<&str>, write_views: bool) -> Result<ReplayReport> {
        let events = match read_log(&self.config.log_path()) {
            Ok(events) => events,
            Err(e) if e.is_corruption() => {
                return Err(corrupted_error(&report_store_error(&e), "workspace:replay"))
            }
            Err(e) => return Err(e.into()),
        };
        let selected = match until {
            None => &events[..],
            Some(limit) if !limit.is_empty() && limit.bytes().all(|b| b.is_ascii_digit()) => {
                let seq: u64 = limit.parse().map_err(|_| {
                    TasklogError::user(
                        "invalid_argument",
                        format!("event_seq {limit} is out of range"),
                        "workspace:replay",
                    )
                })?;
                let end = events.partition_point(|e| e.event_seq <= seq);
                &events[..end]
            }
            Some(event_id) => {
                let Some(index) = events.iter().position(|e| e.event_id.as_str() == event_id)
                else {
                    return Err(TasklogError::user(
                        "event_not_found",
                        format!("no event with id {event_id}"),
                        "workspace:replay",
                    ));
                };
                &events[..=index]
            }
        };
        let views = project(selected)?;
        if write_views {
            let _writer = FileEventStore::open(self.config.log_path(), &self.config.lock_path())?;
            self.view_store().save(&views)?;
        }
        Ok(ReplayReport {
            until: until.map(str::to_string),
            events_replayed: selected.len(),
            last_event_seq: views.last_event_seq(),
            projection_hash_sha256: views.projection_hash().to_string(),
            views_written: write_views,
        })
    }

    /// Validates and applies one externally produced envelope.
    pub fn submit(&self, raw: &str, actor: &str, dry_run: bool) -> Result<SubmitReport> {
        match self.session(dry_run)? {
            Opened::Live(mut session) => session.submit(raw, actor),
            Opened::Corrupted(summary) => Ok(SubmitReport {
                output: None,
                summary,
            }),
        }
    }

    /// Drains `.roadmap/inbox/*.json` in file-name order.
    pub fn process(&self, dry_run: bool) -> Result<ProcessReport> {
        let mut report = ProcessReport {
            processed: 0,
            accepted: 0,
            rejected: 0,
            halted: None,
            results: Vec::new(),
        };
        let inbox = self.config.inbox_dir();
        if !inbox.is_dir() {
            return Ok(report);
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&inbox)
            .map_err(|e| io_error(&e, &inbox, "workspace:process"))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        if files.is_empty() {
            return Ok(report);
        }

        let mut session = match self.session(dry_run)? {
            Opened::Live(session) => session,
            Opened::Corrupted(_) => {
                report.halted = Some(VerifyStatus::Corrupted);
                return Ok(report);
            }
        };
        let done_dir = inbox.join("done");
        let rejected_dir = inbox.join("rejected");
        if !dry_run {
            for dir in [&done_dir, &rejected_dir] {
                fs::create_dir_all(dir).map_err(|e| io_error(&e, dir, "workspace:process"))?;
            }
        }

        for path in files {
            let file = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let stem = path
                .file_stem()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let actor = inbox_actor(&stem).to_string();
            let mut result = InboxResult {
                file: file.clone(),
                actor: actor.clone(),
                accepted: false,
                task_id: None,
                reason: None,
                error_code: None,
                message: None,
                last_event_seq: None,
            };

            let submitted = fs::read_to_string(&path)
                .map_err(|e| io_error(&e, &path, "workspace:process"))
                .and_then(|raw| session.submit(&raw, &actor));
            match submitted {
                Ok(SubmitReport {
                    output: Some(output),
                    summary,
                }) => {
                    result.accepted = output.accepted;
                    result.task_id = output.task_id;
                    result.reason = output.reason;
                    result.message = output.message;
                    result.last_event_seq = Some(summary.last_event_seq);
                    if summary.verify_status != VerifyStatus::Ok {
                        report.halted = Some(summary.verify_status);
                    }
                }
                Ok(SubmitReport {
                    output: None,
                    summary,
                }) => {
                    report.halted = Some(summary.verify_status);
                    warn!(file = %file, status = %summary.verify_status, "inbox drain halted");
                    break;
                }
                Err(e) => {
                    result.error_code = Some(e.code.clone());
                    result.message = Some(e.message.clone());
                }
            }

            report.processed += 1;
            let target = if result.accepted {
                report.accepted += 1;
                &done_dir
            } else {
                report.rejected += 1;
                &rejected_dir
            };
            if !dry_run {
                let dest = target.join(&file);
                fs::rename(&path, &dest).map_err(|e| io_error(&e, &dest, "workspace:process"))?;
            }
            report.results.push(result);
            if report.halted.is_some() {
                break;
            }
        }
        info!(
            processed = report.processed,
            accepted = report.accepted,
            rejected = report.rejected,
            "inbox processed"
        );
        Ok(report)
    }

    /// Runs the orchestration cycle for up to `steps` dispatches.
    pub fn run<P: Producer + ?Sized>(
        &self,
        producer: &mut P,
        steps: usize,
        dry_run: bool,
    ) -> Result<RunReport> {
        if steps == 0 {
            return Err(TasklogError::user(
                "invalid_argument",
                "steps must be >= 1",
                "workspace:run",
            ));
        }
        match self.session(dry_run)? {
            Opened::Live(mut session) => session.run(producer, steps),
            Opened::Corrupted(summary) => Ok(RunReport::stopped(StopReason::Corrupted, summary)),
        }
    }

    /// Closes an open issue (orchestrator only). Tasks it blocked become
    /// schedulable again with a fresh attempt budget.
    pub fn resolve_issue(&self, issue_id: &str, resolution: Option<Value>) -> Result<Summary> {
        let mut session = self.live_session(false, "workspace:issue_resolve")?;
        let views = session.views()?;
        let Some(issue) = views.issues.issue(issue_id) else {
            return Err(TasklogError::user(
                "issue_not_found",
                format!("unknown issue {issue_id}"),
                "workspace:issue_resolve",
            )
            .with_hint("Run `tasklog status` to list open issues"));
        };
        if issue.status == IssueStatus::Resolved {
            return Err(TasklogError::user(
                "issue_conflict",
                format!("issue {issue_id} is already resolved"),
                "workspace:issue_resolve",
            ));
        }
        session.record(vec![PendingEvent::orchestrator(EventBody::IssueResolve(
            IssueResolvePayload {
                issue_id: issue_id.to_string(),
                resolution,
            },
        ))])
    }

    /// Adds a task after checking its id and dependency graph.
    pub fn add_task(&self, spec: TaskSpec) -> Result<Summary> {
        let mut session = self.live_session(false, "workspace:task_add")?;
        let views = session.views()?;
        check_new_task(&views, &spec)?;
        session.record(vec![PendingEvent::orchestrator(EventBody::TaskCreate(spec))])
    }

    /// Current run, tasks and open issues, from a read-only replay.
    pub fn status(&self) -> Result<StatusReport> {
        let views = self.current_views("workspace:status")?;
        let run = &views.roadmap.meta.run;
        let tasks = views
            .roadmap
            .tasks
            .iter()
            .map(|t| TaskRow {
                task_id: t.task_id.clone(),
                task_kind: t.task_kind.clone(),
                status: t.status,
                title: t.title.clone(),
                assigned_to: t.assigned_to.clone(),
                attempts: t.attempts,
                blocked_by: t.blocked_by.clone(),
                depends_on: t.depends_on.clone(),
            })
            .collect();
        let open_issues = views
            .issues
            .issues
            .iter()
            .filter(|i| i.is_open())
            .map(|i| IssueRow {
                issue_id: i.issue_id.clone(),
                severity: i.severity,
                title: i.title.clone(),
                task_id: i.links.reported_by_task_id.clone(),
            })
            .collect();
        Ok(StatusReport {
            run_id: run.run_id.clone(),
            run_status: run.status,
            verify_status: run.verify_status,
            last_event_seq: run.last_event_seq,
            projection_hash_sha256: run.projection_hash_sha256.clone(),
            tasks,
            open_issues,
        })
    }

    /// Stored roadmap compared with a fresh replay, used by `status` callers
    /// that want to flag drift without failing.
    pub fn drift(&self) -> Result<Option<VerifyReport>> {
        let views = self.current_views("workspace:drift")?;
        let stored = self.view_store().load_roadmap().ok().flatten();
        let report = compare(&views, stored.as_ref());
        Ok((!report.is_ok()).then_some(report))
    }
}

/// Unique id, known dependencies, no self-dependency and no cycle through
/// the existing graph.
fn check_new_task(views: &Views, spec: &TaskSpec) -> Result<()> {
    let roadmap = &views.roadmap;
    if spec.task_id.trim().is_empty() || spec.title.trim().is_empty() {
        return Err(TasklogError::user(
            "invalid_argument",
            "task id and title must not be blank",
            "workspace:task_add",
        ));
    }
    if roadmap.task(&spec.task_id).is_some() {
        return Err(TasklogError::user(
            "task_conflict",
            format!("task {} already exists", spec.task_id),
            "workspace:task_add",
        ));
    }
    for dep in &spec.depends_on {
        if *dep == spec.task_id {
            return Err(TasklogError::user(
                "self_dependency",
                format!("task {} cannot depend on itself", spec.task_id),
                "workspace:task_add",
            ));
        }
        if roadmap.task(dep).is_none() {
            return Err(TasklogError::user(
                "dependency_not_found",
                format!("unknown dependency {dep}"),
                "workspace:task_add",
            )
            .with_context("task_id", spec.task_id.clone()));
        }
    }

    // Existing tasks may name the new id as a dependency before it exists.
    let mut seen = HashSet::new();
    let mut stack: Vec<&str> = spec.depends_on.iter().map(String::as_str).collect();
    while let Some(id) = stack.pop() {
        if id == spec.task_id {
            return Err(TasklogError::user(
                "dependency_cycle",
                format!("adding {} would create a dependency cycle", spec.task_id),
                "workspace:task_add",
            ));
        }
        if !seen.insert(id) {
            continue;
        }
        if let Some(task) = roadmap.task(id) {
            stack.extend(task.depends_on.iter().map(String::as_str));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::MockProducer;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(WorkspaceConfig::new(dir.path())).unwrap();
        (dir, ws)
    }

    fn initialized() -> (tempfile::TempDir, Workspace) {
        let (dir, ws) = workspace();
        ws.init(&InitOptions::default()).unwrap();
        (dir, ws)
    }

    #[test]
    fn config_paths_hang_off_the_root() {
        let config = WorkspaceConfig::resolve(Some(PathBuf::from("/w")));
        assert_eq!(config.log_path(), PathBuf::from("/w/.roadmap/activity.jsonl"));
        assert_eq!(config.inbox_dir(), PathBuf::from("/w/.roadmap/inbox"));
        assert_eq!(config.snapshots_dir(), PathBuf::from("/w/.roadmap/snapshots"));
    }

    #[test]
    fn init_seeds_the_chain_and_seals() {
        let (dir, ws) = workspace();
        let report = ws.init(&InitOptions::default()).unwrap();
        assert_eq!(report.tasks, vec!["T-1000", "T-1010", "T-1020"]);
        assert_eq!(report.summary.events_appended, 6);
        assert_eq!(report.summary.verify_status, VerifyStatus::Ok);
        assert!(dir.path().join("docs/spec").is_dir());
        assert!(ws.config().contract_path().exists());
        assert!(ws.config().policy_path().exists());
        assert!(ws.config().schema_path().exists());
        assert!(ws.verify().unwrap().is_ok());

        let status = ws.status().unwrap();
        assert_eq!(status.run_id.as_deref(), Some(DEFAULT_RUN_ID));
        assert_eq!(status.run_status, RunStatus::Initialized);
        assert_eq!(status.tasks[1].depends_on, vec!["T-1000"]);
    }

    #[test]
    fn init_refuses_a_non_empty_log_without_force() {
        let (_dir, ws) = initialized();
        let err = ws.init(&InitOptions::default()).unwrap_err();
        assert_eq!(err.code, "init_blocked");

        let forced = ws
            .init(&InitOptions {
                force: true,
                ..InitOptions::default()
            })
            .unwrap();
        assert_eq!(forced.summary.last_event_seq, 6);
    }

    #[test]
    fn verify_is_read_only_and_reports_drift() {
        let (_dir, ws) = initialized();
        let path = ws.config().roadmap_path();
        let mut roadmap: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        roadmap["meta"]["run"]["projection_hash_sha256"] = Value::from("f".repeat(64));
        fs::write(&path, render_pretty(&roadmap).unwrap()).unwrap();
        let before = fs::read(ws.config().log_path()).unwrap();

        let report = ws.verify().unwrap();
        assert_eq!(report.verify_status, VerifyStatus::Mismatch);
        assert_eq!(fs::read(ws.config().log_path()).unwrap(), before);
        assert!(ws.drift().unwrap().is_some());

        ws.project().unwrap();
        assert!(ws.verify().unwrap().is_ok());
    }

    #[test]
    fn replay_selects_by_seq_or_event_id() {
        let (_dir, ws) = initialized();
        let by_seq = ws.replay(Some("2"), false).unwrap();
        assert_eq!(by_seq.events_replayed, 2);
        assert_eq!(by_seq.last_event_seq, 2);

        let by_id = ws.replay(Some("EV-00000003"), false).unwrap();
        assert_eq!(by_id.events_replayed, 3);

        assert_eq!(
            ws.replay(Some("EV-99999999"), false).unwrap_err().code,
            "event_not_found"
        );
        assert_eq!(ws.replay(None, false).unwrap().events_replayed, 6);
    }

    #[test]
    fn dry_run_leaves_the_workspace_untouched() {
        let (dir, ws) = initialized();
        let before = fs::read(ws.config().log_path()).unwrap();
        let report = ws.run(&mut MockProducer::default(), 50, true).unwrap();
        assert_eq!(report.stop, StopReason::AllDone);
        assert_eq!(fs::read(ws.config().log_path()).unwrap(), before);
        assert!(!dir.path().join("docs/spec/T-1000.md").exists());
    }

    #[test]
    fn process_moves_files_by_outcome() {
        let (_dir, ws) = initialized();
        let inbox = ws.config().inbox_dir();
        fs::create_dir_all(&inbox).unwrap();
        fs::write(
            inbox.join("agent-spec__T-1000.json"),
            r#"{"activity_event":{"action":"claim","task_id":"T-1000"}}"#,
        )
        .unwrap();
        fs::write(inbox.join("T-1010.json"), "{not json").unwrap();
        fs::write(inbox.join("notes.txt"), "ignored").unwrap();

        let report = ws.process(false).unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.results[0].actor, "agent-spec");
        assert_eq!(report.results[1].actor, EXTERNAL_ACTOR);
        assert_eq!(report.results[1].reason, Some(RejectReason::ParseError));
        assert!(inbox.join("done/agent-spec__T-1000.json").exists());
        assert!(inbox.join("rejected/T-1010.json").exists());
        assert!(inbox.join("notes.txt").exists());

        let status = ws.status().unwrap();
        assert_eq!(status.tasks[0].assigned_to.as_deref(), Some("agent-spec"));
    }

    #[test]
    fn add_task_checks_ids_and_dependencies() {
        let (_dir, ws) = initialized();
        let dup = TaskSpec::new("T-1000", TaskKind::Spec, "again");
        assert_eq!(ws.add_task(dup).unwrap_err().code, "task_conflict");

        let missing = TaskSpec::new("T-2000", TaskKind::Qa, "QA").depends_on(["T-9"]);
        assert_eq!(ws.add_task(missing).unwrap_err().code, "dependency_not_found");

        let selfish = TaskSpec::new("T-2000", TaskKind::Qa, "QA").depends_on(["T-2000"]);
        assert_eq!(ws.add_task(selfish).unwrap_err().code, "self_dependency");

        let ok = TaskSpec::new("T-2000", TaskKind::Qa, "Extra QA").depends_on(["T-1020"]);
        let summary = ws.add_task(ok).unwrap();
        assert_eq!(summary.verify_status, VerifyStatus::Ok);
        assert_eq!(ws.status().unwrap().tasks.len(), 4);
    }

    #[test]
    fn cycle_through_a_forward_reference_is_refused() {
        let (_dir, ws) = initialized();
        let early = TaskSpec::new("T-3000", TaskKind::Impl, "Early").depends_on(["T-1000"]);
        ws.add_task(early).unwrap();
        // T-1000 does not name T-3001, so build the forward edge by hand.
        let mut views = ws.current_views("test").unwrap();
        views.roadmap.tasks[0].depends_on.push("T-3001".to_string());
        let late = TaskSpec::new("T-3001", TaskKind::Impl, "Late").depends_on(["T-3000"]);
        assert_eq!(check_new_task(&views, &late).unwrap_err().code, "dependency_cycle");
    }

    #[test]
    fn resolving_unknown_or_closed_issues_fails() {
        let (_dir, ws) = initialized();
        assert_eq!(
            ws.resolve_issue("ISS-404", None).unwrap_err().code,
            "issue_not_found"
        );
    }

    #[test]
    fn corrupted_log_is_snapshotted_on_run() {
        let (_dir, ws) = initialized();
        let mut content = fs::read_to_string(ws.config().log_path()).unwrap();
        content.push_str("{not json\n");
        fs::write(ws.config().log_path(), &content).unwrap();

        let report = ws.run(&mut MockProducer::default(), 5, false).unwrap();
        assert_eq!(report.stop, StopReason::Corrupted);
        assert_eq!(report.summary.verify_status, VerifyStatus::Corrupted);
        assert!(report.summary.snapshot.unwrap().join("activity.jsonl").exists());
        assert_eq!(fs::read_to_string(ws.config().log_path()).unwrap(), content);
        assert_eq!(ws.verify().unwrap().verify_status, VerifyStatus::Corrupted);
    }
}
