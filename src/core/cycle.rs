//! Orchestration cycle.
//!
//! The [`Orchestrator`] owns the only writable handle to the event store and
//! is therefore the only component that appends. One iteration:
//!
//! ```text
//! read log -> project -> schedule -> dispatch -> validate
//!     -> append (output.rejected | domain + effect events)
//!     -> persist views -> verify -> cooldown
//! ```
//!
//! Every batch is projected before it is appended, so a batch that would
//! not replay never reaches the log. Rejections are appended before any
//! retry or escalation decision is taken.

use crate::adapters::producer::Producer;
use crate::core::clock::Clock;
use crate::core::contract::AgentContract;
use crate::core::envelope::FileUpdate;
use crate::core::error::{Result, TasklogError};
use crate::core::events::{
    stamp_all, Escalation, Event, EventBody, IssueReportPayload, PendingEvent, RunEndPayload,
    RunStartPayload, VerifyFailPayload, VerifyOkPayload, VerifyStartPayload, ORCHESTRATOR,
};
use crate::core::policy::{CorruptionRecovery, EscalationAction, MismatchRecovery, RuntimePolicy};
use crate::core::projection::{project, ProjectionError, Views};
use crate::core::scheduler::{Attempt, DispatchContext, ScheduleResult, Scheduler};
use crate::core::state::{RunStatus, Severity, VerifyStatus};
use crate::core::validator::{RejectReason, Rejection, ValidationContext, Validator, Verdict};
use crate::core::verify::{compare, report_store_error, VerifyReport};
use crate::storage::event_store::EventStore;
use crate::storage::snapshot::SnapshotStore;
use crate::storage::views::{render_pretty, ViewStore, ViewStoreError};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// The log and its projection at one prefix.
#[derive(Debug, Clone)]
struct Ledger {
    events: Vec<Event>,
    views: Views,
}

impl Ledger {
    fn last_seq(&self) -> u64 {
        self.events.last().map_or(0, |e| e.event_seq)
    }
}

/// A candidate batch that replays cleanly on top of a ledger.
struct Staged {
    fresh: Vec<Event>,
    ledger: Ledger,
}

enum Loaded {
    Ready(Ledger),
    Corrupted(VerifyReport),
}

enum Health {
    Ok(Ledger),
    Mismatch(Ledger, VerifyReport),
    Corrupted(VerifyReport),
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    AllDone,
    /// Tasks remain but none is dispatchable.
    Blocked,
    NoTasks,
    StepLimit,
    /// An escalation with `halt_pipeline` was recorded.
    Escalated,
    Mismatch,
    Corrupted,
}

/// State of the log after a cycle operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub events_appended: u64,
    pub last_event_seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projection_hash_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_status: Option<RunStatus>,
    pub verify_status: VerifyStatus,
    /// Details of a failed verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify: Option<VerifyReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<PathBuf>,
}

impl Summary {
    fn of(ledger: &Ledger, start_seq: u64) -> Self {
        let run = &ledger.views.roadmap.meta.run;
        Self {
            events_appended: ledger.last_seq().saturating_sub(start_seq),
            last_event_seq: ledger.last_seq(),
            projection_hash_sha256: Some(run.projection_hash_sha256.clone()),
            run_status: Some(run.status),
            verify_status: run.verify_status,
            verify: None,
            snapshot: None,
        }
    }

    /// Outcome of finding the store corrupted. `last_event_seq` is the
    /// last sequence the store could still vouch for.
    #[must_use]
    pub fn corrupted(report: VerifyReport, last_event_seq: u64, snapshot: Option<PathBuf>) -> Self {
        Self {
            events_appended: 0,
            last_event_seq,
            projection_hash_sha256: None,
            run_status: None,
            verify_status: VerifyStatus::Corrupted,
            verify: Some(report),
            snapshot,
        }
    }
}

/// What happened to one candidate output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputOutcome {
    pub accepted: bool,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub files_written: usize,
    /// Issue opened because the task ran out of attempts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalated: Option<String>,
    /// Issue whose escalation halts the pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halt: Option<String>,
    /// Sequence numbers appended for this output.
    pub event_seqs: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub stop: StopReason,
    pub steps: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub files_written: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub escalations: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocked: Vec<String>,
    pub outputs: Vec<OutputOutcome>,
    #[serde(flatten)]
    pub summary: Summary,
}

impl RunReport {
    /// A run that stopped before dispatching anything.
    #[must_use]
    pub fn stopped(stop: StopReason, summary: Summary) -> Self {
        Tally::default().finish(stop, summary)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReport {
    /// `None` when the store was unreadable and nothing was validated.
    pub output: Option<OutputOutcome>,
    #[serde(flatten)]
    pub summary: Summary,
}

/// Counters accumulated while a run progresses.
#[derive(Debug, Default)]
struct Tally {
    steps: usize,
    accepted: usize,
    rejected: usize,
    files_written: usize,
    escalations: Vec<String>,
    blocked: Vec<String>,
    outputs: Vec<OutputOutcome>,
}

impl Tally {
    fn record(&mut self, outcome: &OutputOutcome) {
        if outcome.accepted {
            self.accepted += 1;
        } else {
            self.rejected += 1;
        }
        self.files_written += outcome.files_written;
        self.escalations.extend(outcome.escalated.iter().cloned());
        self.outputs.push(outcome.clone());
    }

    fn finish(self, stop: StopReason, summary: Summary) -> RunReport {
        RunReport {
            stop,
            steps: self.steps,
            accepted: self.accepted,
            rejected: self.rejected,
            files_written: self.files_written,
            escalations: self.escalations,
            blocked: self.blocked,
            outputs: self.outputs,
            summary,
        }
    }
}

fn orchestrator_event(body: EventBody) -> PendingEvent {
    PendingEvent::orchestrator(body)
}

/// Issue in `events` whose escalation halts the pipeline.
fn halting_issue(events: &[Event]) -> Option<String> {
    events.iter().find_map(|event| match &event.body {
        EventBody::IssueReport(report)
            if report
                .escalation
                .is_some_and(|e| e.action == EscalationAction::HaltPipeline) =>
        {
            Some(report.issue_id.clone())
        }
        _ => None,
    })
}

/// The single writer of one event store.
pub struct Orchestrator<S, V, C> {
    store: S,
    view_store: V,
    clock: C,
    validator: Validator,
    policy: RuntimePolicy,
    snapshots: Option<SnapshotStore>,
}

impl<S: EventStore, V: ViewStore, C: Clock> Orchestrator<S, V, C> {
    pub fn new(
        store: S,
        view_store: V,
        clock: C,
        contract: AgentContract,
        policy: RuntimePolicy,
    ) -> Self {
        Self {
            store,
            view_store,
            clock,
            validator: Validator::new(contract),
            policy,
            snapshots: None,
        }
    }

    /// Where to capture the store when it is found corrupted.
    #[must_use]
    pub fn with_snapshots(mut self, snapshots: SnapshotStore) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    pub const fn view_store(&self) -> &V {
        &self.view_store
    }

    pub const fn policy(&self) -> &RuntimePolicy {
        &self.policy
    }

    pub fn into_parts(self) -> (S, V) {
        (self.store, self.view_store)
    }

    // ---- reading and verification ------------------------------------

    fn load(&self) -> Result<Loaded> {
        let events = match self.store.read_all() {
            Ok(events) => events,
            Err(e) if e.is_corruption() => return Ok(Loaded::Corrupted(report_store_error(&e))),
            Err(e) => return Err(e.into()),
        };
        match project(&events) {
            Ok(views) => Ok(Loaded::Ready(Ledger { events, views })),
            Err(e) => {
                warn!(code = e.code(), error = %e, "log replay failed");
                Ok(Loaded::Corrupted(VerifyReport::corrupted(e.code(), e.to_string())))
            }
        }
    }

    fn compare_stored(&self, views: &Views) -> Result<VerifyReport> {
        match self.view_store.load_roadmap() {
            Ok(stored) => Ok(compare(views, stored.as_ref())),
            Err(e @ ViewStoreError::Json { .. }) => {
                warn!(error = %e, "stored roadmap unreadable");
                let mut report = compare(views, None);
                report.reason = Some("roadmap_unreadable".to_string());
                Ok(report)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Re-reads the log and compares its projection with the stored view,
    /// reprojecting once on mismatch when the policy allows it.
    fn check(&mut self) -> Result<Health> {
        let ledger = match self.load()? {
            Loaded::Ready(ledger) => ledger,
            Loaded::Corrupted(report) => return Ok(Health::Corrupted(report)),
        };
        let report = self.compare_stored(&ledger.views)?;
        if report.is_ok() {
            return Ok(Health::Ok(ledger));
        }
        if self.policy.recovery.on_mismatch == MismatchRecovery::ReprojectOrHalt {
            warn!(
                reason = report.reason.as_deref().unwrap_or("-"),
                last_event_seq = ledger.last_seq(),
                "views out of date; reprojecting"
            );
            self.view_store.save(&ledger.views)?;
            let again = self.compare_stored(&ledger.views)?;
            if again.is_ok() {
                return Ok(Health::Ok(ledger));
            }
            return Ok(Health::Mismatch(ledger, again));
        }
        Ok(Health::Mismatch(ledger, report))
    }

    fn persist(&mut self, ledger: &Ledger) -> Result<Health> {
        self.view_store.save(&ledger.views)?;
        self.check()
    }

    /// Records a persistent mismatch and halts the run.
    fn halt_on_mismatch(
        &mut self,
        ledger: &Ledger,
        report: VerifyReport,
        start_seq: u64,
    ) -> Result<Summary> {
        error!(
            computed = report.projection_hash_sha256.as_deref().unwrap_or("-"),
            stored = report.stored_projection_hash_sha256.as_deref().unwrap_or("-"),
            "projection mismatch persists; halting"
        );
        let mut pending = vec![orchestrator_event(EventBody::VerifyFail(VerifyFailPayload {
            verify_status: VerifyStatus::Mismatch,
            projection_hash_sha256: report.projection_hash_sha256.clone(),
            stored_projection_hash_sha256: report.stored_projection_hash_sha256.clone(),
            reason: report.reason.clone(),
        }))];
        if ledger.views.roadmap.meta.run.status == RunStatus::Running {
            pending.push(orchestrator_event(EventBody::RunEnd(RunEndPayload {
                status: RunStatus::Halted,
                reason: Some("verify_mismatch".to_string()),
            })));
        }
        let ledger = self.append(ledger, pending)?;
        if let Err(e) = self.view_store.save(&ledger.views) {
            warn!(error = %e, "failed to save views after mismatch");
        }
        let mut summary = Summary::of(&ledger, start_seq);
        summary.verify = Some(report);
        Ok(summary)
    }

    /// Halts on a corrupted store. Nothing is appended; the store is
    /// snapshotted when the policy asks for it.
    fn quarantine(&self, report: VerifyReport, start_seq: u64) -> Summary {
        error!(
            code = report.error_code.as_deref().unwrap_or("-"),
            reason = report.reason.as_deref().unwrap_or("-"),
            "event store corrupted; halting"
        );
        let snapshot = match (&self.snapshots, self.policy.recovery.on_corruption) {
            (Some(snapshots), CorruptionRecovery::HaltAndSnapshot) => self.capture(snapshots),
            _ => None,
        };
        let mut summary = Summary::corrupted(report, self.store.last_seq(), snapshot);
        summary.events_appended = summary.last_event_seq.saturating_sub(start_seq);
        summary
    }

    fn capture(&self, snapshots: &SnapshotStore) -> Option<PathBuf> {
        let log = match self.store.raw_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "cannot read log for snapshot");
                return None;
            }
        };
        let roadmap = self
            .view_store
            .load_roadmap()
            .ok()
            .flatten()
            .and_then(|value| render_pretty(&value).ok());
        match snapshots.capture(
            self.clock.now(),
            &log,
            roadmap.as_deref().map(str::as_bytes),
        ) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "snapshot failed");
                None
            }
        }
    }

    // ---- appending -----------------------------------------------------

    fn stage(
        &self,
        ledger: &Ledger,
        pending: Vec<PendingEvent>,
    ) -> std::result::Result<Staged, ProjectionError> {
        let fresh = stamp_all(pending, ledger.last_seq(), self.clock.now());
        let mut events = ledger.events.clone();
        events.extend(fresh.iter().cloned());
        let views = project(&events)?;
        Ok(Staged {
            fresh,
            ledger: Ledger { events, views },
        })
    }

    /// Writes every file update aside; nothing is visible until
    /// [`ViewStore::publish_staged`].
    fn stage_files(&mut self, files: &[FileUpdate]) -> crate::storage::views::Result<()> {
        for update in files {
            self.view_store.stage_file(&update.path, &update.content)?;
        }
        Ok(())
    }

    fn commit(&mut self, staged: Staged) -> Result<Ledger> {
        let last = self.store.append_batch(&staged.fresh)?;
        debug!(
            last_event_seq = last,
            count = staged.fresh.len(),
            "batch appended"
        );
        Ok(staged.ledger)
    }

    fn append(&mut self, ledger: &Ledger, pending: Vec<PendingEvent>) -> Result<Ledger> {
        let staged = self.stage(ledger, pending)?;
        self.commit(staged)
    }

    fn end_run(&mut self, ledger: &Ledger, status: RunStatus, reason: Option<String>) -> Result<Ledger> {
        info!(status = ?status, reason = reason.as_deref().unwrap_or("-"), "run ended");
        self.append(
            ledger,
            vec![orchestrator_event(EventBody::RunEnd(RunEndPayload {
                status,
                reason,
            }))],
        )
    }

    /// Closes an operation with `verify.start`, a full check and
    /// `verify.ok`.
    fn seal(&mut self, ledger: &Ledger, start_seq: u64) -> Result<Summary> {
        let ledger = self.append(
            ledger,
            vec![orchestrator_event(EventBody::VerifyStart(
                VerifyStartPayload { strict: true },
            ))],
        )?;
        match self.persist(&ledger)? {
            Health::Ok(checked) => {
                let hash = checked.views.projection_hash().to_string();
                let sealed = self.append(
                    &checked,
                    vec![orchestrator_event(EventBody::VerifyOk(VerifyOkPayload {
                        projection_hash_sha256: hash,
                    }))],
                )?;
                self.view_store.save(&sealed.views)?;
                Ok(Summary::of(&sealed, start_seq))
            }
            Health::Mismatch(checked, report) => self.halt_on_mismatch(&checked, report, start_seq),
            Health::Corrupted(report) => Ok(self.quarantine(report, start_seq)),
        }
    }

    // ---- producer output -----------------------------------------------

    /// Validates one candidate output and appends its consequences.
    fn apply(
        &mut self,
        ledger: Ledger,
        raw: &str,
        actor: &str,
        attempt: Option<&Attempt>,
    ) -> Result<(Ledger, OutputOutcome)> {
        let ctx = ValidationContext {
            views: &ledger.views,
            actor,
            dispatched_task: attempt.map(|a| a.task_id.as_str()),
        };
        let accepted = match self.validator.validate(raw, &ctx) {
            Verdict::Accept(accepted) => *accepted,
            Verdict::Reject(rejection) => return self.reject(ledger, rejection, actor, attempt),
        };

        let task_id = accepted.task_id.clone();
        let action = accepted.action;
        let files = accepted.file_updates.clone();
        let pending = accepted.into_pending(&ledger.views, &self.policy);
        let staged = match self.stage(&ledger, pending) {
            Ok(staged) => staged,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "accepted output does not replay");
                let rejection = Rejection::new(
                    RejectReason::InvalidTransition,
                    format!("candidate batch does not replay: {e}"),
                )
                .for_task(&task_id)
                .for_action(action.as_str());
                return self.reject(ledger, rejection, actor, attempt);
            }
        };
        let event_seqs: Vec<u64> = staged.fresh.iter().map(|e| e.event_seq).collect();
        let halt = halting_issue(&staged.fresh);
        if let Err(e) = self.stage_files(&files) {
            self.view_store.discard_staged();
            warn!(task_id = %task_id, error = %e, "file update cannot be written");
            let rejection = Rejection::new(
                RejectReason::WriteFailed,
                format!("file update cannot be written: {e}"),
            )
            .for_task(&task_id)
            .for_action(action.as_str());
            return self.reject(ledger, rejection, actor, attempt);
        }
        let ledger = match self.commit(staged) {
            Ok(ledger) => ledger,
            Err(e) => {
                self.view_store.discard_staged();
                return Err(e);
            }
        };
        self.view_store.publish_staged()?;
        info!(
            task_id = %task_id,
            action = action.as_str(),
            actor,
            files = files.len(),
            "output accepted"
        );

        let outcome = OutputOutcome {
            accepted: true,
            actor: actor.to_string(),
            task_id: Some(task_id),
            action: action.as_str().to_string(),
            reason: None,
            message: None,
            files_written: files.len(),
            escalated: None,
            halt,
            event_seqs,
        };
        Ok((ledger, outcome))
    }

    /// Records a rejection, then escalates if the task ran out of attempts.
    fn reject(
        &mut self,
        ledger: Ledger,
        rejection: Rejection,
        actor: &str,
        attempt: Option<&Attempt>,
    ) -> Result<(Ledger, OutputOutcome)> {
        let task = rejection
            .task_id
            .as_deref()
            .and_then(|id| ledger.views.roadmap.task(id));
        let number = attempt.map_or_else(|| task.map_or(0, |t| t.attempts + 1), |a| a.number);

        warn!(
            task_id = rejection.task_id.as_deref().unwrap_or("-"),
            reason = rejection.reason.code(),
            attempt = number,
            message = %rejection.message,
            "output rejected"
        );
        let mut outcome = OutputOutcome {
            accepted: false,
            actor: actor.to_string(),
            task_id: rejection.task_id.clone(),
            action: rejection.source_action.clone(),
            reason: Some(rejection.reason),
            message: Some(rejection.message.clone()),
            files_written: 0,
            escalated: None,
            halt: None,
            event_seqs: Vec::new(),
        };

        let reason = rejection.reason;
        let pending = vec![rejection.into_pending(number, attempt.map(|a| a.attempt_id))];
        let ledger = self.append(&ledger, pending)?;
        let rejected_seq = ledger.last_seq();
        outcome.event_seqs.push(rejected_seq);

        let Some(escalation) = self.exhaustion_report(&ledger, outcome.task_id.as_deref(), rejected_seq, reason)
        else {
            return Ok((ledger, outcome));
        };
        let issue_id = escalation.issue_id.clone();
        let halts = escalation
            .escalation
            .is_some_and(|e| e.action == EscalationAction::HaltPipeline);
        let ledger = self.append(
            &ledger,
            vec![orchestrator_event(EventBody::IssueReport(escalation))],
        )?;
        warn!(issue_id = %issue_id, task_id = outcome.task_id.as_deref().unwrap_or("-"), "attempts exhausted; escalated");
        outcome.event_seqs.push(ledger.last_seq());
        if halts {
            outcome.halt = Some(issue_id.clone());
        }
        outcome.escalated = Some(issue_id);
        Ok((ledger, outcome))
    }

    /// The automatic `issue.report` for a task that just used its last
    /// attempt, if it did.
    fn exhaustion_report(
        &self,
        ledger: &Ledger,
        task_id: Option<&str>,
        rejected_seq: u64,
        reason: RejectReason,
    ) -> Option<IssueReportPayload> {
        let task = task_id.and_then(|id| ledger.views.roadmap.task(id))?;
        let exhausted = !task.is_done()
            && task.blocked_by.is_none()
            && task.attempts >= self.policy.max_attempts;
        if !exhausted {
            return None;
        }
        let severity = Severity::High;
        Some(IssueReportPayload {
            issue_id: format!("ESC-{}-{rejected_seq}", task.task_id),
            task_id: Some(task.task_id.clone()),
            severity,
            title: Some(format!(
                "Task {} exhausted {} attempts",
                task.task_id, task.attempts
            )),
            affected: json!({ "task_id": task.task_id }),
            evidence: json!({
                "last_reason": reason.code(),
                "attempts": task.attempts,
                "rejected_event_seq": rejected_seq,
            }),
            fixes: None,
            scope_patch: None,
            required_verification: None,
            category: None,
            subtype: None,
            lesson: None,
            escalation: Some(Escalation {
                action: self.policy.escalation_for(severity),
                attempts: task.attempts,
            }),
        })
    }

    // ---- public operations ---------------------------------------------

    /// Runs up to `max_steps` dispatch iterations against `producer`.
    pub fn run<P: Producer + ?Sized>(
        &mut self,
        producer: &mut P,
        max_steps: usize,
    ) -> Result<RunReport> {
        let start_seq = self.store.last_seq();
        let mut tally = Tally::default();

        let mut ledger = match self.check()? {
            Health::Ok(ledger) => ledger,
            Health::Mismatch(ledger, report) => {
                let summary = self.halt_on_mismatch(&ledger, report, start_seq)?;
                return Ok(tally.finish(StopReason::Mismatch, summary));
            }
            Health::Corrupted(report) => {
                let summary = self.quarantine(report, start_seq);
                return Ok(tally.finish(StopReason::Corrupted, summary));
            }
        };

        let roadmap = &ledger.views.roadmap;
        if roadmap.tasks.is_empty() {
            info!("no tasks; nothing to run");
            return Ok(tally.finish(StopReason::NoTasks, Summary::of(&ledger, start_seq)));
        }
        if roadmap.all_done() && roadmap.meta.run.status == RunStatus::Success {
            info!("every task already done");
            return Ok(tally.finish(StopReason::AllDone, Summary::of(&ledger, start_seq)));
        }
        if roadmap.meta.run.status != RunStatus::Running {
            let start = RunStartPayload {
                run_id: roadmap.meta.run.run_id.clone(),
                status: RunStatus::Running,
                master_correlation_id: roadmap.meta.master_correlation_id.clone(),
                baseline_id: None,
            };
            ledger = self.append(&ledger, vec![orchestrator_event(EventBody::RunStart(start))])?;
        }

        let stop = loop {
            if tally.steps >= max_steps {
                break StopReason::StepLimit;
            }
            let scheduler = Scheduler::new(&ledger.views.roadmap, &self.policy);
            let (task, attempt) = match scheduler.schedule() {
                ScheduleResult::Ready(task) => (
                    task.clone(),
                    Attempt::start(task, self.policy.attempt_ttl(), self.clock.now()),
                ),
                ScheduleResult::Complete => {
                    ledger = self.end_run(&ledger, RunStatus::Success, None)?;
                    break StopReason::AllDone;
                }
                ScheduleResult::Blocked(remaining) => {
                    let reason = format!("no actionable task among {}", remaining.join(", "));
                    tally.blocked = remaining;
                    ledger = self.end_run(&ledger, RunStatus::Failed, Some(reason))?;
                    break StopReason::Blocked;
                }
                ScheduleResult::Empty => break StopReason::NoTasks,
            };

            let ctx = DispatchContext::build(
                &ledger.views,
                &task,
                self.validator.contract(),
                &self.policy,
                &attempt,
            );
            info!(
                task_id = %task.task_id,
                status = %task.status,
                attempt = attempt.number,
                producer = producer.id(),
                "dispatching"
            );
            let reply = producer.dispatch(&ctx, self.policy.attempt_ttl());
            tally.steps += 1;

            let actor = producer.id().to_string();
            let (next, outcome) = match reply {
                Ok(_) if attempt.is_expired(self.clock.now()) => self.reject(
                    ledger,
                    Rejection::timeout(&task.task_id, "reply arrived after the attempt deadline"),
                    &actor,
                    Some(&attempt),
                )?,
                Ok(raw) => self.apply(ledger, &raw, &actor, Some(&attempt))?,
                Err(e) if e.is_timeout() => self.reject(
                    ledger,
                    Rejection::timeout(&task.task_id, e.to_string()),
                    &actor,
                    Some(&attempt),
                )?,
                Err(e) => self.reject(
                    ledger,
                    Rejection::producer_failure(&task.task_id, format!("{}: {e}", e.code())),
                    &actor,
                    Some(&attempt),
                )?,
            };
            ledger = next;
            tally.record(&outcome);

            if let Some(issue_id) = outcome.halt {
                ledger = self.end_run(
                    &ledger,
                    RunStatus::Failed,
                    Some(format!("halt_pipeline escalation {issue_id}")),
                )?;
                break StopReason::Escalated;
            }

            match self.persist(&ledger)? {
                Health::Ok(checked) => ledger = checked,
                Health::Mismatch(checked, report) => {
                    let summary = self.halt_on_mismatch(&checked, report, start_seq)?;
                    return Ok(tally.finish(StopReason::Mismatch, summary));
                }
                Health::Corrupted(report) => {
                    let summary = self.quarantine(report, start_seq);
                    return Ok(tally.finish(StopReason::Corrupted, summary));
                }
            }

            let cooldown = self.policy.cooldown();
            if !cooldown.is_zero() {
                self.clock.sleep(cooldown);
            }
        };

        let summary = self.seal(&ledger, start_seq)?;
        let stop = match summary.verify_status {
            VerifyStatus::Mismatch => StopReason::Mismatch,
            VerifyStatus::Corrupted => StopReason::Corrupted,
            VerifyStatus::Ok | VerifyStatus::Unknown => stop,
        };
        info!(
            stop = ?stop,
            steps = tally.steps,
            accepted = tally.accepted,
            rejected = tally.rejected,
            last_event_seq = summary.last_event_seq,
            "run finished"
        );
        Ok(tally.finish(stop, summary))
    }

    /// Validates and applies one externally produced envelope.
    pub fn submit(&mut self, raw: &str, actor: &str) -> Result<SubmitReport> {
        if actor.trim().is_empty() || actor == ORCHESTRATOR {
            return Err(TasklogError::policy(
                "reserved_actor",
                format!("actor '{actor}' cannot submit producer output"),
                "cycle:submit",
            )
            .with_hint("Pass the producer's own identity with --actor"));
        }
        let start_seq = self.store.last_seq();
        let ledger = match self.check()? {
            Health::Ok(ledger) => ledger,
            Health::Mismatch(ledger, report) => {
                let summary = self.halt_on_mismatch(&ledger, report, start_seq)?;
                return Ok(SubmitReport {
                    output: None,
                    summary,
                });
            }
            Health::Corrupted(report) => {
                return Ok(SubmitReport {
                    output: None,
                    summary: self.quarantine(report, start_seq),
                });
            }
        };

        let (mut ledger, outcome) = self.apply(ledger, raw, actor, None)?;
        if let Some(issue_id) = &outcome.halt {
            ledger = self.end_run(
                &ledger,
                RunStatus::Failed,
                Some(format!("halt_pipeline escalation {issue_id}")),
            )?;
        } else {
            let roadmap = &ledger.views.roadmap;
            if roadmap.all_done() && roadmap.meta.run.status != RunStatus::Success {
                ledger = self.end_run(&ledger, RunStatus::Success, None)?;
            }
        }
        let summary = self.seal(&ledger, start_seq)?;
        Ok(SubmitReport {
            output: Some(outcome),
            summary,
        })
    }

    /// Appends orchestrator-authored events (task creation, issue
    /// resolution, run bookkeeping) and seals the result.
    pub fn record(&mut self, pending: Vec<PendingEvent>) -> Result<Summary> {
        let start_seq = self.store.last_seq();
        let ledger = match self.load()? {
            Loaded::Ready(ledger) => ledger,
            Loaded::Corrupted(report) => {
                let summary = self.quarantine(report, start_seq);
                let code = summary
                    .verify
                    .as_ref()
                    .and_then(|r| r.error_code.clone())
                    .unwrap_or_else(|| "store_corrupted".to_string());
                return Err(TasklogError::verification(
                    code,
                    "event store is corrupted; nothing was appended",
                    "cycle:record",
                )
                .with_hint("Inspect .roadmap/snapshots/ and repair the log manually"));
            }
        };
        if let Some(event) = pending.iter().find(|p| p.actor != ORCHESTRATOR) {
            return Err(TasklogError::policy(
                "orchestrator_only",
                format!("{} must be recorded by the orchestrator", event.body.action_name()),
                "cycle:record",
            ));
        }
        let staged = self.stage(&ledger, pending).map_err(|e| {
            TasklogError::user(e.code(), e.to_string(), "cycle:record")
        })?;
        let ledger = self.commit(staged)?;
        self.seal(&ledger, start_seq)
    }

    /// Current projection without appending anything.
    pub fn views(&self) -> Result<Views> {
        match self.load()? {
            Loaded::Ready(ledger) => Ok(ledger.views),
            Loaded::Corrupted(report) => Err(TasklogError::verification(
                report.error_code.unwrap_or_else(|| "store_corrupted".to_string()),
                report.reason.unwrap_or_default(),
                "cycle:views",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::{MockProducer, Scripted, ScriptedProducer};
    use crate::core::clock::ManualClock;
    use crate::core::envelope::{ActivityEvent, ProducerOutput};
    use crate::core::events::{Action, TaskSpec};
    use crate::core::projection::tests::LogBuilder;
    use crate::core::state::{TaskKind, TaskStatus};
    use crate::storage::event_store::{EventStoreError, InMemoryEventStore};
    use crate::storage::views::InMemoryViewStore;
    use chrono::{TimeZone, Utc};
    use serde_json::Value;
    use std::sync::Arc;

    type TestOrchestrator<V = InMemoryViewStore> =
        Orchestrator<InMemoryEventStore, V, Arc<ManualClock>>;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap(),
        ))
    }

    fn orchestrator(log: LogBuilder, clock: Arc<ManualClock>) -> TestOrchestrator {
        let store = InMemoryEventStore::from_events(log.build()).unwrap();
        Orchestrator::new(
            store,
            InMemoryViewStore::new(),
            clock,
            AgentContract::default(),
            RuntimePolicy::default(),
        )
    }

    fn chain() -> LogBuilder {
        LogBuilder::new()
            .push(
                "orchestrator",
                EventBody::TaskCreate(
                    TaskSpec::new("T-1000", TaskKind::Spec, "Spec").with_output("docs/spec/T-1000.md"),
                ),
            )
            .push(
                "orchestrator",
                EventBody::TaskCreate(
                    TaskSpec::new("T-1010", TaskKind::Impl, "Impl")
                        .depends_on(["T-1000"])
                        .with_output("src/T-1010.txt"),
                ),
            )
            .push(
                "orchestrator",
                EventBody::TaskCreate(
                    TaskSpec::new("T-1020", TaskKind::Qa, "QA")
                        .depends_on(["T-1010"])
                        .with_output("docs/qa/T-1020.md"),
                ),
            )
    }

    fn actions<S: EventStore>(store: &S) -> Vec<String> {
        store
            .read_all()
            .unwrap()
            .iter()
            .map(|e| e.action_name().to_string())
            .collect()
    }

    #[test]
    fn mock_run_drives_the_chain_to_done() {
        let mut orch = orchestrator(chain(), clock());
        let report = orch.run(&mut MockProducer::default(), 50).unwrap();

        assert_eq!(report.stop, StopReason::AllDone);
        assert_eq!(report.steps, 9);
        assert_eq!(report.rejected, 0);
        assert_eq!(report.files_written, 3);
        assert_eq!(report.summary.run_status, Some(RunStatus::Success));
        assert_eq!(report.summary.verify_status, VerifyStatus::Ok);

        let actions = actions(orch.store());
        assert_eq!(actions[3], "run.start");
        assert_eq!(
            &actions[actions.len() - 3..],
            ["run.end", "verify.start", "verify.ok"]
        );

        let (_, views) = orch.into_parts();
        assert!(views.files().contains_key("src/T-1010.txt"));
        let stored = views.load_roadmap().unwrap().unwrap();
        assert_eq!(stored["meta"]["run"]["status"], "success");
        assert_eq!(stored["indexes"]["by_status"]["done"], 3);
    }

    #[test]
    fn rejected_output_has_no_effects() {
        let raw = r#"{"activity_event":{"action":"claim","task_id":"T-1000","event_seq":99}}"#;
        let mut producer = ScriptedProducer::new("agent-x").then_reply(raw);
        let mut orch = orchestrator(chain(), clock());
        let report = orch.run(&mut producer, 1).unwrap();

        assert_eq!(report.stop, StopReason::StepLimit);
        assert_eq!(report.rejected, 1);
        assert_eq!(
            report.outputs[0].reason,
            Some(RejectReason::SchemaViolation)
        );
        let actions = actions(orch.store());
        assert!(actions.contains(&"output.rejected".to_string()));
        assert!(!actions.iter().any(|a| a.starts_with("orchestrator.")));
        assert_eq!(actions.last().map(String::as_str), Some("verify.ok"));
        assert!(orch.view_store().files().is_empty());
    }

    #[test]
    fn timeouts_return_the_task_and_escalate_when_exhausted() {
        let clock = clock();
        let log = LogBuilder::new().create("T-1", "impl").claim("agent-s", "T-1");
        let mut orch = orchestrator(log, Arc::clone(&clock));
        let mut producer = ScriptedProducer::new("agent-s")
            .with_clock(Arc::clone(&clock))
            .then(Scripted::Stall)
            .then(Scripted::Stall)
            .then(Scripted::Stall);

        let first = orch.run(&mut producer, 1).unwrap();
        assert_eq!(first.outputs[0].reason, Some(RejectReason::AttemptTimeout));
        let views = orch.views().unwrap();
        let task = views.roadmap.task("T-1").unwrap();
        assert_eq!(task.status, TaskStatus::Todo);
        assert_eq!(task.assigned_to, None);
        assert_eq!(task.attempts, 1);

        let rest = orch.run(&mut producer, 10).unwrap();
        assert_eq!(rest.steps, 2);
        assert_eq!(rest.stop, StopReason::Blocked);
        assert_eq!(rest.escalations.len(), 1);
        assert_eq!(rest.blocked, vec!["T-1".to_string()]);

        let views = orch.views().unwrap();
        let issue = views.issues.issue(&rest.escalations[0]).unwrap();
        assert_eq!(issue.severity, Severity::High);
        assert_eq!(
            views.roadmap.task("T-1").unwrap().blocked_by.as_deref(),
            Some(issue.issue_id.as_str())
        );
        assert_eq!(views.roadmap.meta.run.status, RunStatus::Failed);
    }

    #[test]
    fn late_reply_is_discarded() {
        let clock = clock();
        let claim = ProducerOutput::new(ActivityEvent::new("claim", "T-1"))
            .to_json()
            .unwrap();
        let mut producer = ScriptedProducer::new("agent-s")
            .with_clock(Arc::clone(&clock))
            .then(Scripted::Late(claim));
        let mut orch = orchestrator(LogBuilder::new().create("T-1", "impl"), clock);
        let report = orch.run(&mut producer, 1).unwrap();

        assert_eq!(report.outputs[0].reason, Some(RejectReason::AttemptTimeout));
        let views = orch.views().unwrap();
        assert_eq!(views.roadmap.task("T-1").unwrap().status, TaskStatus::Todo);
    }

    #[test]
    fn producer_failure_is_recorded() {
        let mut producer = ScriptedProducer::new("agent-s").then(Scripted::Fail(
            crate::adapters::ProducerError::Output("garbage".to_string()),
        ));
        let mut orch = orchestrator(LogBuilder::new().create("T-1", "spec"), clock());
        let report = orch.run(&mut producer, 1).unwrap();
        assert_eq!(report.outputs[0].reason, Some(RejectReason::ProducerFailure));
    }

    #[test]
    fn attempts_past_a_lowered_limit_still_escalate() {
        let log = LogBuilder::new()
            .create("T-1", "spec")
            .reject("T-1", RejectReason::ParseError)
            .reject("T-1", RejectReason::ParseError);
        let store = InMemoryEventStore::from_events(log.build()).unwrap();
        let mut orch: TestOrchestrator = Orchestrator::new(
            store,
            InMemoryViewStore::new(),
            clock(),
            AgentContract::default(),
            RuntimePolicy {
                max_attempts: 1,
                ..RuntimePolicy::default()
            },
        );
        let raw = r#"{"activity_event": {"action": "review", "task_id": "T-1", "decision": "approve"}}"#;
        let output = orch.submit(raw, "agent-x").unwrap().output.unwrap();

        assert_eq!(output.reason, Some(RejectReason::InvalidTransition));
        let issue_id = output.escalated.unwrap();
        let views = orch.views().unwrap();
        assert!(views.issues.issue(&issue_id).is_some());
        assert_eq!(
            views.roadmap.task("T-1").unwrap().blocked_by.as_deref(),
            Some(issue_id.as_str())
        );
    }

    #[test]
    fn critical_report_halts_the_pipeline() {
        let report = ProducerOutput::new(ActivityEvent {
            issue_id: Some("ISS-7".to_string()),
            severity: Some(Severity::Critical),
            ..ActivityEvent::new("issue.report", "T-1")
        })
        .to_json()
        .unwrap();
        let mut producer = ScriptedProducer::new("agent-s").then_reply(report);
        let mut orch = orchestrator(LogBuilder::new().create("T-1", "spec"), clock());
        let run = orch.run(&mut producer, 5).unwrap();

        assert_eq!(run.stop, StopReason::Escalated);
        assert_eq!(run.steps, 1);
        assert_eq!(run.summary.run_status, Some(RunStatus::Failed));
        let events = orch.store().read_all().unwrap();
        let escalation = events.iter().find_map(|e| match &e.body {
            EventBody::IssueReport(p) => p.escalation,
            _ => None,
        });
        assert_eq!(
            escalation.map(|e| e.action),
            Some(EscalationAction::HaltPipeline)
        );
    }

    /// View store whose stored roadmap never matches.
    #[derive(Default)]
    struct TamperedViews(InMemoryViewStore);

    impl ViewStore for TamperedViews {
        fn load_roadmap(&self) -> crate::storage::views::Result<Option<Value>> {
            Ok(self.0.load_roadmap()?.map(|mut roadmap| {
                roadmap["meta"]["run"]["projection_hash_sha256"] = Value::from("0".repeat(64));
                roadmap
            }))
        }

        fn save(&mut self, views: &Views) -> crate::storage::views::Result<()> {
            self.0.save(views)
        }

        fn stage_file(&mut self, path: &str, content: &str) -> crate::storage::views::Result<()> {
            self.0.stage_file(path, content)
        }

        fn publish_staged(&mut self) -> crate::storage::views::Result<usize> {
            self.0.publish_staged()
        }

        fn discard_staged(&mut self) {
            self.0.discard_staged();
        }
    }

    /// View store that refuses every file update.
    #[derive(Default)]
    struct ReadOnlyFiles(InMemoryViewStore);

    impl ViewStore for ReadOnlyFiles {
        fn load_roadmap(&self) -> crate::storage::views::Result<Option<Value>> {
            self.0.load_roadmap()
        }

        fn save(&mut self, views: &Views) -> crate::storage::views::Result<()> {
            self.0.save(views)
        }

        fn stage_file(&mut self, path: &str, _content: &str) -> crate::storage::views::Result<()> {
            Err(ViewStoreError::Io {
                path: PathBuf::from(path),
                source: std::io::Error::other("target is a directory"),
            })
        }

        fn publish_staged(&mut self) -> crate::storage::views::Result<usize> {
            self.0.publish_staged()
        }

        fn discard_staged(&mut self) {
            self.0.discard_staged();
        }
    }

    #[test]
    fn unwritable_file_update_is_rejected_before_append() {
        let store = InMemoryEventStore::from_events(chain().build()).unwrap();
        let mut orch: TestOrchestrator<ReadOnlyFiles> = Orchestrator::new(
            store,
            ReadOnlyFiles::default(),
            clock(),
            AgentContract::default(),
            RuntimePolicy::default(),
        );
        let report = orch.run(&mut MockProducer::default(), 2).unwrap();

        assert_eq!(report.stop, StopReason::StepLimit);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.files_written, 0);
        assert_eq!(report.outputs[1].reason, Some(RejectReason::WriteFailed));
        assert_eq!(report.summary.verify_status, VerifyStatus::Ok);

        let actions = actions(orch.store());
        assert!(!actions.iter().any(|a| a == "orchestrator.file.write"));
        assert!(!actions.iter().any(|a| a == "complete"));
        assert_eq!(actions.last().map(String::as_str), Some("verify.ok"));
        let views = orch.views().unwrap();
        let task = views.roadmap.task("T-1000").unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
    }

    #[test]
    fn persistent_mismatch_halts() {
        let store = InMemoryEventStore::from_events(chain().build()).unwrap();
        let mut orch: TestOrchestrator<TamperedViews> = Orchestrator::new(
            store,
            TamperedViews::default(),
            clock(),
            AgentContract::default(),
            RuntimePolicy::default(),
        );
        let report = orch.run(&mut MockProducer::default(), 5).unwrap();

        assert_eq!(report.stop, StopReason::Mismatch);
        assert_eq!(report.steps, 0);
        assert_eq!(report.summary.verify_status, VerifyStatus::Mismatch);
        let actions = actions(orch.store());
        assert_eq!(actions.last().map(String::as_str), Some("verify.fail"));
    }

    /// Store whose history cannot be read back.
    struct BrokenStore;

    impl EventStore for BrokenStore {
        fn read_all(&self) -> crate::storage::event_store::Result<Vec<Event>> {
            Err(EventStoreError::SequenceViolation {
                expected: 2,
                found: 4,
            })
        }

        fn last_seq(&self) -> u64 {
            4
        }

        fn append_batch(&mut self, _events: &[Event]) -> crate::storage::event_store::Result<u64> {
            panic!("corrupted store must not be appended to");
        }

        fn raw_bytes(&self) -> crate::storage::event_store::Result<Vec<u8>> {
            Ok(b"{\"event_seq\":1}\n{\"event_seq\":4}\n".to_vec())
        }
    }

    #[test]
    fn corrupted_store_is_snapshotted_and_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = Orchestrator::new(
            BrokenStore,
            InMemoryViewStore::new(),
            clock(),
            AgentContract::default(),
            RuntimePolicy::default(),
        )
        .with_snapshots(SnapshotStore::new(dir.path(), 5));

        let report = orch.run(&mut MockProducer::default(), 5).unwrap();
        assert_eq!(report.stop, StopReason::Corrupted);
        assert_eq!(report.summary.events_appended, 0);
        let verify = report.summary.verify.unwrap();
        assert_eq!(verify.error_code.as_deref(), Some("event_seq_non_monotonic"));
        let snapshot = report.summary.snapshot.unwrap();
        assert!(snapshot.join("activity.jsonl").exists());
    }

    #[test]
    fn submit_applies_and_seals() {
        let mut orch = orchestrator(LogBuilder::new().create("T-1", "impl"), clock());
        let raw = ProducerOutput::new(ActivityEvent::new("claim", "T-1"))
            .to_json()
            .unwrap();
        let report = orch.submit(&raw, "agent-x").unwrap();
        let output = report.output.unwrap();
        assert!(output.accepted);
        assert_eq!(output.event_seqs.len(), 2);

        let views = orch.views().unwrap();
        let task = views.roadmap.task("T-1").unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assigned_to.as_deref(), Some("agent-x"));
        assert_eq!(views.roadmap.meta.run.verify_status, VerifyStatus::Ok);

        assert_eq!(
            orch.submit(&raw, "orchestrator").unwrap_err().code,
            "reserved_actor"
        );
    }

    #[test]
    fn record_refuses_batches_that_do_not_replay() {
        let mut orch = orchestrator(LogBuilder::new().create("T-1", "impl"), clock());
        let duplicate = PendingEvent::orchestrator(EventBody::TaskCreate(TaskSpec::new(
            "T-1",
            TaskKind::Impl,
            "again",
        )));
        let err = orch.record(vec![duplicate]).unwrap_err();
        assert_eq!(err.code, "task_duplicate");
        assert_eq!(orch.store().last_seq(), 1);

        let summary = orch
            .record(vec![PendingEvent::orchestrator(EventBody::TaskCreate(
                TaskSpec::new("T-2", TaskKind::Qa, "QA"),
            ))])
            .unwrap();
        assert_eq!(summary.events_appended, 3);
        assert_eq!(summary.verify_status, VerifyStatus::Ok);
        let last = orch.store().read_all().unwrap();
        assert_eq!(last.last().and_then(|e| e.body.action()), Some(Action::VerifyOk));
    }
}
