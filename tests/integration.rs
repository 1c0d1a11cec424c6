//! Integration tests for Tasklog.

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use std::fs;
use std::path::Path;
use std::process::Command;
use tasklog::adapters::{MockProducer, Scripted, ScriptedProducer};
use tasklog::core::cycle::StopReason;
use tasklog::core::envelope::{ActivityEvent, ProducerOutput};
use tasklog::core::events::{ClaimPayload, Event, EventBody, TaskSpec, Verification, ORCHESTRATOR};
use tasklog::core::projection::project;
use tasklog::core::state::{Severity, TaskKind, TaskStatus, VerifyStatus};
use tasklog::core::validator::RejectReason;
use tasklog::core::workspace::{InitOptions, Workspace, WorkspaceConfig};
use tasklog::storage::event_store::{encode_lines, parse_log};

fn workspace(root: &Path) -> Workspace {
    Workspace::open(WorkspaceConfig::new(root)).expect("open workspace")
}

fn initialized() -> (tempfile::TempDir, Workspace) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let ws = workspace(tmp.path());
    ws.init(&InitOptions::default()).expect("init");
    (tmp, ws)
}

fn envelope(event: ActivityEvent) -> String {
    ProducerOutput::new(event).to_json().expect("encode envelope")
}

/// 25 tasks, each created and then claimed: 50 events.
fn fifty_events() -> Vec<Event> {
    let ts = Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap();
    let mut events = Vec::new();
    for i in 1..=25_u64 {
        let task_id = format!("T-{i:04}");
        let kind = if i % 2 == 0 { TaskKind::Impl } else { TaskKind::Spec };
        let spec = TaskSpec::new(&task_id, kind, format!("Task {i:02}"));
        let seq = events.len() as u64 + 1;
        events.push(Event::new(seq, ORCHESTRATOR, ts, EventBody::TaskCreate(spec)));
        events.push(Event::new(
            seq + 1,
            format!("agent-{}", i % 3),
            ts,
            EventBody::Claim(ClaimPayload {
                task_id,
                notes: None,
            }),
        ));
    }
    events
}

fn run_tasklog(root: &Path, args: &[&str]) -> (i32, String, String) {
    let output = Command::new(env!("CARGO_BIN_EXE_tasklog"))
        .arg("--root")
        .arg(root)
        .args(args)
        .env_remove("TASKLOG_ROOT")
        .env_remove("TASKLOG_LOG")
        .output()
        .expect("run tasklog");

    (
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
    )
}

#[test]
fn claim_assigns_the_task_to_the_producer() {
    let (_tmp, ws) = initialized();
    ws.add_task(TaskSpec::new("T-1", TaskKind::Impl, "Standalone"))
        .expect("add task");

    let report = ws
        .submit(&envelope(ActivityEvent::new("claim", "T-1")), "agent-x", false)
        .expect("submit");
    assert!(report.output.expect("output").accepted);

    let status = ws.status().expect("status");
    let task = status.tasks.iter().find(|t| t.task_id == "T-1").expect("T-1");
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.assigned_to.as_deref(), Some("agent-x"));
    assert!(ws.verify().expect("verify").is_ok());
}

#[test]
fn complete_without_checks_is_rejected_and_changes_nothing() {
    let (_tmp, ws) = initialized();
    ws.add_task(TaskSpec::new("T-1", TaskKind::Impl, "Standalone"))
        .expect("add task");
    ws.submit(&envelope(ActivityEvent::new("claim", "T-1")), "agent-x", false)
        .expect("claim");

    let complete = ActivityEvent {
        verification: Some(Verification { checks: Vec::new() }),
        ..ActivityEvent::new("complete", "T-1")
    };
    let report = ws
        .submit(&envelope(complete), "agent-x", false)
        .expect("submit");
    let output = report.output.expect("output");
    assert!(!output.accepted);
    assert_eq!(output.reason, Some(RejectReason::VerificationGateFailure));

    let status = ws.status().expect("status");
    let task = status.tasks.iter().find(|t| t.task_id == "T-1").expect("T-1");
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.attempts, 1);
}

#[test]
fn mock_run_finishes_the_seed_chain_and_done_is_immutable() {
    let (tmp, ws) = initialized();
    let report = ws
        .run(&mut MockProducer::default(), 50, false)
        .expect("run");
    assert_eq!(report.stop, StopReason::AllDone);
    assert_eq!(report.steps, 9);
    assert_eq!(report.files_written, 3);
    assert_eq!(report.summary.verify_status, VerifyStatus::Ok);
    assert!(tmp.path().join("docs/spec/T-1000.md").is_file());
    assert!(tmp.path().join("docs/qa/T-1020.md").is_file());

    let report = ws
        .submit(&envelope(ActivityEvent::new("claim", "T-1000")), "agent-x", false)
        .expect("submit");
    let output = report.output.expect("output");
    assert!(!output.accepted);
    assert_eq!(output.reason, Some(RejectReason::ImmutableDoneViolation));
    assert!(ws
        .status()
        .expect("status")
        .tasks
        .iter()
        .all(|t| t.status == TaskStatus::Done));
    assert!(ws.verify().expect("verify").is_ok());
}

#[test]
fn independent_replays_agree_and_a_flipped_byte_is_a_mismatch() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let ws = workspace(tmp.path());
    let events = fifty_events();
    assert_eq!(events.len(), 50);

    let first = project(&events).expect("first replay");
    let second = project(&events).expect("second replay");
    assert_eq!(first.projection_hash(), second.projection_hash());

    let log = encode_lines(&events).expect("encode");
    fs::create_dir_all(ws.config().roadmap_dir()).expect("mkdir");
    fs::write(ws.config().log_path(), &log).expect("write log");
    ws.project().expect("project");
    let stored = ws.verify().expect("verify");
    assert!(stored.is_ok());
    assert_eq!(stored.projection_hash_sha256.as_deref(), Some(first.projection_hash()));

    let tampered = log.replacen("\"Task 07\"", "\"Task 08\"", 1);
    assert_ne!(tampered, log);
    let reparsed = parse_log(&tampered).expect("still well-formed");
    assert_ne!(
        project(&reparsed).expect("replay").projection_hash(),
        first.projection_hash()
    );

    fs::write(ws.config().log_path(), &tampered).expect("write tampered log");
    let report = ws.verify().expect("verify");
    assert_eq!(report.verify_status, VerifyStatus::Mismatch);
}

#[test]
fn repeated_timeouts_escalate_and_resolution_unblocks() {
    let (_tmp, ws) = initialized();
    let mut producer = ScriptedProducer::new("agent-slow")
        .then(Scripted::Stall)
        .then(Scripted::Stall)
        .then(Scripted::Stall);

    let report = ws.run(&mut producer, 10, false).expect("run");
    assert_eq!(report.steps, 3);
    assert_eq!(report.stop, StopReason::Blocked);
    assert!(report
        .outputs
        .iter()
        .all(|o| o.reason == Some(RejectReason::AttemptTimeout)));
    assert_eq!(report.escalations.len(), 1);

    let status = ws.status().expect("status");
    let task = &status.tasks[0];
    assert_eq!(task.status, TaskStatus::Todo);
    assert_eq!(task.attempts, 3);
    assert_eq!(task.blocked_by.as_ref(), Some(&report.escalations[0]));
    assert_eq!(status.open_issues.len(), 1);
    assert_eq!(status.open_issues[0].severity, Severity::High);

    ws.resolve_issue(&report.escalations[0], None)
        .expect("resolve");
    let status = ws.status().expect("status");
    assert_eq!(status.tasks[0].blocked_by, None);
    assert_eq!(status.tasks[0].attempts, 0);
    assert!(status.open_issues.is_empty());

    let report = ws
        .run(&mut MockProducer::default(), 50, false)
        .expect("run after resolution");
    assert_eq!(report.stop, StopReason::AllDone);
}

#[test]
fn corrupted_store_halts_without_appending() {
    let (_tmp, ws) = initialized();
    let log_path = ws.config().log_path();
    let mut content = fs::read_to_string(&log_path).expect("read log");
    // Drop the final newline and duplicate the last record: non-monotonic.
    let last = content.trim_end().lines().last().expect("last line").to_string();
    content.push_str(&last);
    content.push('\n');
    fs::write(&log_path, &content).expect("write log");

    let report = ws
        .run(&mut MockProducer::default(), 5, false)
        .expect("run");
    assert_eq!(report.stop, StopReason::Corrupted);
    assert_eq!(report.steps, 0);
    assert_eq!(fs::read_to_string(&log_path).expect("read log"), content);
    assert!(report.summary.snapshot.is_some());

    let submitted = ws
        .submit(&envelope(ActivityEvent::new("claim", "T-1000")), "agent-x", false)
        .expect("submit");
    assert!(submitted.output.is_none());
    assert_eq!(submitted.summary.verify_status, VerifyStatus::Corrupted);
    assert_eq!(ws.verify().expect("verify").verify_status, VerifyStatus::Corrupted);
}

#[test]
fn blocked_output_path_rejects_without_logging_a_write() {
    let (tmp, ws) = initialized();
    let target = tmp.path().join("docs/spec/T-1000.md");
    fs::create_dir_all(&target).expect("mkdir");

    let report = ws
        .run(&mut MockProducer::default(), 2, false)
        .expect("run");
    assert_eq!(report.rejected, 1);
    assert_eq!(report.files_written, 0);
    assert_eq!(report.outputs[1].reason, Some(RejectReason::WriteFailed));
    assert_eq!(report.summary.verify_status, VerifyStatus::Ok);

    let log = fs::read_to_string(ws.config().log_path()).expect("read log");
    let events = parse_log(&log).expect("parse log");
    assert!(events
        .iter()
        .all(|e| e.action_name() != "orchestrator.file.write" && e.action_name() != "complete"));
    assert_eq!(events.last().map(Event::action_name), Some("verify.ok"));
    assert!(target.is_dir());
    assert!(!tmp.path().join("docs/spec/T-1000.md.tmp").exists());
    assert!(ws.verify().expect("verify").is_ok());
}

#[test]
fn producer_cannot_claim_orchestrator_actions() {
    let (_tmp, ws) = initialized();
    let before = ws.status().expect("status").last_event_seq;
    let report = ws
        .submit(&envelope(ActivityEvent::new("task.create", "T-9")), "agent-x", false)
        .expect("submit");
    let output = report.output.expect("output");
    assert!(!output.accepted);
    assert_eq!(output.reason, Some(RejectReason::BoundaryViolation));
    assert!(ws.status().expect("status").tasks.iter().all(|t| t.task_id != "T-9"));
    assert!(ws.status().expect("status").last_event_seq > before);
}

#[test]
fn cli_full_cycle_and_exit_codes() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();

    let (code, out, err) = run_tasklog(root, &["-f", "json", "init"]);
    assert_eq!(code, 0, "{err}");
    assert!(out.contains("\"success\": true"), "{out}");

    let (code, _, err) = run_tasklog(root, &["init"]);
    assert_eq!(code, 4, "{err}");

    let (code, out, err) = run_tasklog(root, &["-f", "json", "run", "--steps", "20"]);
    assert_eq!(code, 0, "{err}");
    assert!(out.contains("\"stop\": \"all_done\""), "{out}");

    let (code, out, err) = run_tasklog(root, &["verify"]);
    assert_eq!(code, 0, "{err}");
    assert!(out.contains("verify: ok"), "{out}");

    let (code, out, err) = run_tasklog(root, &["status"]);
    assert_eq!(code, 0, "{err}");
    assert!(out.contains("T-1020"), "{out}");

    let (code, _, err) = run_tasklog(root, &["replay", "--until", "EV-99999999", "--no-write"]);
    assert_eq!(code, 3, "{err}");

    let roadmap = root.join(".roadmap/roadmap.json");
    let stored = fs::read_to_string(&roadmap).expect("read roadmap");
    let mut value: serde_json::Value = serde_json::from_str(&stored).expect("parse roadmap");
    value["meta"]["run"]["projection_hash_sha256"] = serde_json::Value::from("0".repeat(64));
    fs::write(&roadmap, serde_json::to_string_pretty(&value).expect("render")).expect("write");

    let (code, out, _) = run_tasklog(root, &["-f", "json", "verify"]);
    assert_eq!(code, 2, "{out}");
    assert!(out.contains("mismatch"), "{out}");

    let (code, _, err) = run_tasklog(root, &["project"]);
    assert_eq!(code, 0, "{err}");
    let (code, _, err) = run_tasklog(root, &["verify"]);
    assert_eq!(code, 0, "{err}");
}

#[test]
fn cli_submit_reads_stdin_and_task_add_validates() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    let (code, _, err) = run_tasklog(root, &["init"]);
    assert_eq!(code, 0, "{err}");

    let (code, _, err) = run_tasklog(
        root,
        &["task", "add", "--id", "T-2000", "--kind", "qa", "--title", "x", "--depends-on", "T-404"],
    );
    assert_eq!(code, 3, "{err}");

    let mut child = Command::new(env!("CARGO_BIN_EXE_tasklog"))
        .arg("--root")
        .arg(root)
        .args(["-f", "json", "submit", "-", "--actor", "agent-cli"])
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .spawn()
        .expect("spawn tasklog");
    {
        use std::io::Write;
        let mut stdin = child.stdin.take().expect("stdin");
        stdin
            .write_all(envelope(ActivityEvent::new("claim", "T-1000")).as_bytes())
            .expect("write stdin");
    }
    let output = child.wait_with_output().expect("wait");
    let out = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(0), "{out}");
    assert!(out.contains("\"accepted\": true"), "{out}");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn replay_is_deterministic_for_any_prefix(len in 1_usize..=50) {
        let events = fifty_events();
        let prefix = &events[..len];
        let direct = project(prefix).unwrap();
        let reparsed = parse_log(&encode_lines(prefix).unwrap()).unwrap();
        let replayed = project(&reparsed).unwrap();
        prop_assert_eq!(direct.projection_hash(), replayed.projection_hash());
        prop_assert_eq!(direct.last_event_seq(), len as u64);
    }
}
