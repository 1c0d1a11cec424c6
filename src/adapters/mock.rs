//! In-process producers.
//!
//! [`MockProducer`] walks every task through its lifecycle with fixed,
//! deterministic output. [`ScriptedProducer`] replays a queue of canned
//! replies, including failures and late answers, for driving the cycle in
//! tests.

use super::producer::{Producer, ProducerError};
use crate::core::clock::ManualClock;
use crate::core::envelope::{ActivityEvent, ProducerOutput};
use crate::core::events::{ReviewDecision, Verification};
use crate::core::scheduler::DispatchContext;
use crate::core::state::{Severity, Task, TaskKind, TaskStatus};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

pub const MOCK_PRODUCER_ID: &str = "agent-mock";

/// Deterministic producer: claim, complete with one output file, approve.
#[derive(Debug, Clone)]
pub struct MockProducer {
    id: String,
}

impl Default for MockProducer {
    fn default() -> Self {
        Self::new(MOCK_PRODUCER_ID)
    }
}

impl MockProducer {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// The envelope the mock answers with for a task in its current state.
    #[must_use]
    pub fn reply_for(task: &Task) -> ProducerOutput {
        let id = task.task_id.as_str();
        match task.status {
            TaskStatus::Todo => ProducerOutput::new(ActivityEvent {
                notes: Some("mock claim".to_string()),
                ..ActivityEvent::new("claim", id)
            }),
            TaskStatus::InProgress => {
                let mut checks = vec![format!("mock-check:{id}")];
                if task.is_hotfix {
                    checks.push(format!("mock-hotfix-check:{id}"));
                }
                let event = ActivityEvent {
                    notes: Some("mock complete".to_string()),
                    verification: Some(Verification { checks }),
                    issue_id: task.issue_id.clone().filter(|_| task.is_hotfix),
                    fixes: task.fixes.clone().filter(|_| task.is_hotfix),
                    ..ActivityEvent::new("complete", id)
                };
                ProducerOutput::new(event).with_file(output_path(task), fixture(task))
            }
            TaskStatus::Review => ProducerOutput::new(ActivityEvent {
                decision: Some(ReviewDecision::Approve),
                notes: Some("mock review approve".to_string()),
                ..ActivityEvent::new("review", id)
            }),
            TaskStatus::Done => ProducerOutput::new(ActivityEvent {
                issue_id: Some(format!("ISS-MOCK-{id}")),
                severity: Some(Severity::Low),
                title: Some("Task not actionable".to_string()),
                evidence: Some(json!({
                    "symptom": format!("task status is {}", task.status),
                    "repro_steps": [format!("load task {id}"), format!("check status {}", task.status)],
                })),
                ..ActivityEvent::new("issue.report", id)
            }),
        }
    }
}

/// First declared output, else a per-kind default location.
fn output_path(task: &Task) -> String {
    if let Some(first) = task.outputs.files.first() {
        return first.clone();
    }
    match task.task_kind {
        TaskKind::Spec => format!("docs/spec/{}.md", task.task_id),
        TaskKind::Impl => format!("src/{}.txt", task.task_id.to_lowercase()),
        TaskKind::Qa | TaskKind::Other(_) => format!("docs/qa/{}.md", task.task_id),
    }
}

fn fixture(task: &Task) -> String {
    format!(
        "# {}\n\n- kind: {}\n- generated_by: mock_adapter\n- note: deterministic fixture output\n",
        task.task_id, task.task_kind
    )
}

impl Producer for MockProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn dispatch(&mut self, ctx: &DispatchContext, _ttl: Duration) -> Result<String, ProducerError> {
        Self::reply_for(&ctx.task)
            .to_json()
            .map_err(|e| ProducerError::Output(e.to_string()))
    }
}

/// One canned answer.
#[derive(Debug)]
pub enum Scripted {
    /// Raw reply text, returned as is.
    Reply(String),
    /// Whatever the mock would have answered.
    Mock,
    Fail(ProducerError),
    /// No answer: the clock runs past the deadline and the call times out.
    Stall,
    /// The reply arrives, but only after the deadline.
    Late(String),
}

/// Replays a fixed script, one entry per dispatch.
#[derive(Debug)]
pub struct ScriptedProducer {
    id: String,
    script: VecDeque<Scripted>,
    clock: Option<Arc<ManualClock>>,
    dispatched: Vec<String>,
}

impl ScriptedProducer {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            script: VecDeque::new(),
            clock: None,
            dispatched: Vec::new(),
        }
    }

    /// Clock advanced by [`Scripted::Stall`] and [`Scripted::Late`].
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn then(mut self, step: Scripted) -> Self {
        self.script.push_back(step);
        self
    }

    #[must_use]
    pub fn then_reply(self, raw: impl Into<String>) -> Self {
        self.then(Scripted::Reply(raw.into()))
    }

    /// Task ids in dispatch order.
    #[must_use]
    pub fn dispatched(&self) -> &[String] {
        &self.dispatched
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.script.len()
    }

    fn overrun(&self, ttl: Duration) {
        if let Some(clock) = &self.clock {
            clock.advance(ttl + Duration::from_secs(1));
        }
    }
}

impl Producer for ScriptedProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn dispatch(&mut self, ctx: &DispatchContext, ttl: Duration) -> Result<String, ProducerError> {
        self.dispatched.push(ctx.task.task_id.clone());
        match self.script.pop_front() {
            Some(Scripted::Reply(raw)) => Ok(raw),
            Some(Scripted::Mock) => MockProducer::reply_for(&ctx.task)
                .to_json()
                .map_err(|e| ProducerError::Output(e.to_string())),
            Some(Scripted::Fail(err)) => Err(err),
            Some(Scripted::Stall) => {
                self.overrun(ttl);
                Err(ProducerError::Timeout(ttl))
            }
            Some(Scripted::Late(raw)) => {
                self.overrun(ttl);
                Ok(raw)
            }
            None => Err(ProducerError::Output("script exhausted".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::contract::AgentContract;
    use crate::core::events::{EventBody, TaskSpec};
    use crate::core::policy::RuntimePolicy;
    use crate::core::projection::project;
    use crate::core::projection::tests::LogBuilder;
    use crate::core::scheduler::Attempt;
    use crate::core::clock::Clock;
    use chrono::{TimeZone, Utc};
    use serde_json::Value;

    fn context(log: LogBuilder, task_id: &str) -> DispatchContext {
        let views = project(&log.build()).unwrap();
        let task = views.roadmap.task(task_id).unwrap();
        let policy = RuntimePolicy::default();
        let attempt = Attempt::start(task, policy.attempt_ttl(), Utc::now());
        DispatchContext::build(&views, task, &AgentContract::default(), &policy, &attempt)
    }

    fn reply(ctx: &DispatchContext) -> Value {
        let raw = MockProducer::default()
            .dispatch(ctx, Duration::from_secs(1))
            .unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn todo_task_is_claimed() {
        let ctx = context(LogBuilder::new().create("T-1000", "spec"), "T-1000");
        let out = reply(&ctx);
        assert_eq!(out["activity_event"]["action"], "claim");
        assert!(out.get("file_updates").is_none());
    }

    #[test]
    fn in_progress_impl_completes_with_default_output() {
        let log = LogBuilder::new()
            .create("T-1010", "impl")
            .claim("agent-mock", "T-1010");
        let out = reply(&context(log, "T-1010"));
        assert_eq!(out["activity_event"]["action"], "complete");
        assert_eq!(
            out["activity_event"]["verification"]["checks"],
            serde_json::json!(["mock-check:T-1010"])
        );
        assert_eq!(out["file_updates"][0]["path"], "src/t-1010.txt");
        let content = out["file_updates"][0]["content"].as_str().unwrap();
        assert!(content.starts_with("# T-1010\n\n- kind: impl\n"));
    }

    #[test]
    fn declared_output_wins_and_hotfix_links_are_echoed() {
        let mut spec = TaskSpec::new("HF-ISS-1", TaskKind::Impl, "Hotfix")
            .with_output("src/hotfix/HF-ISS-1.txt");
        spec.is_hotfix = true;
        spec.issue_id = Some("ISS-1".to_string());
        spec.fixes = Some("T-1".to_string());
        let log = LogBuilder::new()
            .push("orchestrator", EventBody::HotfixCreate(spec))
            .claim("agent-mock", "HF-ISS-1");
        let out = reply(&context(log, "HF-ISS-1"));
        let event = &out["activity_event"];
        assert_eq!(event["issue_id"], "ISS-1");
        assert_eq!(event["fixes"], "T-1");
        assert_eq!(event["verification"]["checks"].as_array().unwrap().len(), 2);
        assert_eq!(out["file_updates"][0]["path"], "src/hotfix/HF-ISS-1.txt");
    }

    #[test]
    fn review_is_approved() {
        let log = LogBuilder::new()
            .create("T-1", "spec")
            .claim("agent-mock", "T-1")
            .complete("agent-mock", "T-1", &[]);
        let out = reply(&context(log, "T-1"));
        assert_eq!(out["activity_event"]["decision"], "approve");
    }

    #[test]
    fn script_plays_in_order_and_overruns_the_clock() {
        let start = Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let ctx = context(LogBuilder::new().create("T-1", "spec"), "T-1");
        let mut producer = ScriptedProducer::new("agent-s")
            .with_clock(Arc::clone(&clock))
            .then_reply("{}")
            .then(Scripted::Stall)
            .then(Scripted::Mock);

        let ttl = Duration::from_secs(60);
        assert_eq!(producer.dispatch(&ctx, ttl).unwrap(), "{}");
        assert!(producer.dispatch(&ctx, ttl).unwrap_err().is_timeout());
        assert_eq!(clock.now(), start + chrono::Duration::seconds(61));
        assert!(producer.dispatch(&ctx, ttl).unwrap().contains("claim"));
        assert_eq!(producer.remaining(), 0);
        assert_eq!(producer.dispatch(&ctx, ttl).unwrap_err().code(), "invalid_output");
        assert_eq!(producer.dispatched().len(), 4);
    }
}
