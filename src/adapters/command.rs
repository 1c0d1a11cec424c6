//! Subprocess producer.
//!
//! Runs an external command per attempt. The dispatch context is written to
//! the child's stdin as one JSON document; the child answers with a producer
//! envelope on stdout. The child is killed when the attempt TTL (or the
//! configured cap, whichever is shorter) runs out.

use super::producer::{Producer, ProducerError};
use crate::core::scheduler::DispatchContext;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Configuration for a subprocess producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Actor id recorded on accepted events.
    pub id: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Upper bound on a single call, on top of the attempt TTL.
    pub timeout: Option<Duration>,
    pub working_dir: Option<PathBuf>,
}

impl CommandConfig {
    pub fn new(id: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            timeout: None,
            working_dir: None,
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct CommandProducer {
    config: CommandConfig,
}

impl CommandProducer {
    #[must_use]
    pub const fn new(config: CommandConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &CommandConfig {
        &self.config
    }

    fn limit(&self, ttl: Duration) -> Duration {
        self.config.timeout.map_or(ttl, |cap| cap.min(ttl))
    }
}

/// Collects a child stream on its own thread. Invalid UTF-8 is replaced
/// rather than dropped.
fn drain<R: Read + Send + 'static>(stream: R, name: &'static str) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut bytes = Vec::new();
        if let Err(e) = reader.read_to_end(&mut bytes) {
            warn!(stream = name, error = %e, "producer stream read failed");
        }
        String::from_utf8_lossy(&bytes).into_owned()
    })
}

impl Producer for CommandProducer {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn dispatch(&mut self, ctx: &DispatchContext, ttl: Duration) -> Result<String, ProducerError> {
        let input =
            serde_json::to_string(ctx).map_err(|e| ProducerError::Output(e.to_string()))?;
        let limit = self.limit(ttl);
        let start = Instant::now();

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(ProducerError::Spawn)?;
        debug!(
            program = %self.config.program.display(),
            task_id = %ctx.task.task_id,
            "producer spawned"
        );

        if let Some(mut stdin) = child.stdin.take() {
            // A child that exits without reading closes the pipe early.
            if let Err(e) = stdin.write_all(input.as_bytes()) {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ProducerError::Io(e));
                }
            }
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProducerError::Output("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProducerError::Output("stderr not captured".to_string()))?;
        let stdout_handle = drain(stdout, "stdout");
        let stderr_handle = drain(stderr, "stderr");

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if start.elapsed() > limit {
                warn!(task_id = %ctx.task.task_id, limit_secs = limit.as_secs(), "producer timed out");
                let _ = child.kill();
                let _ = child.wait();
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(ProducerError::Timeout(limit));
            }
            std::thread::sleep(Duration::from_millis(10));
        };

        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();

        match status.code() {
            Some(0) => Ok(stdout.trim().to_string()),
            code => Err(ProducerError::Exit {
                code: code.unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::contract::AgentContract;
    use crate::core::policy::RuntimePolicy;
    use crate::core::projection::project;
    use crate::core::projection::tests::LogBuilder;
    use crate::core::scheduler::Attempt;
    use chrono::Utc;

    fn ctx() -> DispatchContext {
        let views = project(&LogBuilder::new().create("T-1", "impl").build()).unwrap();
        let task = views.roadmap.task("T-1").unwrap();
        let policy = RuntimePolicy::default();
        let attempt = Attempt::start(task, policy.attempt_ttl(), Utc::now());
        DispatchContext::build(&views, task, &AgentContract::default(), &policy, &attempt)
    }

    fn sh(script: &str) -> CommandProducer {
        CommandProducer::new(
            CommandConfig::new("agent-sh", "/bin/sh")
                .with_args(["-c", script])
                .with_timeout(Duration::from_secs(5)),
        )
    }

    #[test]
    fn context_goes_in_and_reply_comes_out() {
        let mut producer = sh("cat");
        let reply = producer.dispatch(&ctx(), Duration::from_secs(5)).unwrap();
        let echoed: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(echoed["task"]["task_id"], "T-1");
        assert_eq!(producer.id(), "agent-sh");
    }

    #[test]
    fn reply_is_trimmed() {
        let mut producer = sh("echo '  {\"a\":1}  '");
        let reply = producer.dispatch(&ctx(), Duration::from_secs(5)).unwrap();
        assert_eq!(reply, "{\"a\":1}");
    }

    #[test]
    fn invalid_utf8_is_replaced_not_dropped() {
        let mut producer = sh("printf 'ok\\377'");
        let reply = producer.dispatch(&ctx(), Duration::from_secs(5)).unwrap();
        assert_eq!(reply, "ok\u{fffd}");
    }

    #[test]
    fn env_reaches_the_child() {
        let mut producer = CommandProducer::new(
            CommandConfig::new("agent-sh", "/bin/sh")
                .with_args(["-c", "printf %s \"$TASKLOG_ROOT\""])
                .with_env("TASKLOG_ROOT", "/tmp/ws"),
        );
        let reply = producer.dispatch(&ctx(), Duration::from_secs(5)).unwrap();
        assert_eq!(reply, "/tmp/ws");
    }

    #[test]
    fn nonzero_exit_carries_stderr() {
        let mut producer = sh("echo bad 1>&2; exit 7");
        let err = producer.dispatch(&ctx(), Duration::from_secs(5)).unwrap_err();
        match err {
            ProducerError::Exit { code, stderr } => {
                assert_eq!(code, 7);
                assert_eq!(stderr, "bad");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn ttl_kills_the_child() {
        let mut producer = sh("exec sleep 5");
        let err = producer
            .dispatch(&ctx(), Duration::from_millis(50))
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let mut producer =
            CommandProducer::new(CommandConfig::new("x", "/nonexistent/tasklog-producer"));
        let err = producer.dispatch(&ctx(), Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.code(), "spawn_failed");
    }
}
