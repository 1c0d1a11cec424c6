//! Producer interface.
//!
//! A producer is an untrusted collaborator: it receives the purified
//! dispatch context for one task and answers with the raw text of a
//! producer envelope. Whatever it returns goes through the validator before
//! anything is recorded; the producer never touches the event store.

use crate::core::scheduler::DispatchContext;
use std::time::Duration;

/// Failure to obtain any reply from a producer.
#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("failed to spawn producer: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("producer IO failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("producer exited with code {code}: {stderr}")]
    Exit { code: i32, stderr: String },
    #[error("producer did not answer within {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("producer returned unusable output: {0}")]
    Output(String),
}

impl ProducerError {
    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "spawn_failed",
            Self::Io(_) => "io_error",
            Self::Exit { .. } => "nonzero_exit",
            Self::Timeout(_) => "timeout",
            Self::Output(_) => "invalid_output",
        }
    }

    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Something that turns a dispatch context into a candidate envelope.
pub trait Producer {
    /// Identity recorded as the actor of accepted events.
    fn id(&self) -> &str;

    /// Produces a reply for one attempt. `ttl` is the time left before the
    /// attempt expires; implementations that can enforce it should.
    fn dispatch(&mut self, ctx: &DispatchContext, ttl: Duration) -> Result<String, ProducerError>;
}

impl<P: Producer + ?Sized> Producer for Box<P> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn dispatch(&mut self, ctx: &DispatchContext, ttl: Duration) -> Result<String, ProducerError> {
        (**self).dispatch(ctx, ttl)
    }
}
