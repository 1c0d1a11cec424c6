//! Producer adapters.
//!
//! Producers are the external collaborators that propose work. Each one
//! implements [`producer::Producer`]: it gets a purified dispatch context
//! and returns a candidate envelope as raw text.
//!
//! | Adapter | Use |
//! |---------|-----|
//! | [`mock::MockProducer`] | deterministic lifecycle walk, default for `run` |
//! | [`mock::ScriptedProducer`] | canned replies, failures and timeouts for tests |
//! | [`command::CommandProducer`] | any executable speaking JSON on stdin/stdout |

pub mod command;
pub mod mock;
pub mod producer;

pub use command::{CommandConfig, CommandProducer};
pub use mock::{MockProducer, Scripted, ScriptedProducer, MOCK_PRODUCER_ID};
pub use producer::{Producer, ProducerError};
