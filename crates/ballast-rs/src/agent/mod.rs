//! The streaming tool-calling orchestrator.
//!
//! - [`orchestrator`] — [`Orchestrator`], the bounded multi-turn loop.
//! - [`config`] — [`OrchestratorConfig`].
//! - [`events`] — [`StreamEvent`] and the bounded [`EventStream`] channel.
//! - [`recovery`] — tool calls written as `<tool_call>` text blocks.
//! - [`trace`] — [`TraceSink`] for raw request/response payloads.

pub mod config;
pub mod events;
pub(crate) mod execution;
pub mod orchestrator;
pub mod recovery;
pub mod trace;

pub use config::OrchestratorConfig;
pub use events::{EventSender, EventStream, StreamEvent, event_channel};
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use recovery::{recover_tool_calls, strip_markup};
pub use trace::{DirTraceSink, NoopTraceSink, TraceResponse, TraceSink};
