//! Convenience re-exports for common `ballast-rs` types.
//!
//! ```ignore
//! use ballast_rs::prelude::*;
//! ```
//!
//! Covers the client, message constructors, the orchestrator and its
//! events, the resilience primitives, tools, and recording. Wire-level
//! types (SSE decoding, raw deltas) stay in their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    ChatRequest, ClientConfig, Message, OpenAiClient, ToolCall, ToolDef, json_schema_for,
};

// ── Resilience ──────────────────────────────────────────────────────
pub use crate::api::{
    BreakerConfig, BreakerRegistry, ChatModel, CircuitBreaker, CircuitState, EmbeddingModel,
    GuardedModel, PoolConfig, ProviderError, ProviderErrorKind, WorkItem, WorkResult, WorkerPool,
    classify_error, embed_all,
};

// ── Orchestration ───────────────────────────────────────────────────
pub use crate::agent::{
    DirTraceSink, EventStream, Orchestrator, OrchestratorConfig, OrchestratorError, StreamEvent,
    TraceSink, event_channel,
};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::{FnTool, Tool, ToolError, ToolExecutor, ToolFuture, ToolSet};

// ── Recording ───────────────────────────────────────────────────────
pub use crate::recording::{
    ConversationRecorder, ConversationStore, JsonlStore, MemoryStore, RecorderConfig,
};

pub use tokio_util::sync::CancellationToken;
