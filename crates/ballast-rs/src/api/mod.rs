//! Model-call layer: failure classification, circuit breaking, bounded
//! fan-out, streaming, and embeddings.
//!
//! - [`classify`] — maps transport/provider failures to a
//!   [`ProviderError`] with a kind and a `retryable` flag. No retry looping.
//! - [`circuit`] — three-state [`CircuitBreaker`], per-upstream
//!   [`BreakerRegistry`], and the [`GuardedModel`] decorator.
//! - [`pool`] — [`WorkerPool`] for independent calls with bounded
//!   parallelism and completion-ordered results.
//! - [`model`] — the [`ChatModel`] / [`EmbeddingModel`] capability traits.
//! - [`streaming`] — SSE decoding into [`StreamDelta`]s.
//! - [`embedding`] — embedding requests and [`embed_all`] batching.

pub mod circuit;
pub mod classify;
pub mod embedding;
pub mod model;
pub mod pool;
pub mod streaming;

pub use circuit::{BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitState, GuardedModel};
pub use classify::{ProviderError, ProviderErrorKind, classify_error, classify_message};
pub use embedding::embed_all;
pub use model::{ChatModel, DeltaStream, EmbeddingModel, ModelFuture};
pub use pool::{PoolConfig, WorkItem, WorkResult, WorkerPool};
pub use streaming::StreamDelta;
