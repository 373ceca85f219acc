//! Capability traits for model endpoints.
//!
//! The orchestrator, circuit breaker and embedding batcher only talk to
//! these traits. [`OpenAiClient`] is the HTTP implementation; tests plug in
//! scripted fakes.

use crate::api::classify::ProviderError;
use crate::api::streaming::StreamDelta;
use crate::{ChatCompletion, ChatRequest, OpenAiClient};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by model calls.
pub type ModelFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// A live stream of response deltas. Ends after the final delta; a
/// mid-stream failure is yielded as an `Err` item and nothing follows it.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta, ProviderError>> + Send>>;

/// A chat-completions endpoint.
pub trait ChatModel: Send + Sync {
    /// Identifier of the upstream, used in errors and as a breaker key.
    fn endpoint(&self) -> &str;

    /// One blocking request/response round trip.
    fn chat<'a>(&'a self, request: &'a ChatRequest) -> ModelFuture<'a, ChatCompletion>;

    /// Open a streaming response. The returned stream owns its connection
    /// and outlives the borrow of `request`.
    fn chat_stream<'a>(&'a self, request: &'a ChatRequest) -> ModelFuture<'a, DeltaStream>;
}

/// An embeddings endpoint.
pub trait EmbeddingModel: Send + Sync {
    fn endpoint(&self) -> &str;

    /// Embed `input` with `model`. The result has one vector per input, in
    /// input order.
    fn embed<'a>(&'a self, model: &'a str, input: &'a [String]) -> ModelFuture<'a, Vec<Vec<f32>>>;
}

impl<M: ChatModel + ?Sized> ChatModel for Arc<M> {
    fn endpoint(&self) -> &str {
        (**self).endpoint()
    }

    fn chat<'a>(&'a self, request: &'a ChatRequest) -> ModelFuture<'a, ChatCompletion> {
        (**self).chat(request)
    }

    fn chat_stream<'a>(&'a self, request: &'a ChatRequest) -> ModelFuture<'a, DeltaStream> {
        (**self).chat_stream(request)
    }
}

impl<M: EmbeddingModel + ?Sized> EmbeddingModel for Arc<M> {
    fn endpoint(&self) -> &str {
        (**self).endpoint()
    }

    fn embed<'a>(&'a self, model: &'a str, input: &'a [String]) -> ModelFuture<'a, Vec<Vec<f32>>> {
        (**self).embed(model, input)
    }
}

impl ChatModel for OpenAiClient {
    fn endpoint(&self) -> &str {
        self.base_url()
    }

    fn chat<'a>(&'a self, request: &'a ChatRequest) -> ModelFuture<'a, ChatCompletion> {
        Box::pin(OpenAiClient::chat(self, request))
    }

    fn chat_stream<'a>(&'a self, request: &'a ChatRequest) -> ModelFuture<'a, DeltaStream> {
        Box::pin(self.open_stream(request))
    }
}

impl EmbeddingModel for OpenAiClient {
    fn endpoint(&self) -> &str {
        self.base_url()
    }

    fn embed<'a>(&'a self, model: &'a str, input: &'a [String]) -> ModelFuture<'a, Vec<Vec<f32>>> {
        Box::pin(self.embeddings(model, input))
    }
}
