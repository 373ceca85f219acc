//! The multi-turn tool-calling loop.
//!
//! [`Orchestrator`] sends the conversation to a [`ChatModel`], runs any tool
//! calls the model asks for through a [`ToolExecutor`], appends the results,
//! and repeats until the model answers without tool calls or the turn limit
//! is hit.
//!
//! Two modes share the same turn logic:
//!
//! - [`run_stream`](Orchestrator::run_stream) streams each turn and emits
//!   [`StreamEvent`]s as it goes. [`spawn_stream`](Orchestrator::spawn_stream)
//!   runs it on a task and hands back the [`EventStream`].
//! - [`run`](Orchestrator::run) makes one blocking call per turn, emits
//!   nothing, and uses the lower tool temperature.
//!
//! ```ignore
//! let orchestrator = Arc::new(
//!     Orchestrator::new(Arc::new(client), Arc::new(tools), OrchestratorConfig::new("gpt-4o-mini"))
//!         .with_recorder(recorder.clone()),
//! );
//! let (mut events, handle) = orchestrator.spawn_stream(messages, cancel.clone());
//! while let Some(event) = events.next().await { /* render */ }
//! let answer = handle.await??;
//! ```

use super::config::OrchestratorConfig;
use super::events::{EventSender, EventStream, StreamEvent, event_channel};
use super::execution::{TurnOutput, blocking_turn, execute_tool_call, stream_turn};
use super::recovery::{recover_tool_calls, strip_markup};
use super::trace::{NoopTraceSink, TraceResponse, TraceSink};
use crate::api::classify::{CallSite, ProviderError};
use crate::api::model::ChatModel;
use crate::recording::{Completion, ConversationRecord, ConversationRecorder, PendingRecord};
use crate::tools::core::ToolExecutor;
use crate::{ChatRequest, Message, ToolCall};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a run ended without an answer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("turn limit of {limit} exceeded without a final answer")]
    TurnLimitExceeded { limit: u32 },
}

impl OrchestratorError {
    pub fn retryable(&self) -> bool {
        match self {
            OrchestratorError::Provider(e) => e.retryable(),
            OrchestratorError::TurnLimitExceeded { .. } => false,
        }
    }
}

pub struct Orchestrator {
    model: Arc<dyn ChatModel>,
    tools: Arc<dyn ToolExecutor>,
    config: OrchestratorConfig,
    recorder: Option<Arc<ConversationRecorder>>,
    trace: Arc<dyn TraceSink>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("endpoint", &self.model.endpoint())
            .field("config", &self.config)
            .field("recording", &self.recorder.is_some())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn ChatModel>,
        tools: Arc<dyn ToolExecutor>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            model,
            tools,
            config,
            recorder: None,
            trace: Arc::new(NoopTraceSink),
        }
    }

    /// Record every turn through `recorder`.
    pub fn with_recorder(mut self, recorder: Arc<ConversationRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Send raw request/response payloads to `sink`.
    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = sink;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run the loop in streaming mode, emitting events to `events`. The
    /// last event is always `Done` or `Error`.
    pub async fn run_stream(
        &self,
        messages: Vec<Message>,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<String, OrchestratorError> {
        self.run_loop(messages, Some(events), cancel).await
    }

    /// Run the loop with one blocking call per turn. Returns only the final
    /// text.
    pub async fn run(
        &self,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<String, OrchestratorError> {
        self.run_loop(messages, None, cancel).await
    }

    /// Run [`run_stream`](Self::run_stream) on a new task. The stream closes
    /// after the terminal event; the handle yields the run's result.
    pub fn spawn_stream(
        self: &Arc<Self>,
        messages: Vec<Message>,
        cancel: CancellationToken,
    ) -> (EventStream, JoinHandle<Result<String, OrchestratorError>>) {
        let (tx, rx) = event_channel(self.config.event_buffer);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run_stream(messages, &tx, &cancel).await });
        (rx, handle)
    }

    async fn run_loop(
        &self,
        mut messages: Vec<Message>,
        events: Option<&EventSender>,
        cancel: &CancellationToken,
    ) -> Result<String, OrchestratorError> {
        let conversation_id = uuid::Uuid::new_v4().to_string();
        let max_turns = self.config.max_turns.max(1);
        let temperature = if events.is_some() {
            self.config.temperature
        } else {
            self.config.tool_temperature
        };
        let definitions = self.tools.definitions();
        let tools = (!definitions.is_empty()).then_some(definitions);

        info!(
            "Conversation {conversation_id}: model={}, max_turns={max_turns}, tools={}, streaming={}",
            self.config.model,
            tools.as_ref().map_or(0, Vec::len),
            events.is_some()
        );

        for turn in 1..=max_turns {
            if cancel.is_cancelled() {
                let site = CallSite::new(&self.config.model, self.model.endpoint());
                return Err(self.fail(events, ProviderError::cancelled(&site).into()).await);
            }

            let request = ChatRequest {
                model: self.config.model.clone(),
                messages: messages.clone(),
                max_tokens: self.config.max_tokens,
                temperature,
                tools: tools.clone(),
                ..Default::default()
            };
            debug!(
                "Turn {turn}/{max_turns}: sending {} messages",
                request.messages.len()
            );
            self.trace.on_request(&conversation_id, turn, &request);
            let pending = self.save_pending(&conversation_id, turn, &request).await;

            let started = Instant::now();
            let result = match events {
                Some(tx) => stream_turn(self.model.as_ref(), &request, Some(tx), cancel).await,
                None => blocking_turn(self.model.as_ref(), &request, cancel).await,
            };
            let elapsed = started.elapsed();
            self.trace_response(&conversation_id, turn, &result, elapsed);
            self.complete_record(pending, &result, elapsed);

            let output = match result {
                Ok(output) => output,
                Err(e) => return Err(self.fail(events, e.into()).await),
            };
            if let Some(usage) = output.usage {
                debug!(
                    "Turn {turn}: {} prompt + {} completion tokens in {}ms",
                    usage.prompt_tokens.unwrap_or(0),
                    usage.completion_tokens.unwrap_or(0),
                    elapsed.as_millis()
                );
            }

            let (text, calls) = resolve_tool_calls(output.text, output.tool_calls);
            if calls.is_empty() {
                info!("Conversation {conversation_id}: finished after {turn} turn(s)");
                if let Some(tx) = events {
                    tx.send(StreamEvent::Done { text: text.clone() }).await;
                }
                return Ok(text);
            }

            debug!("Turn {turn}: {} tool call(s)", calls.len());
            let mut assistant = Message::assistant_tool_calls(calls.clone());
            if !text.trim().is_empty() {
                assistant.content = Some(text);
            }
            messages.push(assistant);

            for call in &calls {
                if let Some(tx) = events {
                    tx.send(StreamEvent::ToolCall {
                        call_id: call.id.clone(),
                        name: call.name().to_string(),
                        arguments: call.arguments().to_string(),
                    })
                    .await;
                }
                let (content, is_error) = execute_tool_call(self.tools.as_ref(), call).await;
                if let Some(tx) = events {
                    tx.send(StreamEvent::ToolResult {
                        call_id: call.id.clone(),
                        name: call.name().to_string(),
                        content: content.clone(),
                        is_error,
                    })
                    .await;
                }
                messages.push(Message::tool_result(call.id.clone(), content));
            }
        }

        warn!("Conversation {conversation_id}: turn limit {max_turns} reached");
        Err(self
            .fail(
                events,
                OrchestratorError::TurnLimitExceeded { limit: max_turns },
            )
            .await)
    }

    async fn fail(&self, events: Option<&EventSender>, err: OrchestratorError) -> OrchestratorError {
        if let Some(tx) = events {
            tx.send(StreamEvent::Error {
                message: err.to_string(),
                retryable: err.retryable(),
            })
            .await;
        }
        err
    }

    async fn save_pending(
        &self,
        conversation_id: &str,
        turn: u32,
        request: &ChatRequest,
    ) -> Option<PendingRecord> {
        let recorder = self.recorder.as_ref()?;
        let mut context = self.config.context.clone();
        context.insert("conversation_id".to_string(), conversation_id.to_string());
        let record = ConversationRecord::pending(
            self.config.project_id.clone(),
            request.model.clone(),
            self.model.endpoint(),
            turn,
            request.messages.clone(),
            request.temperature,
        )
        .with_context(context);
        Some(recorder.save_pending(record).await)
    }

    fn complete_record(
        &self,
        pending: Option<PendingRecord>,
        result: &Result<TurnOutput, ProviderError>,
        elapsed: Duration,
    ) {
        let (Some(recorder), Some(pending)) = (self.recorder.as_ref(), pending) else {
            return;
        };
        let completion = match result {
            Ok(output) => Completion::Success {
                content: response_content(output),
                usage: output.usage,
                duration: elapsed,
            },
            Err(e) => Completion::failure(e, elapsed),
        };
        recorder.record_completion(pending, &completion);
    }

    fn trace_response(
        &self,
        conversation_id: &str,
        turn: u32,
        result: &Result<TurnOutput, ProviderError>,
        elapsed: Duration,
    ) {
        let duration_ms = elapsed.as_millis() as u64;
        let response = match result {
            Ok(output) => TraceResponse {
                text: output.text.clone(),
                reasoning: output.reasoning.clone(),
                tool_calls: output.tool_calls.clone(),
                usage: output.usage,
                error: None,
                duration_ms,
            },
            Err(e) => TraceResponse {
                error: Some(e.to_string()),
                duration_ms,
                ..Default::default()
            },
        };
        self.trace.on_response(conversation_id, turn, &response);
    }
}

/// Structured calls win. Without them, calls written into the text are
/// recovered and their markup stripped from the visible text.
fn resolve_tool_calls(text: String, calls: Vec<ToolCall>) -> (String, Vec<ToolCall>) {
    if !calls.is_empty() || text.is_empty() {
        return (text, calls);
    }
    let recovered = recover_tool_calls(&text);
    if recovered.is_empty() {
        return (text, calls);
    }
    debug!("Recovered {} tool call(s) from text", recovered.len());
    (strip_markup(&text), recovered)
}

/// The text of a turn, or its tool calls as JSON when it made any.
fn response_content(output: &TurnOutput) -> String {
    if output.tool_calls.is_empty() {
        return output.text.clone();
    }
    serde_json::to_string(&output.tool_calls).unwrap_or_else(|_| output.text.clone())
}
