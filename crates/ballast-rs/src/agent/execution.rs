//! Per-turn mechanics: sending one model request, assembling its output,
//! and executing tool calls.
//!
//! These helpers are called by [`super::orchestrator::Orchestrator`]'s turn
//! loop.

use super::events::{EventSender, StreamEvent};
use crate::api::classify::{CallSite, ProviderError};
use crate::api::model::ChatModel;
use crate::api::streaming::StreamDelta;
use crate::tools::core::ToolExecutor;
use crate::{ChatRequest, ToolCall, UsageInfo};
use futures::StreamExt;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::warn;

// ── Turn output ───────────────────────────────────────────────────

/// Everything one model turn produced.
#[derive(Debug, Clone, Default)]
pub(crate) struct TurnOutput {
    pub text: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<UsageInfo>,
}

// ── Send request ──────────────────────────────────────────────────

/// Stream one turn, forwarding every non-empty text fragment to `events`
/// as it arrives. Cancellation drops the connection and yields the
/// "request cancelled" error.
pub(crate) async fn stream_turn(
    model: &dyn ChatModel,
    request: &ChatRequest,
    events: Option<&EventSender>,
    cancel: &CancellationToken,
) -> Result<TurnOutput, ProviderError> {
    let read = async {
        let mut stream = model.chat_stream(request).await?;
        let mut output = TurnOutput::default();
        let mut calls = ToolCallAccumulator::default();

        while let Some(delta) = stream.next().await {
            match delta? {
                StreamDelta::Text(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    output.text.push_str(&text);
                    if let Some(events) = events {
                        events.send(StreamEvent::Text { content: text }).await;
                    }
                }
                StreamDelta::Reasoning(text) => output.reasoning.push_str(&text),
                StreamDelta::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                } => calls.push(index, id, name, &arguments),
                StreamDelta::Usage(usage) => output.usage = Some(usage),
            }
        }

        output.tool_calls = calls.finish();
        Ok::<_, ProviderError>(output)
    };

    let site = CallSite::new(&request.model, model.endpoint());
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::cancelled(&site)),
        result = read => result,
    }
}

/// One blocking request/response turn.
pub(crate) async fn blocking_turn(
    model: &dyn ChatModel,
    request: &ChatRequest,
    cancel: &CancellationToken,
) -> Result<TurnOutput, ProviderError> {
    let site = CallSite::new(&request.model, model.endpoint());
    let completion = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ProviderError::cancelled(&site)),
        result = model.chat(request) => result?,
    };
    Ok(TurnOutput {
        text: completion.content.unwrap_or_default(),
        reasoning: String::new(),
        tool_calls: completion.tool_calls,
        usage: completion.usage,
    })
}

// ── Tool-call assembly ────────────────────────────────────────────

/// Reassembles streamed tool-call fragments. Fragments are keyed by index;
/// `arguments` pieces are concatenated in arrival order, and the first
/// non-empty `id`/`name` seen for an index wins.
#[derive(Debug, Default)]
pub(crate) struct ToolCallAccumulator {
    calls: BTreeMap<usize, PartialCall>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl ToolCallAccumulator {
    pub fn push(
        &mut self,
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: &str,
    ) {
        let entry = self.calls.entry(index).or_default();
        if entry.id.is_none()
            && let Some(id) = id.filter(|s| !s.is_empty())
        {
            entry.id = Some(id);
        }
        if entry.name.is_none()
            && let Some(name) = name.filter(|s| !s.is_empty())
        {
            entry.name = Some(name);
        }
        entry.arguments.push_str(arguments);
    }

    /// Finished calls in index order. A call that never received a name is
    /// dropped; one that never received an id gets a generated one.
    pub fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_iter()
            .filter_map(|(index, call)| {
                let Some(name) = call.name else {
                    warn!("Dropping streamed tool call #{index}: no function name");
                    return None;
                };
                let id = call
                    .id
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                let arguments = if call.arguments.trim().is_empty() {
                    "{}".to_string()
                } else {
                    call.arguments
                };
                Some(ToolCall::new(id, name, arguments))
            })
            .collect()
    }
}

// ── Tool execution ────────────────────────────────────────────────

/// Run one tool call. Executor failures become a descriptive result string
/// so the model can see what went wrong; the flag reports whether it
/// failed.
pub(crate) async fn execute_tool_call(tools: &dyn ToolExecutor, call: &ToolCall) -> (String, bool) {
    match tools.execute(call.name(), call.arguments()).await {
        Ok(content) => (content, false),
        Err(e) => (format!("Error: {e}"), true),
    }
}
