//! Events emitted by a streaming run and the channel that carries them.
//!
//! A run emits [`StreamEvent`]s in strict order over a bounded channel built
//! by [`event_channel`]. The [`EventSender`] half belongs to the run; the
//! [`EventStream`] half has exactly one consumer, which reads until `Done`
//! or `Error`. Dropping every sender closes the stream.
//!
//! ```ignore
//! let (tx, mut events) = event_channel(64);
//! tokio::spawn(async move { orchestrator.run_stream(messages, &tx, &cancel).await });
//! while let Some(event) = events.next().await {
//!     match event {
//!         StreamEvent::Text { content } => print!("{content}"),
//!         StreamEvent::Done { .. } | StreamEvent::Error { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// One step of a run, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A non-empty fragment of model text, emitted as soon as it arrives.
    Text { content: String },
    /// The model asked for a tool call; execution follows.
    ToolCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    /// A tool finished. Failures are reported inline with `is_error` set.
    ToolResult {
        call_id: String,
        name: String,
        content: String,
        is_error: bool,
    },
    /// The run finished with this final text. Nothing follows.
    Done { text: String },
    /// The run failed. Nothing follows.
    Error { message: String, retryable: bool },
}

impl StreamEvent {
    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

/// Create a bounded event channel with room for `capacity` events.
pub fn event_channel(capacity: usize) -> (EventSender, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender { tx }, EventStream { rx })
}

/// Producer half. `send` waits for room, so a slow consumer slows the run
/// instead of growing memory.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventSender {
    /// Deliver an event. Returns `false` if the consumer has gone away;
    /// the run carries on regardless.
    pub async fn send(&self, event: StreamEvent) -> bool {
        log_event(&event);
        match self.tx.send(event).await {
            Ok(()) => true,
            Err(_) => {
                debug!("Event consumer dropped; discarding event");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Single-consumer half. Implements [`Stream`].
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Drain until a terminal event (inclusive) or until the senders are
    /// gone.
    pub async fn collect_until_terminal(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Log an event through `tracing` at a level matching its weight.
pub fn log_event(event: &StreamEvent) {
    match event {
        StreamEvent::Text { content } => trace!("text delta: {} bytes", content.len()),
        StreamEvent::ToolCall {
            name, arguments, ..
        } => {
            let preview: String = arguments.chars().take(120).collect();
            debug!("tool call: {name}({preview})");
        }
        StreamEvent::ToolResult {
            name,
            content,
            is_error,
            ..
        } => {
            if *is_error {
                warn!("tool {name} failed: {content}");
            } else {
                debug!("tool {name} result: {} bytes", content.len());
            }
        }
        StreamEvent::Done { text } => info!("run finished: {} chars", text.chars().count()),
        StreamEvent::Error { message, retryable } => {
            warn!("run failed (retryable={retryable}): {message}")
        }
    }
}
