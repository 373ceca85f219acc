//! Server-Sent Events (SSE) streaming for chat completions.
//!
//! [`SseDecoder`] turns raw body bytes into [`StreamDelta`]s and is fed
//! incrementally from `reqwest::Response::chunk()`, so long responses never
//! wait on a single body read. [`OpenAiClient::open_stream`] wraps the two
//! into a [`DeltaStream`].

use crate::api::classify::{CallSite, ProviderError, ProviderErrorKind, classify_message};
use crate::api::model::DeltaStream;
use crate::{ChatRequest, OpenAiClient, UsageInfo, transport_error};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::pin::Pin;
use tracing::{debug, trace, warn};

/// One incremental piece of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    /// Visible text.
    Text(String),
    /// Reasoning/thinking text reported in a separate field.
    Reasoning(String),
    /// A tool-call fragment. Fragments sharing `index` belong to one call;
    /// `arguments` pieces are concatenated in arrival order.
    ToolCall {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    /// Token usage (usually in the final chunk).
    Usage(UsageInfo),
}

// ── Wire format ────────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
    usage: Option<UsageInfo>,
    error: Option<StreamError>,
}

#[derive(Deserialize, Debug)]
struct StreamError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: Option<RawDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawDelta {
    content: Option<String>,
    #[serde(alias = "reasoning_content")]
    reasoning: Option<String>,
    tool_calls: Option<Vec<RawToolCallDelta>>,
}

#[derive(Deserialize, Debug)]
struct RawToolCallDelta {
    index: Option<usize>,
    id: Option<String>,
    function: Option<RawFunctionDelta>,
}

#[derive(Deserialize, Debug, Default)]
struct RawFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

// ── Decoder ────────────────────────────────────────────────────────

/// Incremental SSE decoder.
///
/// Bytes are buffered until a full line is available, so multi-byte UTF-8
/// characters split across network chunks decode correctly. A mid-stream
/// `{"error": ...}` payload is yielded as `Err(message)`.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
    saw_done: bool,
    saw_error: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `data: [DONE]` has been seen. Input after it is ignored.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Whether the body ended the stream itself, with `[DONE]` or an error
    /// payload. A body that simply stops was cut off.
    pub fn completed(&self) -> bool {
        self.saw_done || self.saw_error
    }

    /// Feed a chunk of body bytes and return every delta completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<StreamDelta, String>> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        self.buffer.extend_from_slice(chunk);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.process_line(&String::from_utf8_lossy(&line), &mut out);
            if self.done {
                self.buffer.clear();
                break;
            }
        }
        out
    }

    /// Flush an unterminated final line at end of body.
    pub fn finish(&mut self) -> Vec<Result<StreamDelta, String>> {
        let mut out = Vec::new();
        if !self.done && !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.process_line(&String::from_utf8_lossy(&rest), &mut out);
        }
        self.done = true;
        out
    }

    fn process_line(&mut self, line: &str, out: &mut Vec<Result<StreamDelta, String>>) {
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') {
            return;
        }
        let Some(data) = line.strip_prefix("data:") else {
            trace!("Ignoring SSE field: {line}");
            return;
        };
        let data = data.trim_start();
        if data == "[DONE]" {
            self.done = true;
            self.saw_done = true;
            return;
        }
        parse_sse_data(data, out);
        if out.iter().any(Result::is_err) {
            self.saw_error = true;
        }
    }
}

/// Parse a single SSE `data:` payload into deltas.
fn parse_sse_data(data: &str, out: &mut Vec<Result<StreamDelta, String>>) {
    let chunk = match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!("Failed to parse SSE chunk: {e} (data: {data})");
            return;
        }
    };

    if let Some(err) = chunk.error {
        let message = match err.code {
            Some(code) => format!("API error (code {}): {}", code_text(&code), err.message),
            None => format!("API error: {}", err.message),
        };
        out.push(Err(message));
        return;
    }

    for choice in chunk.choices.into_iter().flatten() {
        if let Some(delta) = choice.delta {
            if let Some(content) = delta.content
                && !content.is_empty()
            {
                out.push(Ok(StreamDelta::Text(content)));
            }
            if let Some(reasoning) = delta.reasoning
                && !reasoning.is_empty()
            {
                out.push(Ok(StreamDelta::Reasoning(reasoning)));
            }
            for tc in delta.tool_calls.into_iter().flatten() {
                let func = tc.function.unwrap_or_default();
                out.push(Ok(StreamDelta::ToolCall {
                    index: tc.index.unwrap_or(0),
                    id: tc.id,
                    name: func.name,
                    arguments: func.arguments.unwrap_or_default(),
                }));
            }
        }
        if choice.finish_reason.is_some() {
            trace!("Stream finish_reason: {:?}", choice.finish_reason);
        }
    }

    if let Some(usage) = chunk.usage {
        out.push(Ok(StreamDelta::Usage(usage)));
    }
}

fn code_text(code: &serde_json::Value) -> String {
    match code {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ── Client streaming ───────────────────────────────────────────────

/// Raw body chunks, with read failures already classified.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ProviderError>> + Send>>;

struct SseState {
    chunks: ChunkStream,
    decoder: SseDecoder,
    pending: VecDeque<Result<StreamDelta, String>>,
    finished: bool,
    truncated: bool,
    model: String,
    endpoint: String,
    deltas: usize,
}

fn response_chunks(response: reqwest::Response, model: String, endpoint: String) -> ChunkStream {
    Box::pin(futures::stream::unfold(Some(response), move |response| {
        let model = model.clone();
        let endpoint = endpoint.clone();
        async move {
            let mut response = response?;
            match response.chunk().await {
                Ok(Some(bytes)) => Some((Ok(bytes.to_vec()), Some(response))),
                Ok(None) => None,
                Err(e) => Some((
                    Err(transport_error(&e, &CallSite::new(&model, &endpoint))),
                    None,
                )),
            }
        }
    }))
}

/// Decode an SSE body into deltas.
///
/// Provider error payloads and read failures end the stream with one `Err`
/// item. A body that ends without `data: [DONE]` or an error payload ends
/// with a retryable `Endpoint` error, so a cut connection is never taken for
/// a complete answer.
pub fn decode_sse(
    chunks: ChunkStream,
    model: impl Into<String>,
    endpoint: impl Into<String>,
) -> DeltaStream {
    let state = SseState {
        chunks,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
        truncated: false,
        model: model.into(),
        endpoint: endpoint.into(),
        deltas: 0,
    };

    let stream = futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                let item = item.map_err(|msg| {
                    st.finished = true;
                    st.pending.clear();
                    classify_message(&msg, None, &CallSite::new(&st.model, &st.endpoint))
                });
                st.deltas += 1;
                return Some((item, st));
            }
            if st.finished {
                if st.truncated {
                    st.truncated = false;
                    warn!("Stream ended before [DONE] after {} deltas", st.deltas);
                    let err = ProviderError::local(
                        ProviderErrorKind::Endpoint,
                        "stream ended before [DONE]",
                        true,
                        &CallSite::new(&st.model, &st.endpoint),
                    );
                    return Some((Err(err), st));
                }
                debug!("Stream completed with {} deltas", st.deltas);
                return None;
            }
            match st.chunks.next().await {
                Some(Ok(bytes)) => {
                    let decoded = st.decoder.push(&bytes);
                    st.pending.extend(decoded);
                    if st.decoder.is_done() {
                        st.finished = true;
                    }
                }
                None => {
                    let decoded = st.decoder.finish();
                    st.pending.extend(decoded);
                    st.finished = true;
                    st.truncated = !st.decoder.completed();
                }
                Some(Err(err)) => {
                    st.finished = true;
                    st.pending.clear();
                    return Some((Err(err), st));
                }
            }
        }
    });

    Box::pin(stream)
}

impl OpenAiClient {
    /// Send a streaming chat request and return the live delta stream.
    ///
    /// HTTP-level failures are reported before any delta; read failures and
    /// provider error payloads arrive as a final `Err` item.
    pub async fn open_stream(&self, body: &ChatRequest) -> Result<DeltaStream, ProviderError> {
        let url = self.chat_url();
        let site = CallSite::new(&body.model, &url);

        let mut stream_body = serde_json::to_value(body).map_err(|e| {
            classify_message(&format!("failed to serialize request: {e}"), None, &site)
        })?;
        stream_body["stream"] = serde_json::Value::Bool(true);
        stream_body["stream_options"] = serde_json::json!({ "include_usage": true });

        debug!(
            "Sending streaming chat request: model={}, messages={}",
            body.model,
            body.messages.len()
        );

        let resp = self
            .post(&url)
            .json(&stream_body)
            .send()
            .await
            .map_err(|e| transport_error(&e, &site))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_message(
                &format!("API HTTP {status}: {text}"),
                Some(status.as_u16()),
                &site,
            ));
        }

        let chunks = response_chunks(resp, body.model.clone(), url.clone());
        Ok(decode_sse(chunks, body.model.clone(), url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_deltas(items: Vec<Result<StreamDelta, String>>) -> Vec<StreamDelta> {
        items.into_iter().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn decodes_text_across_chunk_boundaries() {
        let mut dec = SseDecoder::new();
        let first = dec.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel");
        assert!(first.is_empty());
        let second = dec.push(b"lo\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n");
        assert_eq!(
            ok_deltas(second),
            vec![
                StreamDelta::Text("Hello".into()),
                StreamDelta::Text(" world".into())
            ]
        );
    }

    #[test]
    fn multibyte_character_split_between_chunks() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"héllo\"}}]}\n";
        let bytes = line.as_bytes();
        // Split inside the two-byte 'é'.
        let split = line.find('é').unwrap() + 1;
        let mut dec = SseDecoder::new();
        assert!(dec.push(&bytes[..split]).is_empty());
        let out = ok_deltas(dec.push(&bytes[split..]));
        assert_eq!(out, vec![StreamDelta::Text("héllo".into())]);
    }

    #[test]
    fn done_marker_stops_decoding() {
        let mut dec = SseDecoder::new();
        let out = dec.push(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\ndata: [DONE]\ndata: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n",
        );
        assert_eq!(ok_deltas(out), vec![StreamDelta::Text("a".into())]);
        assert!(dec.is_done());
        assert!(dec.push(b"data: {}\n").is_empty());
    }

    #[test]
    fn comments_and_blank_lines_ignored() {
        let mut dec = SseDecoder::new();
        let out = dec.push(b": keep-alive\n\nevent: message\n");
        assert!(out.is_empty());
    }

    #[test]
    fn tool_call_fragments_keep_index() {
        let mut dec = SseDecoder::new();
        let out = ok_deltas(dec.push(
            br#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_9","function":{"name":"search","arguments":"{\"q\":"}}]}}]}
"#,
        ));
        assert_eq!(
            out,
            vec![StreamDelta::ToolCall {
                index: 1,
                id: Some("call_9".into()),
                name: Some("search".into()),
                arguments: "{\"q\":".into(),
            }]
        );
    }

    #[test]
    fn reasoning_content_alias_and_usage() {
        let mut dec = SseDecoder::new();
        let out = ok_deltas(dec.push(
            br#"data: {"choices":[{"delta":{"reasoning_content":"hmm"}}],"usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}
"#,
        ));
        assert_eq!(out[0], StreamDelta::Reasoning("hmm".into()));
        match &out[1] {
            StreamDelta::Usage(u) => assert_eq!(u.total_tokens, Some(5)),
            other => panic!("expected usage, got {other:?}"),
        }
    }

    #[test]
    fn error_payload_becomes_err_item() {
        let mut dec = SseDecoder::new();
        let out = dec.push(b"data: {\"error\":{\"message\":\"Rate limit reached\",\"code\":429}}\n");
        assert_eq!(out.len(), 1);
        let msg = out[0].as_ref().unwrap_err();
        assert!(msg.contains("code 429"));
        assert!(msg.contains("Rate limit reached"));
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}").is_empty());
        let out = ok_deltas(dec.finish());
        assert_eq!(out, vec![StreamDelta::Text("tail".into())]);
        assert!(dec.is_done());
    }

    #[test]
    fn malformed_json_is_skipped() {
        let mut dec = SseDecoder::new();
        let out = dec.push(b"data: {not json\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n");
        assert_eq!(ok_deltas(out), vec![StreamDelta::Text("ok".into())]);
    }

    fn chunks(parts: &[&str]) -> ChunkStream {
        let parts: Vec<Result<Vec<u8>, ProviderError>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        Box::pin(futures::stream::iter(parts))
    }

    async fn drain(stream: DeltaStream) -> Vec<Result<StreamDelta, ProviderError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn body_ending_with_done_completes_cleanly() {
        let items = drain(decode_sse(
            chunks(&[
                "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n",
                "data: [DONE]\n",
            ]),
            "m",
            "http://x",
        ))
        .await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap(), &StreamDelta::Text("hi".into()));
    }

    #[tokio::test]
    async fn truncated_body_ends_with_retryable_error() {
        let items = drain(decode_sse(
            chunks(&["data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n"]),
            "m",
            "http://x",
        ))
        .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &StreamDelta::Text("par".into()));
        let err = items[1].as_ref().unwrap_err();
        assert_eq!(err.kind(), ProviderErrorKind::Endpoint);
        assert!(err.retryable());
        assert!(err.message().contains("[DONE]"), "{}", err.message());
    }

    #[tokio::test]
    async fn error_payload_is_the_only_terminal_error() {
        let items = drain(decode_sse(
            chunks(&["data: {\"error\":{\"message\":\"Rate limit reached\",\"code\":429}}\n"]),
            "m",
            "http://x",
        ))
        .await;
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].as_ref().unwrap_err().kind(),
            ProviderErrorKind::RateLimited
        );
    }

    #[tokio::test]
    async fn done_in_unterminated_final_line_is_honoured() {
        let items = drain(decode_sse(chunks(&["data: [DONE]"]), "m", "http://x")).await;
        assert!(items.is_empty());
    }

    #[test]
    fn decoder_reports_how_the_body_ended() {
        let mut dec = SseDecoder::new();
        dec.push(b"data: {\"choices\":[]}\n");
        dec.finish();
        assert!(!dec.completed());

        let mut dec = SseDecoder::new();
        dec.push(b"data: [DONE]\n");
        assert!(dec.completed());
    }
}
