//! Resilient LLM calls and tool orchestration for OpenAI-compatible endpoints.
//!
//! `ballast-rs` turns a raw chat/embedding endpoint into a dependable,
//! concurrent, auditable service primitive. It does not pick models or write
//! prompts; it makes calls safe to issue from a busy service.
//!
//! # Where to find things
//!
//! - **Classify failures:** [`api::classify`] maps any transport or provider
//!   error to a [`ProviderError`](api::classify::ProviderError) with a kind
//!   and a `retryable` flag. Retry looping is left to the caller.
//!
//! - **Stop hammering a sick upstream:** [`api::circuit`] has the
//!   [`CircuitBreaker`](api::circuit::CircuitBreaker), a per-upstream
//!   [`BreakerRegistry`](api::circuit::BreakerRegistry), and
//!   [`GuardedModel`](api::circuit::GuardedModel), which wraps any
//!   [`ChatModel`](api::model::ChatModel) with breaker checks.
//!
//! - **Fan out independent calls:** [`api::pool::WorkerPool`] runs work
//!   items with bounded parallelism and returns results in completion
//!   order. [`api::embedding::embed_all`] uses it for embedding batches.
//!
//! - **Run a tool-calling conversation:** [`agent::orchestrator::Orchestrator`]
//!   drives the multi-turn loop, streaming [`StreamEvent`](agent::events::StreamEvent)s
//!   to a single consumer, or blocking until the final text.
//!
//! - **Audit every exchange:** [`recording::recorder::ConversationRecorder`]
//!   writes a pending record before each call and completes it in the
//!   background without ever blocking the caller.
//!
//! - **Expose tools:** implement [`Tool`](tools::Tool) and collect them in a
//!   [`ToolSet`](tools::ToolSet), or implement
//!   [`ToolExecutor`](tools::ToolExecutor) directly.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`api`] | Error classification, circuit breaking, worker pool, streaming, embeddings |
//! | [`agent`] | Turn loop, event stream, tool-call recovery, trace sinks |
//! | [`recording`] | Conversation records, store trait, async recorder, JSONL store |
//! | [`tools`] | `Tool` trait, `ToolSet`, `FnTool`, `ToolExecutor` |

pub mod agent;
pub mod api;
pub mod prelude;
pub mod recording;
pub mod tools;

use crate::api::classify::{CallSite, ProviderError, classify_message};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub use schemars;

// ── Constants ──────────────────────────────────────────────────────

/// Default base URL for OpenAI-compatible endpoints.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default model when none is configured.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`, for use as a tool's `parameters`.
///
/// # Example
///
/// ```
/// use ballast_rs::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct SearchArgs {
///     q: String,
/// }
///
/// let schema = json_schema_for::<SearchArgs>();
/// assert_eq!(schema["type"], "object");
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Request types ──────────────────────────────────────────────────

/// Chat completion request body (OpenAI-compatible subset).
#[derive(Serialize, Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDef>>,
    #[serde(skip_serializing_if = "is_false")]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
}

/// Streaming options; `include_usage` asks the server for a final usage chunk.
#[derive(Serialize, Debug, Clone, Copy)]
pub struct StreamOptions {
    pub include_usage: bool,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// A message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: None,
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }
}

// ── Tool types ─────────────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool definition sent to the API (OpenAI function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The type of a tool call. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum CallType {
    #[serde(rename = "function")]
    Function,
}

/// A tool call requested by the model. `arguments` is the raw JSON string
/// exactly as the model produced it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub function: FunctionCallData,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: CallType::Function,
            function: FunctionCallData {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    pub fn arguments(&self) -> &str {
        &self.function.arguments
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FunctionCallData {
    pub name: String,
    pub arguments: String,
}

// ── Response types ─────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct ApiErrorResponse {
    pub(crate) message: String,
}

/// Clean return type from a blocking chat call.
#[derive(Debug, Clone, Default)]
pub struct ChatCompletion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<UsageInfo>,
    pub finish_reason: Option<String>,
}

/// Token usage statistics.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

// ── Client configuration ───────────────────────────────────────────

/// Connection settings for [`OpenAiClient`].
///
/// ```ignore
/// let config = ClientConfig::from_env()
///     .with_base_url("http://localhost:8000/v1")
///     .with_timeout(Duration::from_secs(60));
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL without the trailing `/chat/completions`. Default: [`DEFAULT_BASE_URL`].
    pub base_url: String,
    /// Bearer token. Local servers usually need none.
    pub api_key: Option<String>,
    /// Whole-request timeout for blocking calls. Default: 120 s.
    pub timeout: Duration,
    /// Maximum gap between two reads of a streamed body. Default: 60 s.
    pub read_timeout: Duration,
    /// TCP connect timeout. Default: 10 s.
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(120),
            read_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            user_agent: concat!("ballast-rs/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `OPENAI_BASE_URL` and `OPENAI_API_KEY` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("OPENAI_BASE_URL")
            && !url.trim().is_empty()
        {
            config.base_url = url;
        }
        config.api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());
        config
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for OpenAI-compatible chat and embedding endpoints.
///
/// Every failure leaves this type already classified as a
/// [`ProviderError`] carrying the model and endpoint of the call.
pub struct OpenAiClient {
    pub(crate) client: reqwest::Client,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
    pub(crate) timeout: Duration,
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl OpenAiClient {
    /// Build a client from the given configuration.
    pub fn new(config: ClientConfig) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            timeout: config.timeout,
        })
    }

    /// The configured base URL (used as the upstream key for circuit breakers).
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    pub(crate) fn post(&self, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.post(url);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Send a blocking (non-streaming) chat completion request.
    pub async fn chat(&self, body: &ChatRequest) -> Result<ChatCompletion, ProviderError> {
        let url = self.chat_url();
        let site = CallSite::new(&body.model, &url);
        let tool_count = body.tools.as_ref().map_or(0, |t| t.len());
        debug!(
            "LLM request: model={}, messages={}, tools={}, max_tokens={}, temp={:?}",
            body.model,
            body.messages.len(),
            tool_count,
            body.max_tokens,
            body.temperature,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );

        let start = Instant::now();
        let resp = self
            .post(&url)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(&e, &site))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| transport_error(&e, &site))?;

        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(classify_message(
                &format!("API HTTP {status}: {text}"),
                Some(status.as_u16()),
                &site,
            ));
        }

        let parsed: RawChatResponse = serde_json::from_str(&text).map_err(|e| {
            classify_message(&format!("failed to parse response: {e}"), None, &site)
        })?;

        if let Some(err) = parsed.error {
            return Err(classify_message(
                &format!("API error: {}", err.message),
                None,
                &site,
            ));
        }

        if let Some(ref usage) = parsed.usage {
            debug!(
                "Token usage: prompt={}, completion={}, total={}",
                usage.prompt_tokens.unwrap_or(0),
                usage.completion_tokens.unwrap_or(0),
                usage.total_tokens.unwrap_or(0),
            );
        }

        let completion = match parsed.choices.and_then(|c| c.into_iter().next()) {
            Some(c) => ChatCompletion {
                content: c.message.content,
                tool_calls: c.message.tool_calls.unwrap_or_default(),
                usage: parsed.usage,
                finish_reason: c.finish_reason,
            },
            None => ChatCompletion {
                usage: parsed.usage,
                ..Default::default()
            },
        };
        debug!(
            "LLM output: {} chars text, {} tool call(s)",
            completion.content.as_ref().map_or(0, |s| s.len()),
            completion.tool_calls.len()
        );
        Ok(completion)
    }
}

/// Describe a reqwest failure including its source chain, so that phrases
/// like "connection refused" survive into classification.
pub(crate) fn transport_error(err: &reqwest::Error, site: &CallSite<'_>) -> ProviderError {
    let mut description = if err.is_timeout() {
        format!("request timed out: {err}")
    } else {
        format!("request failed: {err}")
    };
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        description.push_str(": ");
        description.push_str(&inner.to_string());
        source = inner.source();
    }
    classify_message(&description, err.status().map(|s| s.as_u16()), site)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors() {
        let sys = Message::system("hello");
        assert_eq!(sys.role, MessageRole::System);
        assert_eq!(sys.content.as_deref(), Some("hello"));

        let tool = Message::tool_result("call-1", "result");
        assert_eq!(tool.role, MessageRole::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call-1"));

        let calls = Message::assistant_tool_calls(vec![ToolCall::new("c1", "search", "{}")]);
        assert!(calls.content.is_none());
        assert_eq!(calls.tool_calls.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn chat_request_skips_unset_fields() {
        let req = ChatRequest {
            model: "m".into(),
            messages: vec![Message::user("hi")],
            ..Default::default()
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("tools").is_none());
        assert!(json.get("stream").is_none());
        assert!(json.get("temperature").is_none());
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn streaming_request_serializes_stream_flag() {
        let req = ChatRequest {
            model: "m".into(),
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
            temperature: Some(0.0),
            ..Default::default()
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["stream_options"]["include_usage"], true);
        assert_eq!(json["temperature"], 0.0);
    }

    #[test]
    fn tool_call_wire_format() {
        let call = ToolCall::new("call_1", "search", r#"{"q":"x"}"#);
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["type"], "function");
        assert_eq!(json["function"]["name"], "search");
        assert_eq!(call.arguments(), r#"{"q":"x"}"#);
    }

    #[test]
    fn client_trims_trailing_slash() {
        let client =
            OpenAiClient::new(ClientConfig::default().with_base_url("http://localhost:8000/v1/"))
                .unwrap();
        assert_eq!(client.base_url(), "http://localhost:8000/v1");
        assert_eq!(client.chat_url(), "http://localhost:8000/v1/chat/completions");
    }
}
