//! Tool abstraction and dispatch.
//!
//! The orchestrator only needs a [`ToolExecutor`]: something that lists tool
//! definitions and runs a call by name. [`ToolSet`] is the stock executor,
//! dispatching to registered [`Tool`]s with optional JSON Schema argument
//! validation, a per-call timeout, and result truncation.

use crate::ToolDef;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Maximum size (in bytes) for tool output before truncation.
pub const DEFAULT_MAX_RESULT_BYTES: usize = 30_000;

/// Default timeout for tool execution (60 seconds).
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Boxed future returned by tool execution.
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("invalid arguments for tool '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("tool '{tool}' timed out after {after:?}")]
    Timeout { tool: String, after: Duration },
    #[error("tool '{tool}' failed: {message}")]
    Failed { tool: String, message: String },
    #[error("invalid tool definitions in {path}: {message}")]
    Definition { path: String, message: String },
}

impl ToolError {
    pub fn failed(tool: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Failed {
            tool: tool.into(),
            message: message.to_string(),
        }
    }
}

// ── Executor seam ──────────────────────────────────────────────────

/// Runs tool calls on behalf of the orchestrator. The core is agnostic to
/// what tools do; it only forwards the name and raw JSON arguments.
pub trait ToolExecutor: Send + Sync {
    /// Definitions advertised to the model. Empty means no tool schema is
    /// sent.
    fn definitions(&self) -> Vec<ToolDef>;

    /// Execute `name` with the raw JSON `arguments` string.
    fn execute<'a>(&'a self, name: &'a str, arguments: &'a str) -> ToolFuture<'a>;
}

impl<E: ToolExecutor + ?Sized> ToolExecutor for std::sync::Arc<E> {
    fn definitions(&self) -> Vec<ToolDef> {
        (**self).definitions()
    }

    fn execute<'a>(&'a self, name: &'a str, arguments: &'a str) -> ToolFuture<'a> {
        (**self).execute(name, arguments)
    }
}

// ── Tool trait ─────────────────────────────────────────────────────

/// A single callable tool.
///
/// ```ignore
/// struct Clock;
///
/// impl Tool for Clock {
///     fn definition(&self) -> ToolDef {
///         ToolDef::new("now", "Current UTC time", serde_json::json!({"type": "object"}))
///     }
///
///     fn execute(&self, _arguments: &str) -> ToolFuture<'_> {
///         Box::pin(async { Ok(chrono::Utc::now().to_rfc3339()) })
///     }
/// }
/// ```
pub trait Tool: Send + Sync {
    /// The definition sent to the model API.
    fn definition(&self) -> ToolDef;

    /// Execute with the raw JSON arguments string.
    fn execute(&self, arguments: &str) -> ToolFuture<'_>;

    fn name(&self) -> String {
        self.definition().function.name
    }
}

// ── ToolSet ────────────────────────────────────────────────────────

/// A collection of tools dispatched by name.
///
/// ```ignore
/// let tools = ToolSet::new()
///     .with_arg_validation(true)
///     .with_default_timeout(Some(Duration::from_secs(30)))
///     .with(lookup_tool)
///     .with_if(allow_writes, write_tool);
/// ```
pub struct ToolSet {
    tools: HashMap<String, Box<dyn Tool>>,
    max_result_bytes: usize,
    validate_args: bool,
    default_timeout: Option<Duration>,
}

impl fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.tools.keys().collect();
        names.sort();
        f.debug_struct("ToolSet")
            .field("tools", &names)
            .field("max_result_bytes", &self.max_result_bytes)
            .field("validate_args", &self.validate_args)
            .finish()
    }
}

impl ToolSet {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
            validate_args: false,
            default_timeout: Some(DEFAULT_TOOL_TIMEOUT),
        }
    }

    pub fn with_max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }

    /// Validate arguments against each tool's JSON Schema before execution.
    pub fn with_arg_validation(mut self, enabled: bool) -> Self {
        self.validate_args = enabled;
        self
    }

    /// `None` disables timeouts.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name();
        if self.tools.insert(name.clone(), Box::new(tool)).is_some() {
            warn!("Tool '{name}' registered twice; keeping the latest");
        }
    }

    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    pub fn with_if(self, condition: bool, tool: impl Tool + 'static) -> Self {
        if condition { self.with(tool) } else { self }
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool call by name with validation, timing, timeout, and
    /// truncation.
    pub async fn run(&self, name: &str, arguments: &str) -> Result<String, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        if self.validate_args {
            validate_tool_arguments(tool.as_ref(), arguments)?;
        }

        log_tool_call(name, arguments);
        let start = Instant::now();

        let result = match self.default_timeout {
            Some(limit) => match tokio::time::timeout(limit, tool.execute(arguments)).await {
                Ok(r) => r,
                Err(_) => {
                    info!(
                        "Tool {name} timed out after {:.1}s (limit: {:.0}s)",
                        start.elapsed().as_secs_f64(),
                        limit.as_secs_f64(),
                    );
                    Err(ToolError::Timeout {
                        tool: name.to_string(),
                        after: limit,
                    })
                }
            },
            None => tool.execute(arguments).await,
        };

        let elapsed = start.elapsed();
        match &result {
            Ok(output) => {
                debug!(
                    "Tool {name} completed in {:.0}ms ({} bytes)",
                    elapsed.as_secs_f64() * 1000.0,
                    output.len()
                );
                trace!("Tool {name} result preview: {}", preview(output, 300));
            }
            Err(e) => debug!(
                "Tool {name} failed in {:.0}ms: {e}",
                elapsed.as_secs_f64() * 1000.0
            ),
        }

        result.map(|output| truncate_result(output, self.max_result_bytes))
    }
}

impl Default for ToolSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolExecutor for ToolSet {
    fn definitions(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    fn execute<'a>(&'a self, name: &'a str, arguments: &'a str) -> ToolFuture<'a> {
        Box::pin(self.run(name, arguments))
    }
}

// ── FnTool ────────────────────────────────────────────────────────

type ErasedToolHandler = Box<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send>>
        + Send
        + Sync,
>;

/// A closure-based tool that parses its arguments into `A` before calling
/// the handler.
///
/// ```ignore
/// #[derive(Deserialize, JsonSchema)]
/// struct SearchArgs { q: String }
///
/// let search = FnTool::new(
///     ToolDef::new("search", "Search the catalogue", json_schema_for::<SearchArgs>()),
///     |args: SearchArgs| async move { Ok::<_, String>(format!("results for {}", args.q)) },
/// );
/// ```
pub struct FnTool {
    def: ToolDef,
    handler: ErasedToolHandler,
}

impl FnTool {
    /// A handler error `E` is reported as [`ToolError::Failed`].
    pub fn new<A, F, Fut, E>(def: ToolDef, handler: F) -> Self
    where
        A: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let name = def.function.name.clone();
        let erased = move |raw: String| -> Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send>> {
            let args: A = match serde_json::from_str(&raw) {
                Ok(a) => a,
                Err(e) => {
                    let err = ToolError::InvalidArguments {
                        tool: name.clone(),
                        message: e.to_string(),
                    };
                    return Box::pin(async move { Err(err) });
                }
            };
            let fut = handler(args);
            let name = name.clone();
            Box::pin(async move { fut.await.map_err(|e| ToolError::failed(name, e)) })
        };

        Self {
            def,
            handler: Box::new(erased),
        }
    }
}

impl Tool for FnTool {
    fn definition(&self) -> ToolDef {
        self.def.clone()
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        (self.handler)(arguments.to_string())
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.def.function.name)
            .finish()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Validate arguments against the tool's declared JSON Schema.
///
/// A schema that itself fails to compile is not enforced.
pub fn validate_tool_arguments(tool: &dyn Tool, arguments: &str) -> Result<(), ToolError> {
    let def = tool.definition();
    let name = def.function.name;
    let args_value: serde_json::Value =
        serde_json::from_str(arguments).map_err(|e| ToolError::InvalidArguments {
            tool: name.clone(),
            message: format!("not valid JSON: {e}"),
        })?;

    let validator = match jsonschema::validator_for(&def.function.parameters) {
        Ok(v) => v,
        Err(e) => {
            debug!("Skipping argument validation for {name}: schema does not compile: {e}");
            return Ok(());
        }
    };

    let errors: Vec<String> = validator
        .iter_errors(&args_value)
        .map(|e| format!("{}: {e}", e.instance_path()))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ToolError::InvalidArguments {
            tool: name,
            message: errors.join("; "),
        })
    }
}

/// Log a tool call at INFO level with a truncated preview of arguments.
pub fn log_tool_call(name: &str, arguments: &str) {
    let args_preview: String = arguments.chars().take(120).collect();
    info!(
        "[tool] {}({args_preview}{})",
        name,
        if arguments.chars().count() > 120 { "..." } else { "" }
    );
    trace!("[tool] {name} arguments: {arguments}");
}

/// Truncate to at most `max` bytes on a character boundary, appending a
/// notice if anything was cut.
pub fn truncate_result(s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let cut = floor_char_boundary(&s, max);
    format!(
        "{}...\n[truncated: {} bytes total]",
        s.get(..cut).unwrap_or_default(),
        s.len()
    )
}

fn preview(s: &str, max: usize) -> &str {
    s.get(..floor_char_boundary(s, max)).unwrap_or_default()
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}
