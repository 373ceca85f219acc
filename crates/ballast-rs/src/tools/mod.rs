//! Tool abstractions for function-calling conversations.
//!
//! The orchestrator calls tools through the [`ToolExecutor`] trait.
//! [`ToolSet`] is the stock implementation: a registry of [`Tool`]s with
//! argument validation, timeouts, and truncation.
//!
//! - [`core`] — [`Tool`], [`ToolSet`], [`FnTool`], [`ToolExecutor`],
//!   [`ToolError`].
//! - [`command`] — [`CommandTool`], shell-command tools loaded from a JSON
//!   definition file (used by the `ballast` CLI).

pub mod command;
pub mod core;

pub use command::{CommandTool, CommandToolSpec};
pub use core::{
    DEFAULT_MAX_RESULT_BYTES, DEFAULT_TOOL_TIMEOUT, FnTool, Tool, ToolError, ToolExecutor,
    ToolFuture, ToolSet, truncate_result, validate_tool_arguments,
};
