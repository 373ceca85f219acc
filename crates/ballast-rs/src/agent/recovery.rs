//! Recovery of tool calls that a model wrote as text.
//!
//! Some models ignore the structured tool-calling channel and instead emit
//! blocks like:
//!
//! ```text
//! <tool_call>
//! {"name": "search", "arguments": {"query": "rust"}}
//! </tool_call>
//! ```
//!
//! [`recover_tool_calls`] turns such blocks into [`ToolCall`]s and
//! [`strip_markup`] removes them (and `<think>` reasoning blocks) from the
//! text shown to the user.

use crate::ToolCall;
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

static TOOL_CALL_BLOCK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)<tool_call>\s*(.*?)\s*</tool_call>").ok());

static THINK_BLOCK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").ok());

static STRAY_TAG: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"</?(?:tool_call|think)>").ok());

static BLANK_RUN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\n(?:[ \t]*\n){2,}").ok());

/// Parse every `<tool_call>` block in `text`.
///
/// A block must hold a JSON object with a string `name` and an optional
/// `arguments` (or `parameters`) value. String arguments are passed through
/// verbatim; any other JSON value is re-serialized; a missing value becomes
/// `{}`. Blocks that fail to parse are skipped. Recovered calls get ids
/// `recovered_<batch>_0`, `recovered_<batch>_1`, ... in block order, where
/// `<batch>` is fresh on every call so ids never repeat within a
/// conversation.
pub fn recover_tool_calls(text: &str) -> Vec<ToolCall> {
    let Some(re) = TOOL_CALL_BLOCK.as_ref() else {
        return Vec::new();
    };

    let batch = uuid::Uuid::new_v4().simple().to_string();
    let mut calls = Vec::new();
    for cap in re.captures_iter(text) {
        let body = cap.get(1).map_or("", |m| m.as_str());
        match parse_block(body) {
            Some((name, arguments)) => {
                let id = format!("recovered_{batch}_{}", calls.len());
                calls.push(ToolCall::new(id, name, arguments));
            }
            None => debug!("Skipping unparseable tool_call block: {body}"),
        }
    }
    calls
}

fn parse_block(body: &str) -> Option<(String, String)> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let object = value.as_object()?;
    let name = object.get("name")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }
    let arguments = match object.get("arguments").or_else(|| object.get("parameters")) {
        None | Some(serde_json::Value::Null) => "{}".to_string(),
        Some(serde_json::Value::String(raw)) => raw.clone(),
        Some(other) => other.to_string(),
    };
    Some((name.to_string(), arguments))
}

/// Remove tool-call and reasoning markup from model text, then collapse
/// runs of blank lines into a single blank line and trim the ends.
pub fn strip_markup(text: &str) -> String {
    let mut out = text.to_string();
    for re in [&TOOL_CALL_BLOCK, &THINK_BLOCK, &STRAY_TAG] {
        if let Some(re) = re.as_ref() {
            out = re.replace_all(&out, "").into_owned();
        }
    }
    if let Some(re) = BLANK_RUN.as_ref() {
        out = re.replace_all(&out, "\n\n").into_owned();
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_pattern_compiles() {
        assert!(TOOL_CALL_BLOCK.is_some());
        assert!(THINK_BLOCK.is_some());
        assert!(STRAY_TAG.is_some());
        assert!(BLANK_RUN.is_some());
    }

    #[test]
    fn recovers_object_and_string_arguments() {
        let text = r#"Let me look.
<tool_call>
{"name": "search", "arguments": {"query": "rust"}}
</tool_call>
<tool_call>{"name": "fetch", "arguments": "{\"url\":\"x\"}"}</tool_call>"#;
        let calls = recover_tool_calls(text);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name(), "search");
        assert_eq!(calls[0].arguments(), r#"{"query":"rust"}"#);
        assert!(calls[0].id.starts_with("recovered_"));
        assert!(calls[0].id.ends_with("_0"));
        assert!(calls[1].id.ends_with("_1"));
        assert_eq!(calls[1].name(), "fetch");
        assert_eq!(calls[1].arguments(), r#"{"url":"x"}"#);
    }

    #[test]
    fn parameters_alias_and_missing_arguments() {
        let text = r#"<tool_call>{"name":"a","parameters":{"k":1}}</tool_call>
<tool_call>{"name":"b"}</tool_call>"#;
        let calls = recover_tool_calls(text);
        assert_eq!(calls[0].arguments(), r#"{"k":1}"#);
        assert_eq!(calls[1].arguments(), "{}");
    }

    #[test]
    fn malformed_blocks_are_skipped() {
        let text = r#"<tool_call>not json</tool_call>
<tool_call>{"arguments":{}}</tool_call>
<tool_call>{"name":"ok","arguments":{}}</tool_call>"#;
        let calls = recover_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name(), "ok");
        assert!(calls[0].id.ends_with("_0"));
    }

    #[test]
    fn ids_differ_between_recoveries() {
        let text = r#"<tool_call>{"name":"ok"}</tool_call>"#;
        let first = recover_tool_calls(text);
        let second = recover_tool_calls(text);
        assert_ne!(first[0].id, second[0].id);
    }

    #[test]
    fn plain_text_recovers_nothing() {
        assert!(recover_tool_calls("The answer is 42.").is_empty());
    }

    #[test]
    fn strip_removes_blocks_and_collapses_blank_lines() {
        let text = "<think>pondering\nmore</think>Hello.\n\n\n\n<tool_call>{\"name\":\"x\"}</tool_call>\n\n\n\nBye.</think>";
        assert_eq!(strip_markup(text), "Hello.\n\nBye.");
    }

    #[test]
    fn strip_keeps_single_blank_lines() {
        assert_eq!(strip_markup("a\n\nb\nc"), "a\n\nb\nc");
    }
}
