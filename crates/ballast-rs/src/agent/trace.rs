//! Raw payload tracing for orchestrator turns.
//!
//! The orchestrator hands every request it sends and every response it
//! assembles to a [`TraceSink`]. The default sink discards them;
//! [`DirTraceSink`] writes one JSON file per payload:
//!
//! ```text
//! <dir>/<conversation_id>/turn-001-request.json
//! <dir>/<conversation_id>/turn-001-response.json
//! ```

use crate::{ChatRequest, ToolCall, UsageInfo};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::warn;

/// What came back for one turn, successful or not.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TraceResponse {
    pub text: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reasoning: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Receives raw request/response payloads. Both methods default to no-ops,
/// so a sink only implements what it cares about. Sinks must not fail the
/// run; they log and move on.
pub trait TraceSink: Send + Sync {
    fn on_request(&self, _conversation_id: &str, _turn: u32, _request: &ChatRequest) {}

    fn on_response(&self, _conversation_id: &str, _turn: u32, _response: &TraceResponse) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTraceSink;

impl TraceSink for NoopTraceSink {}

/// Writes payloads as pretty JSON files under a directory.
#[derive(Debug, Clone)]
pub struct DirTraceSink {
    dir: PathBuf,
}

impl DirTraceSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&self, conversation_id: &str, file_name: &str, value: &impl Serialize) {
        if let Err(e) = self.try_write(conversation_id, file_name, value) {
            warn!("Trace write failed for {conversation_id}/{file_name}: {e}");
        }
    }

    /// Atomic write: serialize to a temp file, then rename into place.
    fn try_write(
        &self,
        conversation_id: &str,
        file_name: &str,
        value: &impl Serialize,
    ) -> Result<(), String> {
        let dir = self.dir.join(conversation_id);
        std::fs::create_dir_all(&dir).map_err(|e| format!("Failed to create trace dir: {e}"))?;

        let final_path = dir.join(file_name);
        let tmp_path = dir.join(format!(".{file_name}.tmp"));

        let json = serde_json::to_string_pretty(value)
            .map_err(|e| format!("Failed to serialize payload: {e}"))?;
        std::fs::write(&tmp_path, json).map_err(|e| format!("Failed to write temp file: {e}"))?;
        std::fs::rename(&tmp_path, &final_path)
            .map_err(|e| format!("Failed to rename trace file: {e}"))?;
        Ok(())
    }
}

impl TraceSink for DirTraceSink {
    fn on_request(&self, conversation_id: &str, turn: u32, request: &ChatRequest) {
        self.write(conversation_id, &format!("turn-{turn:03}-request.json"), request);
    }

    fn on_response(&self, conversation_id: &str, turn: u32, response: &TraceResponse) {
        self.write(
            conversation_id,
            &format!("turn-{turn:03}-response.json"),
            response,
        );
    }
}
