//! Configuration for the [`Orchestrator`](super::orchestrator::Orchestrator).
//!
//! ```ignore
//! let config = OrchestratorConfig::new("gpt-4o-mini")
//!     .with_max_turns(6)
//!     .with_temperature(0.5)
//!     .with_project_id("billing");
//! ```

use std::collections::BTreeMap;

/// Default turn limit for a conversation.
pub const DEFAULT_MAX_TURNS: u32 = 10;

/// Default sampling temperature for streaming runs.
pub const DEFAULT_STREAM_TEMPERATURE: f32 = 0.7;

/// Default sampling temperature for blocking runs. Lower, so tool use is
/// more deterministic.
pub const DEFAULT_TOOL_TEMPERATURE: f32 = 0.2;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Model identifier sent with every request.
    pub model: String,
    /// Maximum model turns before the run fails. Default: 10. Minimum: 1.
    pub max_turns: u32,
    /// Temperature for streaming runs. `None` leaves it to the server.
    pub temperature: Option<f32>,
    /// Temperature for blocking runs. `None` leaves it to the server.
    pub tool_temperature: Option<f32>,
    /// Maximum completion tokens per turn. `0` leaves it to the server.
    pub max_tokens: u32,
    /// Capacity of the bounded event channel used by `spawn_stream`.
    pub event_buffer: usize,
    /// Tenant the conversation is recorded under.
    pub project_id: String,
    /// Extra key/value pairs copied into every conversation record.
    pub context: BTreeMap<String, String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: crate::DEFAULT_MODEL.to_string(),
            max_turns: DEFAULT_MAX_TURNS,
            temperature: Some(DEFAULT_STREAM_TEMPERATURE),
            tool_temperature: Some(DEFAULT_TOOL_TEMPERATURE),
            max_tokens: 0,
            event_buffer: DEFAULT_EVENT_BUFFER,
            project_id: "default".to_string(),
            context: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_max_turns(mut self, turns: u32) -> Self {
        self.max_turns = turns.max(1);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_tool_temperature(mut self, temperature: f32) -> Self {
        self.tool_temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = OrchestratorConfig::default();
        assert_eq!(c.max_turns, 10);
        assert!(c.tool_temperature < c.temperature);
        assert_eq!(c.event_buffer, DEFAULT_EVENT_BUFFER);
    }

    #[test]
    fn builders_clamp_to_minimums() {
        let c = OrchestratorConfig::new("m")
            .with_max_turns(0)
            .with_event_buffer(0)
            .with_context("source", "test");
        assert_eq!(c.model, "m");
        assert_eq!(c.max_turns, 1);
        assert_eq!(c.event_buffer, 1);
        assert_eq!(c.context.get("source").map(String::as_str), Some("test"));
    }
}
