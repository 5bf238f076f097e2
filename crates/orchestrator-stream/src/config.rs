use crate::errors::OrchestratorError;
use crate::parser::DEFAULT_MAX_LINE_BYTES;

/// Orchestrator behavior options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Recover tool calls written into text as `<tool_calls>` blocks.
    pub xml_recovery: bool,
    /// Longest SSE line kept in memory; longer lines are dropped.
    pub max_line_bytes: usize,
    /// Bounded event buffer used by [`spawn_stream`](crate::spawn_stream).
    pub event_buffer_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            xml_recovery: true,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            event_buffer_capacity: 128,
        }
    }
}

pub(crate) fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn parse_usize_env(key: &str, value: &str) -> Result<usize, OrchestratorError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|e| OrchestratorError::Config(format!("{key} must be an integer: {e}")))
}

impl OrchestratorConfig {
    /// Builds a config from the defaults overridden by environment variables.
    ///
    /// - `STREAM_ORCHESTRATOR_XML_RECOVERY`: bool flag (default enabled).
    /// - `STREAM_ORCHESTRATOR_MAX_LINE_BYTES`: line bound in bytes.
    /// - `STREAM_ORCHESTRATOR_EVENT_BUFFER`: spawned-session channel capacity.
    pub fn from_env() -> Result<Self, OrchestratorError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, OrchestratorError> {
        let mut config = Self::default();
        if let Some(value) = lookup("STREAM_ORCHESTRATOR_XML_RECOVERY") {
            config.xml_recovery = parse_bool_env(&value).ok_or_else(|| {
                OrchestratorError::Config(format!(
                    "STREAM_ORCHESTRATOR_XML_RECOVERY has unrecognized value {value:?}"
                ))
            })?;
        }
        if let Some(value) = lookup("STREAM_ORCHESTRATOR_MAX_LINE_BYTES") {
            config.max_line_bytes = parse_usize_env("STREAM_ORCHESTRATOR_MAX_LINE_BYTES", &value)?;
        }
        if let Some(value) = lookup("STREAM_ORCHESTRATOR_EVENT_BUFFER") {
            config.event_buffer_capacity =
                parse_usize_env("STREAM_ORCHESTRATOR_EVENT_BUFFER", &value)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn xml_recovery(mut self, enabled: bool) -> Self {
        self.xml_recovery = enabled;
        self
    }

    pub fn max_line_bytes(mut self, limit: usize) -> Self {
        self.max_line_bytes = limit;
        self
    }

    pub fn event_buffer_capacity(mut self, capacity: usize) -> Self {
        self.event_buffer_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.max_line_bytes == 0 {
            return Err(OrchestratorError::Config(
                "max_line_bytes must be greater than 0".into(),
            ));
        }
        if self.event_buffer_capacity == 0 {
            return Err(OrchestratorError::Config(
                "event_buffer_capacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
