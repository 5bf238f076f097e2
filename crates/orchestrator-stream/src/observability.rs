use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::parse_bool_env;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_JSON_LOG_FILE: &str = "stream-orchestrator.logs.jsonl";

/// Logging settings, usually read from the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservabilityConfig {
    pub enabled: bool,
    /// Filter directives tried first (`STREAM_ORCHESTRATOR_LOG_LEVEL`).
    pub log_level: Option<String>,
    /// Fallback filter directives (`RUST_LOG`).
    pub rust_log: Option<String>,
    /// JSONL log file; console logging on stderr when unset.
    pub json_log_path: Option<PathBuf>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: None,
            rust_log: None,
            json_log_path: None,
        }
    }
}

impl ObservabilityConfig {
    /// Environment variables:
    /// - `STREAM_ORCHESTRATOR_OBSERVABILITY`: optional enable/disable flag (default enabled).
    /// - `STREAM_ORCHESTRATOR_LOG_LEVEL`: optional level/filter override (`info`, `debug`, etc.).
    /// - `STREAM_ORCHESTRATOR_JSON_LOG_PATH`: optional JSONL log file path.
    /// - `RUST_LOG`: filter used when no level override is usable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            enabled: non_empty("STREAM_ORCHESTRATOR_OBSERVABILITY")
                .and_then(|v| parse_bool_env(&v))
                .unwrap_or(true),
            log_level: non_empty("STREAM_ORCHESTRATOR_LOG_LEVEL"),
            rust_log: non_empty("RUST_LOG"),
            json_log_path: non_empty("STREAM_ORCHESTRATOR_JSON_LOG_PATH").map(PathBuf::from),
        }
    }

    /// First parseable of `log_level`, `rust_log`, then `info`.
    pub fn env_filter(&self) -> EnvFilter {
        [self.log_level.as_deref(), self.rust_log.as_deref()]
            .into_iter()
            .flatten()
            .find_map(|directives| EnvFilter::try_new(directives).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }

    /// Directory and file name for the JSON log appender.
    fn json_log_target(&self) -> Option<(PathBuf, String)> {
        let path = self.json_log_path.as_deref()?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(DEFAULT_JSON_LOG_FILE);
        Some((dir.to_path_buf(), file_name.to_string()))
    }
}

/// Initialize logging once per process from [`ObservabilityConfig::from_env`].
pub fn init_observability() {
    init_observability_with(ObservabilityConfig::from_env());
}

/// Initialize logging once per process. Later calls are no-ops, as is a
/// process that already installed its own subscriber.
pub fn init_observability_with(config: ObservabilityConfig) {
    INIT.get_or_init(|| {
        install(&config);
    });
}

fn install(config: &ObservabilityConfig) -> bool {
    if !config.enabled {
        return false;
    }

    let env_filter = config.env_filter();
    match config.json_log_target() {
        Some((dir, file_name)) => {
            let _ = std::fs::create_dir_all(&dir);
            let writer = tracing_appender::rolling::never(dir, file_name);
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(json_layer)
                .try_init()
                .is_ok()
        }
        None => {
            // stdout stays free for replay output.
            let console_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init()
                .is_ok()
        }
    }
}
