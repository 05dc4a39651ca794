//! Tracing initialisation for the gantry binary.
//!
//! Filtering comes from `GANTRY_LOG`, then `RUST_LOG`, then the level passed
//! by the caller. `GANTRY_LOG_FORMAT=json` switches to JSON lines without the
//! command-line flag, which is how CI runners usually configure it. Logs go
//! to stderr; stdout is left to the run summary.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter directives for gantry, e.g. `gantry_core=debug`.
pub const FILTER_ENV: &str = "GANTRY_LOG";

/// `json` or `text`.
pub const FORMAT_ENV: &str = "GANTRY_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    /// Newline-delimited JSON with event fields at the top level.
    Json,
}

impl LogFormat {
    /// The `--json` flag wins; otherwise the value of [`FORMAT_ENV`].
    pub fn resolve(json_flag: bool, env_value: Option<&str>) -> Self {
        if json_flag {
            return LogFormat::Json;
        }
        match env_value.map(str::trim) {
            Some(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_env(FILTER_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Initialise the global tracing subscriber. Only the first call in a
/// process takes effect.
pub fn init_tracing(json: bool, level: Level) {
    let format = LogFormat::resolve(json, std::env::var(FORMAT_ENV).ok().as_deref());
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(env_filter(level));

    let installed = match format {
        LogFormat::Json => registry.with(layer.json().flatten_event(true)).try_init(),
        LogFormat::Text => registry.with(layer).try_init(),
    };
    if installed.is_ok() {
        tracing::debug!(?format, "tracing initialised");
    }
}
