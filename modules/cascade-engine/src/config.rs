use std::env;

use typed_builder::TypedBuilder;

/// Engine knobs. Everything defaults to off; a bare `EngineConfig::default()`
/// gives the plain matching semantics with no extra logging.
#[derive(Debug, Clone, TypedBuilder)]
pub struct EngineConfig {
    /// Log every handler dispatch at `debug`, with its input types.
    #[builder(default)]
    pub trace_dispatch: bool,

    /// Warn when an emitted event's type is not required by any registration.
    #[builder(default)]
    pub warn_unmatched: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    /// Missing or unparseable values fall back to the defaults.
    pub fn from_env() -> Self {
        Self {
            trace_dispatch: env_flag("CASCADE_TRACE_DISPATCH"),
            warn_unmatched: env_flag("CASCADE_WARN_UNMATCHED"),
        }
    }
}

fn env_flag(key: &str) -> bool {
    env::var(key).map(|v| parse_flag(&v)).unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
