//! Tracing initialisation for Rushline processes.

use rushline_core::{ConfigError, RushlineResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "rushline_seckill=info,rushline_storage=info,warn";

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives.
    pub filter: String,
    /// Emit one JSON object per event instead of human-readable lines.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Create TelemetryConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `RUSHLINE_LOG`: filter directives (default: `rushline_seckill=info,rushline_storage=info,warn`)
    /// - `RUSHLINE_LOG_JSON`: `true` or `1` for JSON output (default: false)
    pub fn from_env() -> Self {
        let filter = std::env::var("RUSHLINE_LOG")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());

        let json = std::env::var("RUSHLINE_LOG_JSON")
            .ok()
            .map(|s| matches!(s.trim().to_lowercase().as_str(), "true" | "1"))
            .unwrap_or(false);

        Self { filter, json }
    }
}

/// Install the global subscriber. Fails if the filter does not parse or a
/// subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> RushlineResult<()> {
    let env_filter = EnvFilter::try_new(&config.filter).map_err(|e| ConfigError::InvalidValue {
        field: "RUSHLINE_LOG".to_string(),
        value: config.filter.clone(),
        reason: e.to_string(),
    })?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    installed.map_err(|e| {
        ConfigError::Parse {
            reason: format!("Failed to init subscriber: {}", e),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        let config = TelemetryConfig::default();
        assert!(!config.json);
        assert!(config.filter.contains("rushline_seckill=info"));
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let config = TelemetryConfig {
            filter: "rushline_seckill=loud".to_string(),
            json: false,
        };
        assert!(init_tracing(&config).is_err());
    }
}
