//! Log subscriber setup.
//!
//! Environment variables:
//! - `RUST_LOG` - filter directives (default: `info`)
//! - `LOG_FORMAT` - `json` for JSON lines, anything else for text

use tracing_subscriber::{EnvFilter, filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
    /// Level used when `RUST_LOG` is unset.
    pub default_filter: LevelFilter,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            default_filter: LevelFilter::INFO,
        }
    }
}

impl TracingConfig {
    pub fn from_env() -> Self {
        Self {
            log_format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string()),
            ..Self::default()
        }
    }

    pub fn is_json(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

/// Installs the global subscriber.
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(config: TracingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.default_filter.into())
        .from_env_lossy();

    if config.is_json() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .try_init()?;
    }

    tracing::debug!(log_format = %config.log_format, "Tracing initialized");
    Ok(())
}
