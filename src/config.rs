use std::collections::HashSet;
use std::env as std_env;
use std::str::FromStr;

use crate::errors::{ConfigError, ErrorCode};
use crate::fallback::FallbackConfig;
use crate::rate_limiter::RateLimitConfig;

/// Engine-level configuration: fallback policy, optional outbound rate
/// limiting, and log settings. Validated once at startup; an invalid
/// configuration is fatal, never a per-flow error.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub fallback: FallbackConfig,
    pub rate_limit: Option<RateLimitConfig>,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fallback: FallbackConfig::default(),
            rate_limit: None,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fallback.validate()?;
        validate_log_level(&self.log_level)?;
        if let Some(rate_limit) = &self.rate_limit {
            if rate_limit.max_requests == 0 {
                return Err(ConfigError::Validation(
                    "rate_limit.max_requests must be greater than zero".into(),
                ));
            }
            if rate_limit.window.is_zero() {
                return Err(ConfigError::ZeroDuration {
                    field: "rate_limit.window",
                });
            }
        }
        Ok(())
    }
}

fn validate_log_level(level: &str) -> Result<(), ConfigError> {
    const VALID: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
    if VALID.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!(
            "log_level must be one of trace, debug, info, warn, error; got '{}'",
            level
        )))
    }
}

/// Parse configured error-code strings into the closed taxonomy. An unknown
/// code is a fatal configuration error, caught at startup.
pub fn parse_error_codes(
    field: &'static str,
    codes: &[String],
) -> Result<HashSet<ErrorCode>, ConfigError> {
    codes
        .iter()
        .map(|code| {
            ErrorCode::from_str(code).map_err(|_| ConfigError::UnknownErrorCode {
                field,
                code: code.clone(),
            })
        })
        .collect()
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("payflow={}", level);
    let filter_directive = std_env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}
