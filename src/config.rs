//! Application configuration.
//!
//! Loaded once at process start from a TOML file, with a small set of
//! environment-variable overrides taking precedence.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::state::Provider;

const ENV_DB_PATH: &str = "ATELIER_DB_PATH";
const ENV_MAX_RETRIES: &str = "ATELIER_MAX_RETRIES";
const ENV_REQUEST_TIMEOUT: &str = "ATELIER_REQUEST_TIMEOUT_SECONDS";

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Model name suggested to clients for new Creator personas.
    pub default_creator_model: String,
    /// Model name suggested to clients for new reviewer personas.
    pub default_reviewer_model: String,
    /// Connect timeout for provider calls, in seconds.
    pub request_timeout_seconds: u64,
    /// Retry budget for transient provider failures.
    pub max_retries: u32,
    /// Per-session event channel capacity.
    pub event_buffer: usize,
    /// Known model presets; fill in endpoint and provider when a client
    /// registers one of these by name without an endpoint.
    pub models: Vec<ModelPreset>,
    pub orchestration: OrchestrationConfig,
    pub persistence: PersistenceConfig,
    pub rate_limit: RateLimitConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_creator_model: "gpt-4o".to_string(),
            default_reviewer_model: "gpt-4o-mini".to_string(),
            request_timeout_seconds: 60,
            max_retries: 2,
            event_buffer: 256,
            models: Vec::new(),
            orchestration: OrchestrationConfig::default(),
            persistence: PersistenceConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// A model known to the deployment, usable as a registration template.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelPreset {
    pub model_name: String,
    pub endpoint: String,
    pub provider: Provider,
}

/// Defaults applied to new sessions and the deliberation loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    pub default_max_iterations: u32,
    pub default_stop_marker: String,
    pub stop_on_reviewer_approved: bool,
    /// Per-message character budget when assembling prompts.
    pub max_prompt_chars: usize,
    /// Character budget for a draft handed to reviewers.
    pub max_draft_chars: usize,
    /// How many recent transcript messages flow into the Creator prompt.
    pub context_turns_to_send: usize,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: 4,
            default_stop_marker: "FINAL:".to_string(),
            stop_on_reviewer_approved: true,
            max_prompt_chars: 24_000,
            max_draft_chars: 60_000,
            context_turns_to_send: 8,
        }
    }
}

/// Persistence settings. With `enabled = false` the store lives in memory
/// and dies with the process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub connection_string: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            connection_string: "atelier.db".to_string(),
        }
    }
}

/// Fixed-window rate limit applied to mutating requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub permit_limit: u32,
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            permit_limit: 60,
            window_seconds: 60,
        }
    }
}

impl AppConfig {
    /// Load from a TOML file, or defaults when no path is given. Environment
    /// overrides are applied either way.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var(ENV_DB_PATH) {
            self.persistence.connection_string = path;
        }
        if let Ok(retries) = std::env::var(ENV_MAX_RETRIES) {
            if let Ok(parsed) = retries.parse() {
                self.max_retries = parsed;
            }
        }
        if let Ok(timeout) = std::env::var(ENV_REQUEST_TIMEOUT) {
            if let Ok(parsed) = timeout.parse() {
                self.request_timeout_seconds = parsed;
            }
        }
    }

    /// Validate option ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_seconds must be > 0".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid("event_buffer must be > 0".to_string()));
        }
        if self.orchestration.default_max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "orchestration.default_max_iterations must be > 0".to_string(),
            ));
        }
        if self.orchestration.context_turns_to_send == 0 {
            return Err(ConfigError::Invalid(
                "orchestration.context_turns_to_send must be > 0".to_string(),
            ));
        }
        if self.rate_limit.permit_limit == 0 || self.rate_limit.window_seconds == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.permit_limit and window_seconds must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Connect timeout as a duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Look up a model preset by name.
    pub fn preset_for(&self, model_name: &str) -> Option<&ModelPreset> {
        self.models.iter().find(|m| m.model_name == model_name)
    }
}
