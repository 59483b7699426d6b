//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::AppConfig;
use crate::error::ConfigError;

/// Environment variable overriding `log.level`
pub const ENV_LOG_LEVEL: &str = "DISGUISE_TUNNEL_LOG_LEVEL";

/// Environment variable overriding `active_profile`
pub const ENV_PROFILE: &str = "DISGUISE_TUNNEL_PROFILE";

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: AppConfig = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: {} profiles, active={}",
        config.profiles.len(),
        config.active_profile
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `DISGUISE_TUNNEL_LOG_LEVEL`: Override log level
/// - `DISGUISE_TUNNEL_PROFILE`: Override the active profile id
///
/// # Errors
///
/// Returns `ConfigError` if loading fails or an override is invalid.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

/// Apply overrides looked up through `lookup`, then re-validate
pub(crate) fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(level) = lookup(ENV_LOG_LEVEL) {
        let normalized = level.trim().to_ascii_lowercase();
        if !matches!(
            normalized.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::EnvError {
                name: ENV_LOG_LEVEL.into(),
                reason: format!("Invalid log level: {level}"),
            });
        }
        config.log.level = normalized;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(profile) = lookup(ENV_PROFILE) {
        if !config.profiles.iter().any(|p| p.id == profile) {
            return Err(ConfigError::EnvError {
                name: ENV_PROFILE.into(),
                reason: format!("Unknown profile: {profile}"),
            });
        }
        config.active_profile = profile;
        debug!("Active profile overridden to {}", config.active_profile);
    }

    config.validate()
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = AppConfig::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
