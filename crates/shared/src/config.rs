//! Environment parsing shared by the API and the worker

use std::time::Duration;

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}

/// Boolean switch; unset falls back to `default`, an empty value is false
pub fn env_flag(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(ConfigError::Invalid(name)),
        },
        Err(_) => Ok(default),
    }
}

/// Whole, non-zero number of seconds
pub fn env_duration_secs(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let secs: u64 = match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name))?,
        Err(_) => default,
    };
    if secs == 0 {
        return Err(ConfigError::Invalid(name));
    }
    Ok(Duration::from_secs(secs))
}
