//! Configuration error types.

use thiserror::Error;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors that abort startup while loading the peer configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config syntax error: {0}")]
    Syntax(#[from] toml::de::Error),

    #[error("invalid config for {context}: {reason}")]
    Invalid { context: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(context: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            context: context.into(),
            reason: reason.into(),
        }
    }
}
