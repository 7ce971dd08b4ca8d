//! Configuration error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error in {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("missing field: {0}")]
    MissingField(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
