//! Errors raised while loading a pipeline configuration.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed KDL: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("missing {0}")]
    MissingField(String),

    #[error("invalid {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("{section} backend '{name}' is not supported")]
    UnknownBackend { section: &'static str, name: String },

    #[error("{0} is declared more than once")]
    Duplicate(String),

    /// Unknown dependency or a dependency cycle between resources.
    #[error("invalid resource graph: {0}")]
    InvalidReference(String),
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
