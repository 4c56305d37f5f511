use thiserror::Error;

/// Errors raised while bootstrapping the hostable web core
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("{0}")]
    Validation(String),

    #[error("Access denied activating hostable web core: {0}")]
    Authorization(String),

    #[error("Hostable web core activation failed: {0}")]
    Activation(String),

    #[error("Application host configuration is not well-formed markup")]
    Markup(#[from] roxmltree::Error),

    #[error("Failed to establish identity context: {0}")]
    Identity(String),

    #[error("{0} is only available on Windows")]
    Unsupported(&'static str),

    #[error("I/O error during bootstrap")]
    Io(#[from] std::io::Error),
}

/// How a [`BootstrapError`] is reported to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authorization,
    Unexpected,
}

impl BootstrapError {
    pub fn validation(message: impl Into<String>) -> Self {
        BootstrapError::Validation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BootstrapError::Validation(_) => ErrorKind::Validation,
            BootstrapError::Authorization(_) => ErrorKind::Authorization,
            _ => ErrorKind::Unexpected,
        }
    }
}

pub type Result<T, E = BootstrapError> = std::result::Result<T, E>;
