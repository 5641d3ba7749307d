use thiserror::Error;

/// Infrastructure failures of the registry.
///
/// Domain outcomes (a mutation targeting an unknown or immutable certificate,
/// an import where the store rejected certificates) are never reported here;
/// they come back as `bool` or [`crate::ImportOutcome`] values.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Certificate store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Registry owner task is no longer running")]
    RegistryClosed,

    #[error("Registry construction aborted: {0}")]
    ConstructionAborted(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Configuration parse error: {0}")]
    ConfigParseError(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RegistryError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RegistryError::RegistryClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for RegistryError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        RegistryError::RegistryClosed
    }
}
