//! Runtime error types.

use thiserror::Error;

use crate::config::ConfigError;
use gramflow_framework::StartError;

/// Errors that can occur during runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Loading or validating configuration failed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The dispatcher refused to start.
    #[error("Failed to start dispatcher: {0}")]
    Start(#[from] StartError),

    /// No bot was given to the builder.
    #[error("No bot configured; call `RuntimeBuilder::bot` before `build`")]
    MissingBot,

    /// Installing a signal handler failed.
    #[error("Failed to listen for shutdown signals: {0}")]
    Signal(#[from] std::io::Error),
}

impl From<gramflow_framework::ConfigError> for RuntimeError {
    fn from(err: gramflow_framework::ConfigError) -> Self {
        Self::Config(err.into())
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
