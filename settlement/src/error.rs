//! Error types for the settlement layer

use thiserror::Error;

/// Result type for settlement operations
pub type Result<T> = std::result::Result<T, Error>;

/// Settlement errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_core::Error),

    /// Window content cannot be netted
    #[error("Netting error: {0}")]
    Netting(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Ledger error underneath, if any
    pub fn ledger(&self) -> Option<&ledger_core::Error> {
        match self {
            Error::Ledger(e) => Some(e),
            _ => None,
        }
    }
}
