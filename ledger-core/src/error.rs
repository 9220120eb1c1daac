//! Error types for the ledger
//!
//! Every failure the engine can report is a variant of [`Error`]. Business
//! rejections carry an FSPIOP-style numeric code (see [`Error::code`]) which is
//! also what gets persisted in `TransferError` rows.

use crate::types::{Currency, ParticipantId, TransferId, TransferState, WindowId, WindowState};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
///
/// Serializable so that a business rejection can be stored next to its
/// idempotency hash and replayed verbatim.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Malformed or out-of-policy request
    #[error("Validation error: {0}")]
    Validation(String),

    /// Same transfer id resubmitted with a different payload
    #[error("Duplicate conflict: transfer {0} was already submitted with a different payload")]
    DuplicateConflict(TransferId),

    /// Debit would breach the participant's net debit cap
    #[error("Limit exceeded: {participant} {currency} position {position} - {amount} breaches net debit cap {net_debit_cap}")]
    LimitExceeded {
        /// Participant being debited
        participant: ParticipantId,
        /// Position currency
        currency: Currency,
        /// Position before the debit
        position: Decimal,
        /// Debit amount (positive)
        amount: Decimal,
        /// Configured net debit cap
        net_debit_cap: Decimal,
    },

    /// Transfer not found
    #[error("Transfer not found: {0}")]
    NotFound(TransferId),

    /// Transfer is not in RESERVED state
    #[error("Transfer {transfer_id} is already {state}")]
    AlreadyTerminal {
        /// Transfer id
        transfer_id: TransferId,
        /// State found when the transition was attempted
        state: TransferState,
    },

    /// Fulfilment does not hash to the transfer condition
    #[error("Fulfilment does not match condition for transfer {0}")]
    ProofMismatch(TransferId),

    /// Transfer expiration passed before fulfilment
    #[error("Transfer {0} expired")]
    Expired(TransferId),

    /// No OPEN settlement window for the currency
    #[error("No open settlement window for {0}")]
    NoOpenWindow(Currency),

    /// Settlement window not found
    #[error("Settlement window not found: {0}")]
    WindowNotFound(WindowId),

    /// Settlement window is not in a state that allows the operation
    #[error("Settlement window {window_id} is {state}, expected {expected}")]
    InvalidWindowState {
        /// Window id
        window_id: WindowId,
        /// Current window state
        state: WindowState,
        /// State(s) the operation requires
        expected: String,
    },

    /// Infrastructure failure mid-transaction; safe to retry with the same id
    #[error("Transient storage error: {0}")]
    StorageTransient(String),

    /// Reconciliation invariant violated
    #[error("Ledger corruption: {0}")]
    Corruption(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Concurrency error (blocking task panicked, channel closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

impl Error {
    /// FSPIOP-style error code recorded with terminal failures
    pub fn code(&self) -> u16 {
        match self {
            Error::Validation(_) => 3100,
            Error::DuplicateConflict(_) => 3106,
            Error::LimitExceeded { .. } => 4001,
            Error::NotFound(_) => 3208,
            Error::AlreadyTerminal { .. } => 3105,
            Error::ProofMismatch(_) => 5105,
            Error::Expired(_) => 3303,
            _ => 2001,
        }
    }

    /// Only transient storage failures may be retried with the same request
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StorageTransient(_))
    }

    /// Business rejection that is surfaced to the caller (as opposed to a fault)
    pub fn is_business_rejection(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::DuplicateConflict(_)
                | Error::LimitExceeded { .. }
                | Error::NotFound(_)
                | Error::AlreadyTerminal { .. }
                | Error::ProofMismatch(_)
                | Error::Expired(_)
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        use rocksdb::ErrorKind;

        match err.kind() {
            ErrorKind::Busy | ErrorKind::TimedOut | ErrorKind::TryAgain => {
                Error::StorageTransient(err.to_string())
            }
            _ => Error::Storage(err.to_string()),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
