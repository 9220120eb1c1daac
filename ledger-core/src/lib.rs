//! Central Ledger Core
//!
//! Transfer and position settlement engine on a transactional RocksDB store.
//!
//! # Architecture
//!
//! - **Transactional store**: Every operation is one pessimistic RocksDB transaction
//! - **State log**: Transfer state is an append-only log with a materialized pointer
//! - **Positions**: Per participant/currency net positions with net debit caps
//! - **Settlement windows**: One OPEN window per currency, closed and settled in batches
//! - **Timeout sweeper**: Background task expiring unfulfilled transfers
//!
//! # Invariants
//!
//! - Position value == Σ(position change deltas) for every pair
//! - Current state pointer == latest state change for every transfer
//! - Exactly one terminal state per transfer
//! - Exactly one OPEN window per settlement currency

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod crypto;
pub mod duplicate;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod position;
pub mod reference;
pub mod storage;
pub mod sweeper;
pub mod transfer;
pub mod types;
pub mod window;

// Re-exports
pub use config::Config;
pub use duplicate::{DuplicateDetector, DuplicateStatus};
pub use error::{Error, Result};
pub use ledger::Ledger;
pub use reference::{ReferenceData, StaticReferenceData};
pub use storage::Storage;
pub use sweeper::SweepReport;
pub use types::{
    Condition, Currency, Fulfilment, ParticipantId, ParticipantPosition, SettlementWindow,
    TransferId, TransferRequest, TransferState, TransferView, WindowId, WindowState,
};
