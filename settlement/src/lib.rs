//! Settlement layer
//!
//! Drives the ledger's settlement windows: closes them on a schedule,
//! computes the multilateral net settlement of each closed window and
//! confirms (or rejects) settlement back into the ledger.
//!
//! # Cycle
//!
//! 1. **Close**: the OPEN window of a currency is closed, a new one opens
//! 2. **Net**: committed transfers of the closed window are netted per participant
//! 3. **Confirm**: the window is settled; transfers become SETTLED and positions are discharged
//!
//! # Example
//!
//! ```no_run
//! use settlement::{Config, SettlementEngine};
//!
//! #[tokio::main]
//! async fn main() -> settlement::Result<()> {
//!     let engine = SettlementEngine::open(Config::default()).await?;
//!     let currency = ledger_core::Currency::from_code("USD").expect("valid code");
//!
//!     let report = engine.close_and_net(currency).await?;
//!     println!(
//!         "Window {}: {} transfers, {} net movements",
//!         report.window_id,
//!         report.transfer_count,
//!         report.net_transfers.len()
//!     );
//!     engine.confirm(report.window_id).await?;
//!
//!     engine.shutdown().await
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod engine;
pub mod error;
pub mod netting;
pub mod scheduler;
pub mod types;

// Re-exports
pub use config::Config;
pub use engine::SettlementEngine;
pub use error::{Error, Result};
pub use scheduler::{ScheduleConfig, SettlementScheduler};
pub use types::*;
