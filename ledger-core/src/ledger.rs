//! Main ledger orchestration layer
//!
//! This module ties together storage, the transfer state machine, the window
//! manager and the timeout sweeper into an async API. Engine operations are
//! blocking RocksDB transactions and run on tokio's blocking pool.
//!
//! # Example
//!
//! ```no_run
//! use ledger_core::{Config, Ledger};
//!
//! #[tokio::main]
//! async fn main() -> ledger_core::Result<()> {
//!     let config = Config::default();
//!     let ledger = Ledger::open_with_config_participants(config).await?;
//!
//!     // let id = ledger.prepare(request).await?;
//!     // ledger.fulfil(id, fulfilment).await?;
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    metrics::Metrics,
    position::PositionAccountant,
    reference::{ReferenceData, StaticReferenceData},
    storage::Storage,
    sweeper::{spawn_sweeper, sweep_once, SweepReport, SweeperHandle},
    transfer::TransferStateMachine,
    types::*,
    window::WindowManager,
    Config, DuplicateStatus, Error, Result,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Concurrency(format!("Blocking task failed: {}", e)))?
}

/// Main ledger interface
pub struct Ledger {
    /// Storage backend
    storage: Arc<Storage>,

    /// Transfer lifecycle
    machine: TransferStateMachine,

    /// Settlement windows
    windows: WindowManager,

    /// Metrics
    metrics: Arc<Metrics>,

    /// Background sweeper (if enabled)
    sweeper: Option<SweeperHandle>,

    /// Sweeper task, joined on shutdown
    sweeper_task: parking_lot::Mutex<Option<JoinHandle<()>>>,

    /// Configuration
    config: Config,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("data_dir", &self.config.data_dir)
            .field("sweeper", &self.sweeper.is_some())
            .finish_non_exhaustive()
    }
}

impl Ledger {
    /// Open ledger with configuration and a reference data provider
    ///
    /// Makes sure every configured settlement currency has an OPEN window and
    /// starts the timeout sweeper when enabled.
    pub async fn open(config: Config, reference: Arc<dyn ReferenceData>) -> Result<Self> {
        let metrics = Arc::new(
            Metrics::new().map_err(|e| Error::Config(format!("Failed to create metrics: {}", e)))?,
        );

        let storage = Arc::new(Storage::open(&config)?);

        let windows = WindowManager::new(
            storage.clone(),
            PositionAccountant::new(reference.clone()),
            metrics.clone(),
        );
        let machine = TransferStateMachine::new(
            storage.clone(),
            reference,
            windows.clone(),
            config.amount.clone(),
            metrics.clone(),
        );

        for code in &config.settlement_currencies {
            let currency: Currency = code.parse().map_err(|_| {
                Error::Config(format!("Invalid settlement currency '{}'", code))
            })?;
            let window_id = windows.ensure_open(&currency, Utc::now())?;
            tracing::debug!(%currency, %window_id, "Settlement scope ready");
        }

        let (sweeper, sweeper_task) = if config.sweeper.enabled {
            let (handle, task) = spawn_sweeper(
                machine.clone(),
                Duration::from_millis(config.sweeper.interval_ms),
                config.sweeper.batch_size,
                metrics.clone(),
            );
            (Some(handle), Some(task))
        } else {
            (None, None)
        };

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            currencies = ?config.settlement_currencies,
            "Ledger opened"
        );

        Ok(Self {
            storage,
            machine,
            windows,
            metrics,
            sweeper,
            sweeper_task: parking_lot::Mutex::new(sweeper_task),
            config,
        })
    }

    /// Open ledger using the `[[participants]]` tables of the config
    pub async fn open_with_config_participants(config: Config) -> Result<Self> {
        let reference = Arc::new(StaticReferenceData::from_config(&config.participants)?);
        Self::open(config, reference).await
    }

    // Transfers

    /// Prepare a transfer
    pub async fn prepare(&self, request: TransferRequest) -> Result<TransferId> {
        let machine = self.machine.clone();
        blocking(move || machine.prepare(&request, Utc::now())).await
    }

    /// Fulfil a transfer; returns the settlement window it was assigned to
    pub async fn fulfil(&self, transfer_id: TransferId, fulfilment: Fulfilment) -> Result<WindowId> {
        let machine = self.machine.clone();
        blocking(move || machine.fulfil(&transfer_id, &fulfilment, Utc::now())).await
    }

    /// Abort a RESERVED transfer (payee rejection)
    pub async fn abort(&self, transfer_id: TransferId, reason: impl Into<String>) -> Result<()> {
        let machine = self.machine.clone();
        let reason = reason.into();
        blocking(move || machine.abort(&transfer_id, reason, Utc::now())).await
    }

    /// Expire a RESERVED transfer whose deadline passed
    pub async fn expire(&self, transfer_id: TransferId) -> Result<()> {
        let machine = self.machine.clone();
        blocking(move || machine.expire(&transfer_id, Utc::now())).await
    }

    /// Get transfer with current state
    pub async fn get_transfer(&self, transfer_id: TransferId) -> Result<TransferView> {
        let machine = self.machine.clone();
        blocking(move || machine.get_transfer(&transfer_id)).await
    }

    /// Transfer state log
    pub async fn state_history(&self, transfer_id: TransferId) -> Result<Vec<StateChange>> {
        let machine = self.machine.clone();
        blocking(move || machine.state_history(&transfer_id)).await
    }

    /// Transfer errors
    pub async fn transfer_errors(&self, transfer_id: TransferId) -> Result<Vec<TransferErrorRecord>> {
        let machine = self.machine.clone();
        blocking(move || machine.transfer_errors(&transfer_id)).await
    }

    /// Check the state pointer against the log
    pub async fn verify_state_pointer(&self, transfer_id: TransferId) -> Result<StatePointer> {
        let machine = self.machine.clone();
        blocking(move || machine.verify_state_pointer(&transfer_id)).await
    }

    /// Classify a prepare request without submitting it
    pub async fn check_duplicate(&self, request: TransferRequest) -> Result<DuplicateStatus> {
        let machine = self.machine.clone();
        blocking(move || machine.check_duplicate(&request)).await
    }

    // Positions

    /// Current net position
    pub async fn position(
        &self,
        participant: ParticipantId,
        currency: Currency,
    ) -> Result<ParticipantPosition> {
        let storage = self.storage.clone();
        let positions = self.machine.positions().clone();
        blocking(move || storage.read(|txn| positions.position(txn, &participant, &currency))).await
    }

    /// Position ledger of a pair
    pub async fn position_changes(
        &self,
        participant: ParticipantId,
        currency: Currency,
    ) -> Result<Vec<PositionChange>> {
        let storage = self.storage.clone();
        let positions = self.machine.positions().clone();
        blocking(move || storage.read(|txn| positions.changes(txn, &participant, &currency))).await
    }

    /// Reconcile one pair; CORRUPTION on divergence
    pub async fn reconcile(&self, participant: ParticipantId, currency: Currency) -> Result<Decimal> {
        let storage = self.storage.clone();
        let positions = self.machine.positions().clone();
        blocking(move || storage.read(|txn| positions.reconcile(txn, &participant, &currency))).await
    }

    /// Reconcile every position
    pub async fn reconcile_all(&self) -> Result<Vec<ParticipantPosition>> {
        let storage = self.storage.clone();
        let positions = self.machine.positions().clone();
        blocking(move || storage.read(|txn| positions.reconcile_all(txn))).await
    }

    // Settlement windows

    /// Close a window; returns the new OPEN window
    pub async fn close_window(&self, window_id: WindowId, reason: Option<String>) -> Result<WindowId> {
        let windows = self.windows.clone();
        blocking(move || windows.close_window(window_id, reason, Utc::now())).await
    }

    /// CLOSED -> PENDING_SETTLEMENT
    pub async fn begin_settlement(&self, window_id: WindowId) -> Result<()> {
        let windows = self.windows.clone();
        blocking(move || windows.begin_settlement(window_id, Utc::now())).await
    }

    /// Settle a window; returns the number of transfers settled
    pub async fn settle_window(&self, window_id: WindowId) -> Result<usize> {
        let windows = self.windows.clone();
        blocking(move || windows.settle_window(window_id, Utc::now())).await
    }

    /// Record a failed settlement
    pub async fn abort_window(&self, window_id: WindowId, reason: impl Into<String>) -> Result<()> {
        let windows = self.windows.clone();
        let reason = reason.into();
        blocking(move || windows.abort_window(window_id, reason, Utc::now())).await
    }

    /// Window by id
    pub async fn get_window(&self, window_id: WindowId) -> Result<SettlementWindow> {
        let windows = self.windows.clone();
        blocking(move || windows.get_window(window_id)).await
    }

    /// Current OPEN window of a currency
    pub async fn open_window(&self, currency: Currency) -> Result<Option<SettlementWindow>> {
        let windows = self.windows.clone();
        blocking(move || windows.open_window(&currency)).await
    }

    /// Window state log
    pub async fn window_history(&self, window_id: WindowId) -> Result<Vec<WindowStateChange>> {
        let windows = self.windows.clone();
        blocking(move || windows.window_history(window_id)).await
    }

    /// Transfers of a window in commit order
    pub async fn window_transfers(&self, window_id: WindowId) -> Result<Vec<WindowTransfer>> {
        let windows = self.windows.clone();
        blocking(move || windows.window_transfers(window_id)).await
    }

    /// Windows currently in a state
    pub async fn windows_by_state(&self, state: WindowState) -> Result<Vec<SettlementWindow>> {
        let windows = self.windows.clone();
        blocking(move || windows.windows_by_state(state)).await
    }

    // Sweeper

    /// Run one sweep cycle now
    ///
    /// Goes through the background sweeper when it is running, so manual and
    /// periodic cycles never overlap within this instance.
    pub async fn sweep_now(&self) -> Result<SweepReport> {
        match &self.sweeper {
            Some(handle) => handle.sweep_now().await,
            None => {
                let machine = self.machine.clone();
                let batch_size = self.config.sweeper.batch_size;
                blocking(move || sweep_once(&machine, Utc::now(), batch_size)).await
            }
        }
    }

    /// Get metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Get configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop background tasks
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(handle) = &self.sweeper {
            // Already stopped is fine
            let _ = handle.shutdown().await;
        }

        let task = self.sweeper_task.lock().take();
        if let Some(task) = task {
            task.await
                .map_err(|e| Error::Concurrency(format!("Sweeper task failed: {}", e)))?;
        }

        tracing::info!("Ledger shut down");
        Ok(())
    }
}
