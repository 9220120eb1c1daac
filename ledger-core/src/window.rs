//! Settlement window management
//!
//! Each settlement scope (a currency) has exactly one OPEN window at a time,
//! stored as a singleton row in `open_windows`. Committing transfers lock
//! that row to assign themselves; closing a window locks it to swap in the
//! next window, so assignment and close are serialized by the store.
//!
//! Window lifecycle:
//!
//! ```text
//! OPEN -> CLOSED -> PENDING_SETTLEMENT -> SETTLED
//!           |               |
//!           +---> ABORTED <-+
//!                    |
//!                    +--> PENDING_SETTLEMENT (retry)
//! ```

use crate::metrics::Metrics;
use crate::position::{LimitPolicy, PositionAccountant};
use crate::storage::{LedgerTxn, Storage};
use crate::types::{
    Currency, ParticipantId, SettlementWindow, StateChange, TransferRecord, TransferState,
    WindowId, WindowState, WindowStateChange, WindowTransfer,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Settlement window manager
#[derive(Debug, Clone)]
pub struct WindowManager {
    storage: Arc<Storage>,
    positions: PositionAccountant,
    metrics: Arc<Metrics>,
}

impl WindowManager {
    /// Create window manager
    pub fn new(storage: Arc<Storage>, positions: PositionAccountant, metrics: Arc<Metrics>) -> Self {
        Self {
            storage,
            positions,
            metrics,
        }
    }

    fn create_window(
        &self,
        txn: &LedgerTxn<'_>,
        currency: &Currency,
        now: DateTime<Utc>,
    ) -> Result<WindowId> {
        let window = SettlementWindow {
            window_id: txn.next_window_id()?,
            currency: currency.clone(),
            state: WindowState::Open,
            created_at: now,
            changed_at: now,
            reason: None,
        };

        txn.put_window_state(&window)?;
        txn.set_open_window(currency, window.window_id)?;

        tracing::info!(window_id = %window.window_id, currency = %currency, "Opened settlement window");
        Ok(window.window_id)
    }

    fn transition(
        txn: &LedgerTxn<'_>,
        mut window: SettlementWindow,
        state: WindowState,
        now: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<SettlementWindow> {
        window.state = state;
        window.changed_at = now.max(window.changed_at);
        window.reason = reason;
        txn.put_window_state(&window)?;
        Ok(window)
    }

    fn locked_window(txn: &LedgerTxn<'_>, window_id: WindowId) -> Result<SettlementWindow> {
        txn.window_for_update(window_id)?
            .ok_or(Error::WindowNotFound(window_id))
    }

    /// Assign a transfer to the OPEN window of its currency
    ///
    /// Runs inside the transaction that appends the COMMITTED state change.
    pub fn assign(
        &self,
        txn: &LedgerTxn<'_>,
        transfer: &TransferRecord,
        committed: &StateChange,
    ) -> Result<WindowId> {
        let window_id = txn
            .open_window_for_update(&transfer.currency)?
            .ok_or_else(|| Error::NoOpenWindow(transfer.currency.clone()))?;

        match txn.get_window(window_id)? {
            Some(window) if window.state == WindowState::Open => {}
            _ => {
                return Err(Error::Corruption(format!(
                    "Open window pointer for {} references non-open window {}",
                    transfer.currency, window_id
                )))
            }
        }

        txn.put_assignment(
            window_id,
            &WindowTransfer {
                transfer_id: transfer.transfer_id,
                committed_at: committed.changed_at,
            },
        )?;

        Ok(window_id)
    }

    /// Create the first OPEN window of a scope if there is none
    pub fn ensure_open(&self, currency: &Currency, now: DateTime<Utc>) -> Result<WindowId> {
        self.storage.transact(|txn| match txn.open_window_for_update(currency)? {
            Some(window_id) => Ok(window_id),
            None => self.create_window(txn, currency, now),
        })
    }

    /// Close an OPEN window and open its successor atomically
    ///
    /// Returns the id of the new OPEN window.
    pub fn close_window(
        &self,
        window_id: WindowId,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<WindowId> {
        let next = self.storage.transact(|txn| {
            let currency = txn
                .get_window(window_id)?
                .ok_or(Error::WindowNotFound(window_id))?
                .currency;

            // Singleton before window row, same order as assign
            let open = txn.open_window_for_update(&currency)?;
            let window = Self::locked_window(txn, window_id)?;

            if window.state != WindowState::Open || open != Some(window_id) {
                return Err(Error::InvalidWindowState {
                    window_id,
                    state: window.state,
                    expected: WindowState::Open.to_string(),
                });
            }

            Self::transition(txn, window, WindowState::Closed, now, reason.clone())?;
            self.create_window(txn, &currency, now)
        })?;

        self.metrics.record_window("closed");
        tracing::info!(%window_id, next_window_id = %next, "Closed settlement window");
        Ok(next)
    }

    /// CLOSED -> PENDING_SETTLEMENT (settlement acknowledged)
    pub fn begin_settlement(&self, window_id: WindowId, now: DateTime<Utc>) -> Result<()> {
        self.storage.transact(|txn| {
            let window = Self::locked_window(txn, window_id)?;
            if window.state != WindowState::Closed {
                return Err(Error::InvalidWindowState {
                    window_id,
                    state: window.state,
                    expected: WindowState::Closed.to_string(),
                });
            }
            Self::transition(txn, window, WindowState::PendingSettlement, now, None)?;
            Ok(())
        })?;

        tracing::info!(%window_id, "Settlement window pending settlement");
        Ok(())
    }

    /// Settle a window and every transfer in it
    ///
    /// Accepts CLOSED, PENDING_SETTLEMENT or ABORTED (retry). Each COMMITTED
    /// transfer gets a SETTLED state change in commit order, and each SETTLED
    /// change discharges the transfer's position effect. Returns the number
    /// of transfers settled.
    pub fn settle_window(&self, window_id: WindowId, now: DateTime<Utc>) -> Result<usize> {
        let settled = self.storage.transact(|txn| {
            let mut window = Self::locked_window(txn, window_id)?;
            match window.state {
                WindowState::Closed | WindowState::Aborted => {
                    window =
                        Self::transition(txn, window, WindowState::PendingSettlement, now, None)?;
                }
                WindowState::PendingSettlement => {}
                state => {
                    return Err(Error::InvalidWindowState {
                        window_id,
                        state,
                        expected: "CLOSED, PENDING_SETTLEMENT or ABORTED".to_string(),
                    })
                }
            }

            // Transfer pointers first, then positions
            let mut batch = Vec::new();
            for entry in txn.window_transfers(window_id)? {
                let pointer = txn.state_for_update(&entry.transfer_id)?.ok_or_else(|| {
                    Error::Corruption(format!(
                        "Window {} references unknown transfer {}",
                        window_id, entry.transfer_id
                    ))
                })?;
                if pointer.state != TransferState::Committed {
                    return Err(Error::Corruption(format!(
                        "Transfer {} in window {} is {}, expected COMMITTED",
                        entry.transfer_id, window_id, pointer.state
                    )));
                }
                let transfer = txn.get_transfer(&entry.transfer_id)?.ok_or_else(|| {
                    Error::Corruption(format!("Transfer row missing for {}", entry.transfer_id))
                })?;
                batch.push((transfer, pointer));
            }

            let participants: Vec<&ParticipantId> = batch
                .iter()
                .flat_map(|(transfer, _)| [&transfer.payer, &transfer.payee])
                .collect();
            self.positions.lock(txn, &participants, &window.currency)?;

            let reason = format!("Settlement window {} settled", window_id);
            for (transfer, pointer) in &batch {
                let settled = txn.append_state_change(
                    &transfer.transfer_id,
                    Some(pointer),
                    TransferState::Settled,
                    now,
                    Some(reason.clone()),
                )?;

                // Discharge: reverse the COMMITTED effect
                self.positions.apply_delta(
                    txn,
                    &transfer.payer,
                    &transfer.currency,
                    transfer.amount,
                    &settled,
                    LimitPolicy::Skip,
                )?;
                self.positions.apply_delta(
                    txn,
                    &transfer.payee,
                    &transfer.currency,
                    -transfer.amount,
                    &settled,
                    LimitPolicy::Skip,
                )?;
            }

            Self::transition(txn, window, WindowState::Settled, now, None)?;
            Ok(batch.len())
        })?;

        self.metrics.record_window("settled");
        self.metrics.transfers_settled.inc_by(settled as u64);
        tracing::info!(%window_id, transfers = settled, "Settled settlement window");
        Ok(settled)
    }

    /// Mark a failed settlement; the window can be settled again later
    pub fn abort_window(
        &self,
        window_id: WindowId,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let reason = reason.into();
        self.storage.transact(|txn| {
            let window = Self::locked_window(txn, window_id)?;
            match window.state {
                WindowState::Closed | WindowState::PendingSettlement => {
                    Self::transition(txn, window, WindowState::Aborted, now, Some(reason.clone()))?;
                    Ok(())
                }
                state => Err(Error::InvalidWindowState {
                    window_id,
                    state,
                    expected: "CLOSED or PENDING_SETTLEMENT".to_string(),
                }),
            }
        })?;

        self.metrics.record_window("aborted");
        tracing::warn!(%window_id, %reason, "Settlement window aborted");
        Ok(())
    }

    /// Window by id
    pub fn get_window(&self, window_id: WindowId) -> Result<SettlementWindow> {
        self.storage
            .read(|txn| txn.get_window(window_id))?
            .ok_or(Error::WindowNotFound(window_id))
    }

    /// Current OPEN window of a scope
    pub fn open_window(&self, currency: &Currency) -> Result<Option<SettlementWindow>> {
        self.storage.read(|txn| match txn.open_window(currency)? {
            Some(window_id) => txn.get_window(window_id),
            None => Ok(None),
        })
    }

    /// Window state log
    pub fn window_history(&self, window_id: WindowId) -> Result<Vec<WindowStateChange>> {
        self.storage.read(|txn| txn.window_history(window_id))
    }

    /// Transfers of a window in commit order
    pub fn window_transfers(&self, window_id: WindowId) -> Result<Vec<WindowTransfer>> {
        self.storage.read(|txn| txn.window_transfers(window_id))
    }

    /// All windows currently in a state, oldest first
    pub fn windows_by_state(&self, state: WindowState) -> Result<Vec<SettlementWindow>> {
        Ok(self
            .storage
            .read(|txn| txn.all_windows())?
            .into_iter()
            .filter(|window| window.state == state)
            .collect())
    }
}
