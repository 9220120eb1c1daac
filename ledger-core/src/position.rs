//! Participant net positions
//!
//! A position is the signed net value of one participant in one currency.
//! Payers go negative. Every change is applied through [`PositionAccountant::apply_delta`]
//! inside the caller's store transaction, which writes the new value, the
//! ledger entry and the per-state-change guard together.

use crate::reference::ReferenceData;
use crate::storage::{keys, LedgerTxn};
use crate::types::{
    Currency, ParticipantId, ParticipantPosition, PositionChange, PositionRecord, StateChange,
};
use crate::{Error, Result};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

/// Whether a delta is checked against the net debit cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitPolicy {
    /// Debits may not push the position below `-net_debit_cap`
    Enforce,
    /// Settlement discharge and credits
    Skip,
}

/// Result of applying a delta
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Delta applied
    Applied(PositionChange),

    /// Debit refused, nothing written
    LimitExceeded(Error),
}

/// Position accountant
#[derive(Clone)]
pub struct PositionAccountant {
    reference: Arc<dyn ReferenceData>,
}

impl std::fmt::Debug for PositionAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionAccountant").finish_non_exhaustive()
    }
}

impl PositionAccountant {
    /// Create accountant over the given reference data
    pub fn new(reference: Arc<dyn ReferenceData>) -> Self {
        Self { reference }
    }

    fn net_debit_cap(&self, participant: &ParticipantId, currency: &Currency) -> Result<Decimal> {
        self.reference
            .account(participant, currency)
            .map(|account| account.net_debit_cap)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "Participant {} has no {} position account",
                    participant, currency
                ))
            })
    }

    /// Lock the positions of several participants in key order
    ///
    /// Callers that touch more than one position must lock them all through
    /// here before the first `apply_delta`.
    pub fn lock(
        &self,
        txn: &LedgerTxn<'_>,
        participants: &[&ParticipantId],
        currency: &Currency,
    ) -> Result<()> {
        let mut position_keys: Vec<Vec<u8>> = participants
            .iter()
            .map(|participant| keys::position(participant, currency))
            .collect();
        position_keys.sort();
        position_keys.dedup();

        for key in &position_keys {
            txn.position_for_update(key)?;
        }
        Ok(())
    }

    /// Would debiting `amount` breach the participant's cap
    ///
    /// Returns the LIMIT_EXCEEDED error to surface, or `None` when the
    /// projected position stays within the cap.
    pub fn limit_breach(
        &self,
        txn: &LedgerTxn<'_>,
        participant: &ParticipantId,
        currency: &Currency,
        amount: Decimal,
    ) -> Result<Option<Error>> {
        let key = keys::position(participant, currency);
        let current = txn
            .position_for_update(&key)?
            .map(|record| record.value)
            .unwrap_or(Decimal::ZERO);
        let net_debit_cap = self.net_debit_cap(participant, currency)?;

        if current - amount < -net_debit_cap {
            return Ok(Some(Error::LimitExceeded {
                participant: participant.clone(),
                currency: currency.clone(),
                position: current,
                amount,
                net_debit_cap,
            }));
        }
        Ok(None)
    }

    /// Apply a signed delta triggered by a transfer state change
    pub fn apply_delta(
        &self,
        txn: &LedgerTxn<'_>,
        participant: &ParticipantId,
        currency: &Currency,
        delta: Decimal,
        trigger: &StateChange,
        policy: LimitPolicy,
    ) -> Result<ApplyOutcome> {
        let key = keys::position(participant, currency);

        if txn.position_change_ref(&trigger.change_id, &key)?.is_some() {
            tracing::error!(
                participant = %participant,
                currency = %currency,
                state_change_id = %trigger.change_id,
                "Position already updated for this state change"
            );
            return Err(Error::Corruption(format!(
                "Position {}/{} already updated for state change {}",
                participant, currency, trigger.change_id
            )));
        }

        let mut record = txn
            .position_for_update(&key)?
            .unwrap_or_else(|| PositionRecord::zero(trigger.changed_at));

        if policy == LimitPolicy::Enforce && delta.is_sign_negative() {
            let net_debit_cap = self.net_debit_cap(participant, currency)?;
            if record.value + delta < -net_debit_cap {
                return Ok(ApplyOutcome::LimitExceeded(Error::LimitExceeded {
                    participant: participant.clone(),
                    currency: currency.clone(),
                    position: record.value,
                    amount: -delta,
                    net_debit_cap,
                }));
            }
        }

        let change = PositionChange {
            change_id: Uuid::now_v7(),
            sequence: record.change_count,
            participant: participant.clone(),
            currency: currency.clone(),
            transfer_id: trigger.transfer_id,
            state_change_id: trigger.change_id,
            delta,
            value: record.value + delta,
            changed_at: trigger.changed_at,
        };

        record.value = change.value;
        record.change_count += 1;
        record.last_change_id = Some(change.change_id);
        record.updated_at = change.changed_at;

        txn.put_position(&key, &record)?;
        txn.append_position_change(&key, &change)?;

        Ok(ApplyOutcome::Applied(change))
    }

    /// Current position (zero when never touched)
    pub fn position(
        &self,
        txn: &LedgerTxn<'_>,
        participant: &ParticipantId,
        currency: &Currency,
    ) -> Result<ParticipantPosition> {
        let record = txn.position(&keys::position(participant, currency))?;

        Ok(ParticipantPosition {
            participant: participant.clone(),
            currency: currency.clone(),
            value: record.as_ref().map(|r| r.value).unwrap_or(Decimal::ZERO),
            updated_at: record.map(|r| r.updated_at).unwrap_or_default(),
        })
    }

    /// Position ledger of one pair, in application order
    pub fn changes(
        &self,
        txn: &LedgerTxn<'_>,
        participant: &ParticipantId,
        currency: &Currency,
    ) -> Result<Vec<PositionChange>> {
        txn.position_changes(&keys::position(participant, currency))
    }

    /// Check that the ledger of one pair sums to its stored value
    pub fn reconcile(
        &self,
        txn: &LedgerTxn<'_>,
        participant: &ParticipantId,
        currency: &Currency,
    ) -> Result<Decimal> {
        let key = keys::position(participant, currency);
        let stored = txn.position(&key)?;
        let changes = txn.position_changes(&key)?;
        let sum: Decimal = changes.iter().map(|change| change.delta).sum();

        let value = stored.as_ref().map(|r| r.value).unwrap_or(Decimal::ZERO);
        if value != sum {
            tracing::error!(
                participant = %participant,
                currency = %currency,
                %value,
                %sum,
                "Position does not reconcile"
            );
            return Err(Error::Corruption(format!(
                "Position {}/{} is {} but its changes sum to {}",
                participant, currency, value, sum
            )));
        }

        let last = changes.last().map(|change| change.change_id);
        if stored.and_then(|r| r.last_change_id) != last {
            return Err(Error::Corruption(format!(
                "Position {}/{} last change pointer is stale",
                participant, currency
            )));
        }

        Ok(value)
    }

    /// Reconcile every stored position
    pub fn reconcile_all(&self, txn: &LedgerTxn<'_>) -> Result<Vec<ParticipantPosition>> {
        let mut positions = Vec::new();
        for (participant, currency, record) in txn.all_positions()? {
            let value = self.reconcile(txn, &participant, &currency)?;
            positions.push(ParticipantPosition {
                participant,
                currency,
                value,
                updated_at: record.updated_at,
            });
        }
        Ok(positions)
    }
}
