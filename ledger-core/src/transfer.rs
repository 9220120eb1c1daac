//! Transfer state machine
//!
//! ```text
//! RECEIVED -> RESERVED -> COMMITTED -> SETTLED
//!    |           |
//!    |           +------> ABORTED
//!    |           +------> EXPIRED
//!    +------------------> ABORTED (limit pre-check)
//! ```
//!
//! Every operation is one store transaction. The state change is appended
//! first and its side effects (positions, window assignment, timeout index,
//! error rows) are written in the same transaction, so no intermediate state
//! is ever observable.
//!
//! Lock order inside a transaction: transfer state pointer, then positions
//! in key order, then the open-window singleton.

use crate::config::AmountConfig;
use crate::crypto::payload_hash;
use crate::duplicate::{DuplicateDetector, DuplicateStatus};
use crate::metrics::Metrics;
use crate::position::{ApplyOutcome, LimitPolicy, PositionAccountant};
use crate::reference::ReferenceData;
use crate::storage::{LedgerTxn, Storage};
use crate::types::*;
use crate::window::WindowManager;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;

/// Error code recorded when the payee rejects a transfer
pub const PAYEE_REJECTED: u16 = 5104;

/// Outcome of one transaction body
enum Step<T> {
    /// State advanced
    Done(T),
    /// Failure persisted as a state change; surfaced after commit
    Rejected(Error),
    /// Identical resubmission; original outcome
    Replayed(Result<T>),
}

/// Transfer state machine
#[derive(Clone)]
pub struct TransferStateMachine {
    storage: Arc<Storage>,
    reference: Arc<dyn ReferenceData>,
    positions: PositionAccountant,
    windows: WindowManager,
    amount: AmountConfig,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for TransferStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferStateMachine")
            .field("amount", &self.amount)
            .finish_non_exhaustive()
    }
}

impl TransferStateMachine {
    /// Create state machine
    pub fn new(
        storage: Arc<Storage>,
        reference: Arc<dyn ReferenceData>,
        windows: WindowManager,
        amount: AmountConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            positions: PositionAccountant::new(reference.clone()),
            storage,
            reference,
            windows,
            amount,
            metrics,
        }
    }

    /// Position accountant used by this machine
    pub fn positions(&self) -> &PositionAccountant {
        &self.positions
    }

    // Validation

    fn validate_amount(&self, amount: Decimal) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(Error::Validation(format!("Amount must be positive, got {}", amount)));
        }

        let normalized = amount.normalize();
        if normalized.scale() > self.amount.scale {
            return Err(Error::Validation(format!(
                "Amount {} has more than {} decimal places",
                amount, self.amount.scale
            )));
        }

        let digits = normalized.mantissa().unsigned_abs().to_string().len() as u32;
        if digits > self.amount.precision {
            return Err(Error::Validation(format!(
                "Amount {} has more than {} significant digits",
                amount, self.amount.precision
            )));
        }

        Ok(())
    }

    fn validate_participant(&self, participant: &ParticipantId, currency: &Currency) -> Result<()> {
        match self.reference.participant(participant) {
            Some(p) if p.active => {}
            Some(_) => {
                return Err(Error::Validation(format!("Participant {} is inactive", participant)))
            }
            None => {
                return Err(Error::Validation(format!("Participant {} not found", participant)))
            }
        }

        match self.reference.account(participant, currency) {
            Some(account) if account.active => Ok(()),
            Some(_) => Err(Error::Validation(format!(
                "Participant {} {} account is inactive",
                participant, currency
            ))),
            None => Err(Error::Validation(format!(
                "Participant {} has no {} account",
                participant, currency
            ))),
        }
    }

    /// Business validation of a prepare request
    pub fn validate(&self, request: &TransferRequest, now: DateTime<Utc>) -> Result<()> {
        self.validate_amount(request.amount)?;

        if request.payer.same_fsp(&request.payee) {
            return Err(Error::Validation(format!(
                "Payer and payee are both {}",
                request.payer
            )));
        }

        if !self.reference.is_currency_active(&request.currency) {
            return Err(Error::Validation(format!(
                "Currency {} is not enabled",
                request.currency
            )));
        }

        self.validate_participant(&request.payer, &request.currency)?;
        self.validate_participant(&request.payee, &request.currency)?;

        request.condition.validate()?;

        if request.expiration <= now {
            return Err(Error::Validation(format!(
                "Expiration {} is not in the future",
                request.expiration
            )));
        }

        Ok(())
    }

    // Transaction helpers

    fn load(txn: &LedgerTxn<'_>, transfer_id: &TransferId) -> Result<TransferRecord> {
        txn.get_transfer(transfer_id)?.ok_or_else(|| {
            Error::Corruption(format!("State pointer without transfer row for {}", transfer_id))
        })
    }

    /// Lock the state pointer and require RESERVED
    fn reserved(txn: &LedgerTxn<'_>, transfer_id: &TransferId) -> Result<StatePointer> {
        let pointer = txn
            .state_for_update(transfer_id)?
            .ok_or(Error::NotFound(*transfer_id))?;

        if pointer.state != TransferState::Reserved {
            return Err(Error::AlreadyTerminal {
                transfer_id: *transfer_id,
                state: pointer.state,
            });
        }
        Ok(pointer)
    }

    /// Append a failure state change with its TransferError row
    fn record_failure(
        txn: &LedgerTxn<'_>,
        transfer_id: &TransferId,
        current: &StatePointer,
        state: TransferState,
        code: u16,
        description: String,
        now: DateTime<Utc>,
    ) -> Result<StateChange> {
        let change =
            txn.append_state_change(transfer_id, Some(current), state, now, Some(description.clone()))?;

        txn.put_transfer_error(&TransferErrorRecord {
            transfer_id: *transfer_id,
            state_change_sequence: change.sequence,
            code,
            description,
            created_at: change.changed_at,
        })?;

        Ok(change)
    }

    fn observe(&self, operation: &str, started: Instant) {
        self.metrics
            .record_operation(operation, started.elapsed().as_secs_f64());
    }

    // Operations

    /// Prepare a transfer
    ///
    /// On success the transfer is RESERVED with a scheduled timeout. A payer
    /// whose projected position would breach its cap gets the transfer
    /// recorded as ABORTED and LIMIT_EXCEEDED returned. Identical
    /// resubmissions replay the original outcome.
    pub fn prepare(&self, request: &TransferRequest, now: DateTime<Utc>) -> Result<TransferId> {
        let started = Instant::now();
        let transfer_id = request.transfer_id;
        let hash = request.payload_hash()?;

        let step = self.storage.transact(|txn| {
            match DuplicateDetector::PREPARE.check(txn, &transfer_id, &hash)? {
                DuplicateStatus::New => {}
                DuplicateStatus::DuplicateIdentical(record) => {
                    return Ok(Step::Replayed(record.replay(transfer_id)))
                }
                DuplicateStatus::DuplicateConflicting => {
                    return Err(Error::DuplicateConflict(transfer_id))
                }
            }

            self.validate(request, now)?;
            if txn.open_window(&request.currency)?.is_none() {
                return Err(Error::Validation(format!(
                    "Currency {} has no settlement window",
                    request.currency
                )));
            }

            let transfer = TransferRecord::from_request(request, now);
            txn.put_transfer(&transfer)?;
            let received = StatePointer::from(&txn.append_state_change(
                &transfer_id,
                None,
                TransferState::Received,
                now,
                None,
            )?);

            if let Some(err) =
                self.positions
                    .limit_breach(txn, &transfer.payer, &transfer.currency, transfer.amount)?
            {
                Self::record_failure(
                    txn,
                    &transfer_id,
                    &received,
                    TransferState::Aborted,
                    err.code(),
                    err.to_string(),
                    now,
                )?;
                DuplicateDetector::PREPARE.record(txn, &transfer_id, &hash, Some(err.clone()), now)?;
                return Ok(Step::Rejected(err));
            }

            txn.append_state_change(
                &transfer_id,
                Some(&received),
                TransferState::Reserved,
                now,
                None,
            )?;
            txn.put_timeout(&transfer_id, transfer.expiration)?;
            DuplicateDetector::PREPARE.record(txn, &transfer_id, &hash, None, now)?;

            Ok(Step::Done(transfer_id))
        });
        self.observe("prepare", started);

        match step? {
            Step::Done(id) => {
                self.metrics.transfers_prepared.inc();
                tracing::info!(
                    transfer_id = %id,
                    payer = %request.payer,
                    payee = %request.payee,
                    amount = %request.amount,
                    currency = %request.currency,
                    "Transfer reserved"
                );
                Ok(id)
            }
            Step::Rejected(err) => {
                self.metrics.transfers_aborted.inc();
                self.metrics.limit_rejections.inc();
                tracing::warn!(%transfer_id, error = %err, "Prepare rejected");
                Err(err)
            }
            Step::Replayed(outcome) => {
                self.metrics.duplicate_replays.inc();
                tracing::debug!(%transfer_id, ok = outcome.is_ok(), "Prepare replayed");
                outcome
            }
        }
    }

    /// Fulfil a RESERVED transfer
    ///
    /// On success the transfer is COMMITTED, positions move (payer debit,
    /// payee credit) and the transfer is assigned to the OPEN window of its
    /// currency. Returns the window id.
    pub fn fulfil(
        &self,
        transfer_id: &TransferId,
        fulfilment: &Fulfilment,
        now: DateTime<Utc>,
    ) -> Result<WindowId> {
        let started = Instant::now();
        let hash = payload_hash(fulfilment)?;

        let step = self.storage.transact(|txn| {
            let pointer = txn
                .state_for_update(transfer_id)?
                .ok_or(Error::NotFound(*transfer_id))?;

            match DuplicateDetector::FULFIL.check(txn, transfer_id, &hash)? {
                DuplicateStatus::New => {}
                DuplicateStatus::DuplicateIdentical(record) => {
                    let window_id = txn.transfer_window(transfer_id)?;
                    return Ok(Step::Replayed(record.replay(window_id).and_then(|window_id| {
                        window_id.ok_or_else(|| {
                            Error::Corruption(format!("Committed transfer {} has no window", transfer_id))
                        })
                    })));
                }
                DuplicateStatus::DuplicateConflicting => {
                    return Err(Error::AlreadyTerminal {
                        transfer_id: *transfer_id,
                        state: pointer.state,
                    })
                }
            }

            if pointer.state != TransferState::Reserved {
                return Err(Error::AlreadyTerminal {
                    transfer_id: *transfer_id,
                    state: pointer.state,
                });
            }

            let transfer = Self::load(txn, transfer_id)?;

            let failure = if now >= transfer.expiration {
                Some((TransferState::Expired, Error::Expired(*transfer_id)))
            } else if !fulfilment.matches(&transfer.condition) {
                Some((TransferState::Aborted, Error::ProofMismatch(*transfer_id)))
            } else {
                self.positions
                    .lock(txn, &[&transfer.payer, &transfer.payee], &transfer.currency)?;
                self.positions
                    .limit_breach(txn, &transfer.payer, &transfer.currency, transfer.amount)?
                    .map(|err| (TransferState::Aborted, err))
            };

            if let Some((state, err)) = failure {
                Self::record_failure(txn, transfer_id, &pointer, state, err.code(), err.to_string(), now)?;
                txn.delete_timeout(transfer_id, transfer.expiration)?;
                DuplicateDetector::FULFIL.record(txn, transfer_id, &hash, Some(err.clone()), now)?;
                return Ok(Step::Rejected(err));
            }

            let committed = txn.append_state_change(
                transfer_id,
                Some(&pointer),
                TransferState::Committed,
                now,
                None,
            )?;

            let debit = self.positions.apply_delta(
                txn,
                &transfer.payer,
                &transfer.currency,
                -transfer.amount,
                &committed,
                LimitPolicy::Enforce,
            )?;
            if let ApplyOutcome::LimitExceeded(err) = debit {
                // Position is locked and was checked above
                return Err(Error::Corruption(format!(
                    "Payer position moved under lock: {}",
                    err
                )));
            }
            self.positions.apply_delta(
                txn,
                &transfer.payee,
                &transfer.currency,
                transfer.amount,
                &committed,
                LimitPolicy::Skip,
            )?;

            let window_id = self.windows.assign(txn, &transfer, &committed)?;

            txn.put_fulfilment(
                transfer_id,
                &FulfilmentRecord {
                    fulfilment: fulfilment.clone(),
                    completed_at: committed.changed_at,
                },
            )?;
            txn.delete_timeout(transfer_id, transfer.expiration)?;
            DuplicateDetector::FULFIL.record(txn, transfer_id, &hash, None, now)?;

            Ok(Step::Done(window_id))
        });
        self.observe("fulfil", started);

        match step? {
            Step::Done(window_id) => {
                self.metrics.transfers_committed.inc();
                tracing::info!(%transfer_id, %window_id, "Transfer committed");
                Ok(window_id)
            }
            Step::Rejected(err) => {
                match err {
                    Error::Expired(_) => self.metrics.transfers_expired.inc(),
                    Error::LimitExceeded { .. } => {
                        self.metrics.limit_rejections.inc();
                        self.metrics.transfers_aborted.inc();
                    }
                    _ => self.metrics.transfers_aborted.inc(),
                }
                tracing::warn!(%transfer_id, error = %err, "Fulfil rejected");
                Err(err)
            }
            Step::Replayed(outcome) => {
                self.metrics.duplicate_replays.inc();
                tracing::debug!(%transfer_id, ok = outcome.is_ok(), "Fulfil replayed");
                outcome
            }
        }
    }

    /// Cancel a RESERVED transfer (payee rejection)
    pub fn abort(
        &self,
        transfer_id: &TransferId,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let reason = reason.into();

        self.storage.transact(|txn| {
            let pointer = Self::reserved(txn, transfer_id)?;
            let transfer = Self::load(txn, transfer_id)?;

            Self::record_failure(
                txn,
                transfer_id,
                &pointer,
                TransferState::Aborted,
                PAYEE_REJECTED,
                reason.clone(),
                now,
            )?;
            txn.delete_timeout(transfer_id, transfer.expiration)
        })?;

        self.metrics.transfers_aborted.inc();
        tracing::info!(%transfer_id, %reason, "Transfer aborted");
        Ok(())
    }

    /// Expire a RESERVED transfer whose expiration has passed
    pub fn expire(&self, transfer_id: &TransferId, now: DateTime<Utc>) -> Result<()> {
        self.storage.transact(|txn| {
            let pointer = Self::reserved(txn, transfer_id)?;
            let transfer = Self::load(txn, transfer_id)?;

            if now < transfer.expiration {
                return Err(Error::Validation(format!(
                    "Transfer {} expires at {}",
                    transfer_id, transfer.expiration
                )));
            }

            let err = Error::Expired(*transfer_id);
            Self::record_failure(
                txn,
                transfer_id,
                &pointer,
                TransferState::Expired,
                err.code(),
                err.to_string(),
                now,
            )?;
            txn.delete_timeout(transfer_id, transfer.expiration)
        })?;

        self.metrics.transfers_expired.inc();
        tracing::info!(%transfer_id, "Transfer expired");
        Ok(())
    }

    // Queries

    /// Transfer with its current state, fulfilment and window
    pub fn get_transfer(&self, transfer_id: &TransferId) -> Result<TransferView> {
        self.storage.read(|txn| {
            let transfer = txn
                .get_transfer(transfer_id)?
                .ok_or(Error::NotFound(*transfer_id))?;
            let pointer = txn.state(transfer_id)?.ok_or_else(|| {
                Error::Corruption(format!("Transfer {} has no state pointer", transfer_id))
            })?;

            Ok(TransferView {
                transfer,
                state: pointer.state,
                state_changed_at: pointer.changed_at,
                fulfilment: txn.get_fulfilment(transfer_id)?,
                window_id: txn.transfer_window(transfer_id)?,
            })
        })
    }

    /// Full state log
    pub fn state_history(&self, transfer_id: &TransferId) -> Result<Vec<StateChange>> {
        let history = self.storage.read(|txn| txn.state_history(transfer_id))?;
        if history.is_empty() {
            return Err(Error::NotFound(*transfer_id));
        }
        Ok(history)
    }

    /// Recorded terminal failures
    pub fn transfer_errors(&self, transfer_id: &TransferId) -> Result<Vec<TransferErrorRecord>> {
        self.storage.read(|txn| txn.transfer_errors(transfer_id))
    }

    /// Recompute the state pointer from the log and compare
    pub fn verify_state_pointer(&self, transfer_id: &TransferId) -> Result<StatePointer> {
        let (pointer, history) = self
            .storage
            .read(|txn| Ok((txn.state(transfer_id)?, txn.state_history(transfer_id)?)))?;

        let Some(last) = history.last() else {
            return match pointer {
                Some(_) => Err(Error::Corruption(format!(
                    "Transfer {} has a state pointer but no log",
                    transfer_id
                ))),
                None => Err(Error::NotFound(*transfer_id)),
            };
        };

        for (expected, pair) in history.windows(2).enumerate() {
            let valid = pair[0].sequence == expected as u32
                && pair[1].sequence == pair[0].sequence + 1
                && pair[1].changed_at >= pair[0].changed_at
                && pair[0].state.can_transition_to(pair[1].state);
            if !valid {
                return Err(Error::Corruption(format!(
                    "Transfer {} log is inconsistent at sequence {}",
                    transfer_id, pair[1].sequence
                )));
            }
        }

        let derived = StatePointer::from(last);
        if pointer.as_ref() != Some(&derived) {
            tracing::error!(%transfer_id, ?pointer, ?derived, "State pointer drift");
            return Err(Error::Corruption(format!(
                "Transfer {} state pointer does not match its log",
                transfer_id
            )));
        }

        Ok(derived)
    }

    /// Classify a prepare request without submitting it
    pub fn check_duplicate(&self, request: &TransferRequest) -> Result<DuplicateStatus> {
        let hash = request.payload_hash()?;
        self.storage
            .read(|txn| DuplicateDetector::PREPARE.peek(txn, &request.transfer_id, &hash))
    }

    /// RESERVED transfers whose expiration is at or before `now`
    pub fn due_timeouts(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TransferId>> {
        self.storage.read(|txn| txn.due_timeouts(now, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::StaticReferenceData;
    use crate::Config;
    use chrono::Duration;
    use tempfile::TempDir;

    struct Harness {
        machine: TransferStateMachine,
        reference: Arc<StaticReferenceData>,
        _temp: TempDir,
    }

    fn usd() -> Currency {
        Currency::from_code("USD").unwrap()
    }

    fn harness() -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let storage = Arc::new(Storage::open(&config).unwrap());
        let reference = Arc::new(
            StaticReferenceData::new()
                .with_participant("dfsp1", &usd(), Decimal::from(1000))
                .with_participant("dfsp2", &usd(), Decimal::from(1000)),
        );
        let metrics = Arc::new(Metrics::new().unwrap());
        let windows = WindowManager::new(
            storage.clone(),
            PositionAccountant::new(reference.clone()),
            metrics.clone(),
        );
        windows.ensure_open(&usd(), Utc::now()).unwrap();

        let machine = TransferStateMachine::new(
            storage,
            reference.clone(),
            windows,
            config.amount.clone(),
            metrics,
        );

        Harness {
            machine,
            reference,
            _temp: temp_dir,
        }
    }

    fn request(amount: i64, fulfilment: &Fulfilment) -> TransferRequest {
        TransferRequest {
            transfer_id: TransferId::new(),
            payer: ParticipantId::new("dfsp1"),
            payee: ParticipantId::new("dfsp2"),
            amount: Decimal::from(amount),
            currency: usd(),
            condition: fulfilment.condition().unwrap(),
            expiration: Utc::now() + Duration::minutes(5),
        }
    }

    fn position(h: &Harness, participant: &str) -> Decimal {
        h.machine
            .storage
            .read(|txn| h.machine.positions.position(txn, &participant.into(), &usd()))
            .unwrap()
            .value
    }

    #[test]
    fn test_prepare_reserves() {
        let h = harness();
        let req = request(100, &Fulfilment::random());

        let id = h.machine.prepare(&req, Utc::now()).unwrap();
        let view = h.machine.get_transfer(&id).unwrap();
        assert_eq!(view.state, TransferState::Reserved);
        assert!(view.window_id.is_none());

        let states: Vec<_> = h.machine.state_history(&id).unwrap().iter().map(|c| c.state).collect();
        assert_eq!(states, vec![TransferState::Received, TransferState::Reserved]);
        assert_eq!(h.machine.due_timeouts(req.expiration, 10).unwrap(), vec![id]);

        // Prepare alone does not move positions
        assert_eq!(position(&h, "dfsp1"), Decimal::ZERO);
    }

    #[test]
    fn test_validation_rejects_and_persists_nothing() {
        let h = harness();
        let fulfilment = Fulfilment::random();

        let mut zero = request(0, &fulfilment);
        zero.amount = Decimal::ZERO;
        let mut fine_grained = request(1, &fulfilment);
        fine_grained.amount = Decimal::new(123456, 5);
        let mut same = request(10, &fulfilment);
        same.payee = ParticipantId::new("DFSP1");
        let mut unknown = request(10, &fulfilment);
        unknown.payee = ParticipantId::new("dfsp9");
        let mut euro = request(10, &fulfilment);
        euro.currency = Currency::from_code("EUR").unwrap();
        let mut stale = request(10, &fulfilment);
        stale.expiration = Utc::now() - Duration::seconds(1);
        let mut bad_condition = request(10, &fulfilment);
        bad_condition.condition = Condition("abc".into());

        for req in [zero, fine_grained, same, unknown, euro, stale, bad_condition] {
            let result = h.machine.prepare(&req, Utc::now());
            assert!(matches!(result, Err(Error::Validation(_))), "{:?}", req);
            assert!(matches!(
                h.machine.get_transfer(&req.transfer_id),
                Err(Error::NotFound(_))
            ));
        }
    }

    #[test]
    fn test_inactive_participant_is_rejected() {
        let h = harness();
        h.reference.set_participant_active(&"dfsp2".into(), false);

        let result = h.machine.prepare(&request(10, &Fulfilment::random()), Utc::now());
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_duplicate_replay_and_conflict() {
        let h = harness();
        let req = request(100, &Fulfilment::random());

        let id = h.machine.prepare(&req, Utc::now()).unwrap();
        assert_eq!(h.machine.prepare(&req, Utc::now()).unwrap(), id);
        assert_eq!(h.machine.state_history(&id).unwrap().len(), 2);

        let mut changed = req.clone();
        changed.amount = Decimal::from(101);
        assert_eq!(
            h.machine.prepare(&changed, Utc::now()),
            Err(Error::DuplicateConflict(id))
        );
        assert_eq!(h.machine.get_transfer(&id).unwrap().transfer.amount, Decimal::from(100));
    }

    #[test]
    fn test_fulfil_commits_and_assigns_window() {
        let h = harness();
        let fulfilment = Fulfilment::random();
        let id = h.machine.prepare(&request(400, &fulfilment), Utc::now()).unwrap();

        let window_id = h.machine.fulfil(&id, &fulfilment, Utc::now()).unwrap();

        let view = h.machine.get_transfer(&id).unwrap();
        assert_eq!(view.state, TransferState::Committed);
        assert_eq!(view.window_id, Some(window_id));
        assert_eq!(view.fulfilment.unwrap().fulfilment, fulfilment);
        assert_eq!(position(&h, "dfsp1"), Decimal::from(-400));
        assert_eq!(position(&h, "dfsp2"), Decimal::from(400));
        assert!(h.machine.due_timeouts(Utc::now() + Duration::hours(1), 10).unwrap().is_empty());
        h.machine.verify_state_pointer(&id).unwrap();
    }

    #[test]
    fn test_fulfil_replay_does_not_move_positions() {
        let h = harness();
        let fulfilment = Fulfilment::random();
        let id = h.machine.prepare(&request(50, &fulfilment), Utc::now()).unwrap();

        let window_id = h.machine.fulfil(&id, &fulfilment, Utc::now()).unwrap();
        assert_eq!(h.machine.fulfil(&id, &fulfilment, Utc::now()).unwrap(), window_id);
        assert_eq!(position(&h, "dfsp1"), Decimal::from(-50));

        let other = Fulfilment::random();
        assert!(matches!(
            h.machine.fulfil(&id, &other, Utc::now()),
            Err(Error::AlreadyTerminal { state: TransferState::Committed, .. })
        ));
    }

    #[test]
    fn test_proof_mismatch_aborts() {
        let h = harness();
        let id = h.machine.prepare(&request(10, &Fulfilment::random()), Utc::now()).unwrap();
        let wrong = Fulfilment::random();

        assert_eq!(h.machine.fulfil(&id, &wrong, Utc::now()), Err(Error::ProofMismatch(id)));
        // Same bad proof again replays the outcome
        assert_eq!(h.machine.fulfil(&id, &wrong, Utc::now()), Err(Error::ProofMismatch(id)));

        assert_eq!(h.machine.get_transfer(&id).unwrap().state, TransferState::Aborted);
        let errors = h.machine.transfer_errors(&id).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, 5105);
        assert_eq!(errors[0].state_change_sequence, 2);
        assert_eq!(position(&h, "dfsp1"), Decimal::ZERO);
    }

    #[test]
    fn test_fulfil_after_expiry_records_expired() {
        let h = harness();
        let fulfilment = Fulfilment::random();
        let req = request(10, &fulfilment);
        let id = h.machine.prepare(&req, Utc::now()).unwrap();

        let late = req.expiration + Duration::seconds(1);
        assert_eq!(h.machine.fulfil(&id, &fulfilment, late), Err(Error::Expired(id)));
        assert_eq!(h.machine.get_transfer(&id).unwrap().state, TransferState::Expired);
        assert_eq!(h.machine.transfer_errors(&id).unwrap()[0].code, 3303);
        assert!(h.machine.due_timeouts(late, 10).unwrap().is_empty());
    }

    #[test]
    fn test_limit_exceeded_at_prepare_is_recorded() {
        let h = harness();
        let req = request(1001, &Fulfilment::random());

        let result = h.machine.prepare(&req, Utc::now());
        assert!(matches!(result, Err(Error::LimitExceeded { .. })));
        // Replay returns the same outcome
        assert_eq!(h.machine.prepare(&req, Utc::now()), result);

        let view = h.machine.get_transfer(&req.transfer_id).unwrap();
        assert_eq!(view.state, TransferState::Aborted);
        assert_eq!(h.machine.transfer_errors(&req.transfer_id).unwrap()[0].code, 4001);
        assert!(h.machine.due_timeouts(req.expiration, 10).unwrap().is_empty());
    }

    #[test]
    fn test_limit_exceeded_at_fulfil_leaves_positions() {
        let h = harness();
        let first = Fulfilment::random();
        let second = Fulfilment::random();

        // Both fit individually at prepare time
        let a = h.machine.prepare(&request(900, &first), Utc::now()).unwrap();
        let b = h.machine.prepare(&request(200, &second), Utc::now()).unwrap();
        h.machine.fulfil(&a, &first, Utc::now()).unwrap();

        let result = h.machine.fulfil(&b, &second, Utc::now());
        assert!(matches!(
            result,
            Err(Error::LimitExceeded { position, .. }) if position == Decimal::from(-900)
        ));
        assert_eq!(position(&h, "dfsp1"), Decimal::from(-900));
        assert_eq!(h.machine.get_transfer(&b).unwrap().state, TransferState::Aborted);
    }

    #[test]
    fn test_abort_and_already_terminal() {
        let h = harness();
        let fulfilment = Fulfilment::random();
        let id = h.machine.prepare(&request(10, &fulfilment), Utc::now()).unwrap();

        h.machine.abort(&id, "payee declined", Utc::now()).unwrap();
        assert_eq!(h.machine.transfer_errors(&id).unwrap()[0].code, PAYEE_REJECTED);

        assert!(matches!(
            h.machine.fulfil(&id, &fulfilment, Utc::now()),
            Err(Error::AlreadyTerminal { state: TransferState::Aborted, .. })
        ));
        assert!(matches!(
            h.machine.abort(&id, "again", Utc::now()),
            Err(Error::AlreadyTerminal { .. })
        ));
    }

    #[test]
    fn test_unknown_transfer() {
        let h = harness();
        let id = TransferId::new();

        assert_eq!(h.machine.fulfil(&id, &Fulfilment::random(), Utc::now()), Err(Error::NotFound(id)));
        assert_eq!(h.machine.expire(&id, Utc::now()), Err(Error::NotFound(id)));
        assert_eq!(h.machine.verify_state_pointer(&id), Err(Error::NotFound(id)));
    }

    #[test]
    fn test_expire_requires_passed_deadline() {
        let h = harness();
        let req = request(10, &Fulfilment::random());
        let id = h.machine.prepare(&req, Utc::now()).unwrap();

        assert!(matches!(h.machine.expire(&id, Utc::now()), Err(Error::Validation(_))));
        h.machine.expire(&id, req.expiration).unwrap();
        assert!(matches!(
            h.machine.expire(&id, req.expiration),
            Err(Error::AlreadyTerminal { state: TransferState::Expired, .. })
        ));
    }

    #[test]
    fn test_check_duplicate_is_read_only() {
        let h = harness();
        let req = request(10, &Fulfilment::random());

        assert_eq!(h.machine.check_duplicate(&req).unwrap(), DuplicateStatus::New);
        assert!(h.machine.get_transfer(&req.transfer_id).is_err());

        h.machine.prepare(&req, Utc::now()).unwrap();
        assert!(matches!(
            h.machine.check_duplicate(&req).unwrap(),
            DuplicateStatus::DuplicateIdentical(_)
        ));
    }
}
