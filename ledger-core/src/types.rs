//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode for rows, JSON for request hashing)
//! - Exact arithmetic (Decimal for money)
//! - Cheap key encoding (fixed-width ids)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Caller-supplied transfer identifier, also the idempotency key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId(Uuid);

impl TransferId {
    /// Fresh random transfer id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Raw 16-byte key form
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Rebuild from a key slice
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Uuid::from_slice(bytes).ok().map(Self)
    }

    /// Inner UUID
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TransferId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for TransferId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Participant (FSP) identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Create new participant ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// FSP names compare case-insensitively for the payer != payee rule
    pub fn same_fsp(&self, other: &ParticipantId) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// ISO 4217 alphabetic currency code
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    /// Parse from string; `None` unless exactly three upper-case ASCII letters
    pub fn from_code(code: &str) -> Option<Self> {
        if code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase()) {
            Some(Self(code.to_string()))
        } else {
            None
        }
    }

    /// ISO 4217 code
    pub fn code(&self) -> &str {
        &self.0
    }
}

impl FromStr for Currency {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::from_code(s)
            .ok_or_else(|| crate::Error::Validation(format!("Invalid currency code '{}'", s)))
    }
}

impl TryFrom<String> for Currency {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        value.parse()
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ILP condition: unpadded base64url of SHA-256(preimage)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Condition(pub String);

/// ILP fulfilment: unpadded base64url of the 32-byte preimage
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fulfilment(pub String);

/// Inbound prepare request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Transfer id (idempotency key)
    pub transfer_id: TransferId,

    /// Paying participant
    pub payer: ParticipantId,

    /// Receiving participant
    pub payee: ParticipantId,

    /// Amount (exact decimal, must be positive)
    pub amount: Decimal,

    /// Currency
    pub currency: Currency,

    /// Hash-lock the payee must open
    pub condition: Condition,

    /// Deadline for fulfilment
    pub expiration: DateTime<Utc>,
}

/// Stored transfer (immutable after creation)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Transfer id
    pub transfer_id: TransferId,

    /// Paying participant
    pub payer: ParticipantId,

    /// Receiving participant
    pub payee: ParticipantId,

    /// Amount
    pub amount: Decimal,

    /// Currency
    pub currency: Currency,

    /// ILP condition
    pub condition: Condition,

    /// Fulfilment deadline
    pub expiration: DateTime<Utc>,

    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

impl TransferRecord {
    /// Build the stored row from a validated request
    pub fn from_request(request: &TransferRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            transfer_id: request.transfer_id,
            payer: request.payer.clone(),
            payee: request.payee.clone(),
            amount: request.amount,
            currency: request.currency.clone(),
            condition: request.condition.clone(),
            expiration: request.expiration,
            created_at,
        }
    }
}

/// Transfer lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransferState {
    /// Prepare accepted for processing
    Received = 1,
    /// Validated, waiting for fulfilment
    Reserved = 2,
    /// Fulfilled, positions moved
    Committed = 3,
    /// Rejected or cancelled (terminal)
    Aborted = 4,
    /// Window settled (terminal)
    Settled = 5,
    /// Not fulfilled in time (terminal)
    Expired = 6,
}

impl TransferState {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Aborted | TransferState::Settled | TransferState::Expired
        )
    }

    /// Allowed lifecycle edges
    pub fn can_transition_to(&self, next: TransferState) -> bool {
        use TransferState::*;

        matches!(
            (self, next),
            (Received, Reserved)
                | (Received, Aborted)
                | (Reserved, Committed)
                | (Reserved, Aborted)
                | (Reserved, Expired)
                | (Committed, Settled)
        )
    }

    /// Upper-case name as used in reports
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Received => "RECEIVED",
            TransferState::Reserved => "RESERVED",
            TransferState::Committed => "COMMITTED",
            TransferState::Aborted => "ABORTED",
            TransferState::Settled => "SETTLED",
            TransferState::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only transfer state log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    /// Unique change id (UUIDv7 for time-ordering)
    pub change_id: Uuid,

    /// Transfer this entry belongs to
    pub transfer_id: TransferId,

    /// Dense per-transfer sequence starting at 0
    pub sequence: u32,

    /// State entered
    pub state: TransferState,

    /// Monotonic per transfer
    pub changed_at: DateTime<Utc>,

    /// Optional human-readable reason
    pub reason: Option<String>,
}

/// Materialized view of the latest [`StateChange`] for a transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatePointer {
    /// Sequence of the latest entry
    pub sequence: u32,

    /// Change id of the latest entry
    pub change_id: Uuid,

    /// Current state
    pub state: TransferState,

    /// When the current state was entered
    pub changed_at: DateTime<Utc>,
}

impl From<&StateChange> for StatePointer {
    fn from(change: &StateChange) -> Self {
        Self {
            sequence: change.sequence,
            change_id: change.change_id,
            state: change.state,
            changed_at: change.changed_at,
        }
    }
}

/// Stored fulfilment proof
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FulfilmentRecord {
    /// Preimage as submitted
    pub fulfilment: Fulfilment,

    /// Commit time
    pub completed_at: DateTime<Utc>,
}

/// Read model returned by `get_transfer`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferView {
    /// Immutable transfer data
    pub transfer: TransferRecord,

    /// Current state (from the state pointer)
    pub state: TransferState,

    /// When the current state was entered
    pub state_changed_at: DateTime<Utc>,

    /// Fulfilment, once committed
    pub fulfilment: Option<FulfilmentRecord>,

    /// Settlement window, once committed
    pub window_id: Option<WindowId>,
}

/// Row of the duplicate-check tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCheckRecord {
    /// Content hash of the original request
    pub hash: [u8; 32],

    /// Rejection returned for the original request, `None` if it succeeded
    pub rejection: Option<crate::Error>,

    /// First seen
    pub created_at: DateTime<Utc>,
}

/// Terminal failure recorded against a state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferErrorRecord {
    /// Transfer id
    pub transfer_id: TransferId,

    /// Sequence of the state change that produced the error
    pub state_change_sequence: u32,

    /// FSPIOP-style error code
    pub code: u16,

    /// Description
    pub description: String,

    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

/// Stored position for a (participant, currency) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    /// Net position (negative = net debtor)
    pub value: Decimal,

    /// Number of changes applied so far
    pub change_count: u64,

    /// Last applied change
    pub last_change_id: Option<Uuid>,

    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl PositionRecord {
    /// Zero position
    pub fn zero(now: DateTime<Utc>) -> Self {
        Self {
            value: Decimal::ZERO,
            change_count: 0,
            last_change_id: None,
            updated_at: now,
        }
    }
}

/// Public position view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantPosition {
    /// Participant
    pub participant: ParticipantId,

    /// Currency
    pub currency: Currency,

    /// Net position
    pub value: Decimal,

    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// Append-only ledger entry for one applied position delta
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionChange {
    /// Unique change id
    pub change_id: Uuid,

    /// Dense per-position sequence (key order = application order)
    pub sequence: u64,

    /// Participant
    pub participant: ParticipantId,

    /// Currency
    pub currency: Currency,

    /// Transfer that caused the delta
    pub transfer_id: TransferId,

    /// Triggering transfer state change
    pub state_change_id: Uuid,

    /// Signed delta
    pub delta: Decimal,

    /// Position after applying the delta
    pub value: Decimal,

    /// Applied at
    pub changed_at: DateTime<Utc>,
}

/// Settlement window identifier (monotonic sequence)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowId(pub u64);

impl WindowId {
    /// Big-endian key form
    pub fn to_key(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Rebuild from a key slice
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
        Some(Self(u64::from_be_bytes(bytes)))
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Settlement window state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum WindowState {
    /// Accepting assignments
    Open = 1,
    /// Closed, awaiting settlement
    Closed = 2,
    /// Settlement acknowledged, awaiting confirmation
    PendingSettlement = 3,
    /// Settled (terminal)
    Settled = 4,
    /// Settlement failed; may be settled again
    Aborted = 5,
}

impl WindowState {
    /// Upper-case name as used in reports
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowState::Open => "OPEN",
            WindowState::Closed => "CLOSED",
            WindowState::PendingSettlement => "PENDING_SETTLEMENT",
            WindowState::Settled => "SETTLED",
            WindowState::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for WindowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settlement window row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementWindow {
    /// Window ID
    pub window_id: WindowId,

    /// Settlement scope
    pub currency: Currency,

    /// Current state
    pub state: WindowState,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last state change
    pub changed_at: DateTime<Utc>,

    /// Reason attached to the last state change
    pub reason: Option<String>,
}

/// Append-only window state log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowStateChange {
    /// Window ID
    pub window_id: WindowId,

    /// Dense per-window sequence
    pub sequence: u32,

    /// State entered
    pub state: WindowState,

    /// When
    pub changed_at: DateTime<Utc>,

    /// Optional reason
    pub reason: Option<String>,
}

/// Transfer as seen from a settlement window, in commit order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowTransfer {
    /// Transfer id
    pub transfer_id: TransferId,

    /// Commit time (assignment time)
    pub committed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_from_code() {
        assert_eq!(Currency::from_code("USD").unwrap().code(), "USD");
        assert!(Currency::from_code("usd").is_none());
        assert!(Currency::from_code("US").is_none());
        assert!("EURO".parse::<Currency>().is_err());
    }

    #[test]
    fn test_same_fsp_ignores_case() {
        assert!(ParticipantId::new("dfsp1").same_fsp(&ParticipantId::new("DFSP1")));
        assert!(!ParticipantId::new("dfsp1").same_fsp(&ParticipantId::new("dfsp2")));
    }

    #[test]
    fn test_transfer_state_transitions() {
        use TransferState::*;

        assert!(Received.can_transition_to(Reserved));
        assert!(Reserved.can_transition_to(Committed));
        assert!(Reserved.can_transition_to(Expired));
        assert!(Committed.can_transition_to(Settled));

        assert!(!Committed.can_transition_to(Aborted));
        assert!(!Expired.can_transition_to(Committed));
        assert!(!Settled.can_transition_to(Committed));
        assert!(!Received.can_transition_to(Committed));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransferState::Aborted.is_terminal());
        assert!(TransferState::Settled.is_terminal());
        assert!(TransferState::Expired.is_terminal());
        assert!(!TransferState::Committed.is_terminal());
        assert!(!TransferState::Reserved.is_terminal());
    }

    #[test]
    fn test_window_id_key_roundtrip_ordering() {
        let a = WindowId(1).to_key();
        let b = WindowId(256).to_key();
        assert!(a < b);
        assert_eq!(WindowId::from_slice(&b), Some(WindowId(256)));
    }
}
