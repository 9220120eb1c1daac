//! Core types for the settlement layer

use chrono::{DateTime, Utc};
use ledger_core::{Currency, ParticipantId, TransferId, WindowId};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Gross bilateral obligation between two participants in one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Obligation {
    /// Participant that owes
    pub payer: ParticipantId,

    /// Participant that is owed
    pub payee: ParticipantId,

    /// Amount owed
    pub amount: Decimal,

    /// Transfers behind the obligation
    pub transfer_ids: Vec<TransferId>,
}

/// Multilateral net position of one participant over one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetPosition {
    /// Participant
    pub participant: ParticipantId,

    /// Total sent
    pub debits: Decimal,

    /// Total received
    pub credits: Decimal,

    /// credits - debits (positive = net receiver, negative = net payer)
    pub net: Decimal,
}

impl NetPosition {
    /// Empty position
    pub fn new(participant: ParticipantId) -> Self {
        Self {
            participant,
            debits: Decimal::ZERO,
            credits: Decimal::ZERO,
            net: Decimal::ZERO,
        }
    }

    /// Add one obligation leg
    pub fn add_obligation(&mut self, amount: Decimal, is_payer: bool) {
        if is_payer {
            self.debits += amount;
        } else {
            self.credits += amount;
        }
        self.net = self.credits - self.debits;
    }

    /// Owes money at settlement
    pub fn is_net_payer(&self) -> bool {
        self.net < Decimal::ZERO
    }

    /// Receives money at settlement
    pub fn is_net_receiver(&self) -> bool {
        self.net > Decimal::ZERO
    }
}

/// Funds movement instruction produced by netting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetTransfer {
    /// Net payer
    pub payer: ParticipantId,

    /// Net receiver
    pub payee: ParticipantId,

    /// Amount to move
    pub amount: Decimal,
}

/// Settlement report status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SettlementStatus {
    /// Net computed, waiting for confirmation
    PendingConfirmation = 1,
    /// Window settled in the ledger
    Settled = 2,
    /// Settlement failed; window aborted
    Aborted = 3,
}

/// Net settlement of one closed window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementReport {
    /// Report ID
    pub report_id: Uuid,

    /// Settled window
    pub window_id: WindowId,

    /// Window currency
    pub currency: Currency,

    /// Transfers in the window
    pub transfer_count: usize,

    /// Gross bilateral obligations (after bilateral offset when enabled)
    pub obligations: Vec<Obligation>,

    /// Net position per participant, sorted by participant
    pub positions: Vec<NetPosition>,

    /// Instructions that settle the net positions
    pub net_transfers: Vec<NetTransfer>,

    /// Sum of transfer amounts
    pub total_gross: Decimal,

    /// Sum of net transfer amounts
    pub total_net: Decimal,

    /// Status
    pub status: SettlementStatus,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Failure reason when aborted
    pub reason: Option<String>,
}

impl SettlementReport {
    /// Share of the gross amount removed by netting (0.0 - 1.0)
    pub fn efficiency(&self) -> f64 {
        if self.total_gross == Decimal::ZERO {
            return 0.0;
        }

        ((self.total_gross - self.total_net) / self.total_gross)
            .to_f64()
            .unwrap_or(0.0)
    }

    /// Amount that does not need to move thanks to netting
    pub fn savings(&self) -> Decimal {
        self.total_gross - self.total_net
    }

    /// Net position of a participant (zero when absent from the window)
    pub fn net_of(&self, participant: &ParticipantId) -> Decimal {
        self.positions
            .iter()
            .find(|p| &p.participant == participant)
            .map(|p| p.net)
            .unwrap_or(Decimal::ZERO)
    }

    /// Summary statistics
    pub fn stats(&self) -> NettingStats {
        NettingStats {
            participant_count: self.positions.len(),
            transfer_count: self.transfer_count,
            net_transfer_count: self.net_transfers.len(),
            total_gross: self.total_gross,
            total_net: self.total_net,
            amount_saved: self.savings(),
            efficiency: self.efficiency(),
            transfers_eliminated: self.transfer_count.saturating_sub(self.net_transfers.len()),
        }
    }
}

/// Netting statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NettingStats {
    /// Participants involved
    pub participant_count: usize,

    /// Gross transfers
    pub transfer_count: usize,

    /// Net transfers
    pub net_transfer_count: usize,

    /// Total gross amount
    pub total_gross: Decimal,

    /// Total net amount
    pub total_net: Decimal,

    /// Amount saved
    pub amount_saved: Decimal,

    /// Netting efficiency (0.0 - 1.0)
    pub efficiency: f64,

    /// Movements avoided
    pub transfers_eliminated: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_position() {
        let mut position = NetPosition::new(ParticipantId::new("dfsp1"));

        position.add_obligation(Decimal::new(10000, 2), true);
        assert_eq!(position.debits, Decimal::new(10000, 2));
        assert!(position.is_net_payer());

        position.add_obligation(Decimal::new(15000, 2), false);
        assert_eq!(position.credits, Decimal::new(15000, 2));
        assert!(position.is_net_receiver());
        assert_eq!(position.net, Decimal::new(5000, 2));
    }

    #[test]
    fn test_report_efficiency() {
        let report = SettlementReport {
            report_id: Uuid::new_v4(),
            window_id: WindowId(1),
            currency: Currency::from_code("USD").unwrap(),
            transfer_count: 10,
            obligations: vec![],
            positions: vec![],
            net_transfers: vec![],
            total_gross: Decimal::new(100000, 2),
            total_net: Decimal::new(30000, 2),
            status: SettlementStatus::PendingConfirmation,
            created_at: Utc::now(),
            reason: None,
        };

        assert_eq!(report.efficiency(), 0.7);
        assert_eq!(report.savings(), Decimal::new(70000, 2));
        assert_eq!(report.stats().transfers_eliminated, 10);
        assert_eq!(report.net_of(&ParticipantId::new("dfsp9")), Decimal::ZERO);
    }
}
