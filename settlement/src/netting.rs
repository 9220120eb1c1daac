//! Multilateral netting of a settlement window
//!
//! Turns the committed transfers of one closed window into gross bilateral
//! obligations, per-participant net positions and a short list of net
//! transfers that settle them.
//!
//! # Example
//!
//! ```text
//! Gross obligations:
//!   A owes B: 100
//!   B owes C: 80
//!   C owes A: 50
//!
//! Net positions:
//!   A: -50 (net payer)
//!   B: +20 (net receiver)
//!   C: +30 (net receiver)
//!
//! Net transfers:
//!   A pays C: 30
//!   A pays B: 20
//! ```
//!
//! Each participant's net equals the negation of the discharge the ledger
//! applies to its position when the window settles.

use crate::{types::*, Error, Result};
use chrono::Utc;
use ledger_core::{ParticipantId, SettlementWindow, TransferState, TransferView};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Netting engine
#[derive(Debug, Clone)]
pub struct NettingEngine {
    /// Warn when efficiency falls below this
    min_netting_ratio: f64,

    /// Offset A→B against B→A before reporting obligations
    enable_bilateral: bool,
}

impl NettingEngine {
    /// Create new netting engine
    pub fn new(min_netting_ratio: f64, enable_bilateral: bool) -> Self {
        Self {
            min_netting_ratio,
            enable_bilateral,
        }
    }

    /// Net the transfers of a closed window
    ///
    /// Every transfer must belong to the window's currency and be COMMITTED
    /// or SETTLED; anything else means the window content is inconsistent.
    pub fn compute(
        &self,
        window: &SettlementWindow,
        transfers: &[TransferView],
    ) -> Result<SettlementReport> {
        for view in transfers {
            let transfer = &view.transfer;
            if transfer.currency != window.currency {
                return Err(Error::Netting(format!(
                    "Transfer {} in {} window {} has currency {}",
                    transfer.transfer_id, window.currency, window.window_id, transfer.currency
                )));
            }
            if !matches!(view.state, TransferState::Committed | TransferState::Settled) {
                return Err(Error::Netting(format!(
                    "Transfer {} in window {} is {}",
                    transfer.transfer_id, window.window_id, view.state
                )));
            }
        }

        let gross = Self::build_obligations(transfers);
        let total_gross: Decimal = transfers.iter().map(|v| v.transfer.amount).sum();

        let positions = Self::net_positions(&gross);
        let net_transfers = Self::generate_net_transfers(&positions);
        let total_net: Decimal = net_transfers.iter().map(|t| t.amount).sum();

        let obligations = if self.enable_bilateral {
            Self::apply_bilateral_netting(gross)
        } else {
            gross
        };

        let report = SettlementReport {
            report_id: Uuid::new_v4(),
            window_id: window.window_id,
            currency: window.currency.clone(),
            transfer_count: transfers.len(),
            obligations,
            positions,
            net_transfers,
            total_gross,
            total_net,
            status: SettlementStatus::PendingConfirmation,
            created_at: Utc::now(),
            reason: None,
        };

        if report.transfer_count > 0 && report.efficiency() < self.min_netting_ratio {
            tracing::warn!(
                window_id = %window.window_id,
                efficiency = report.efficiency(),
                min = self.min_netting_ratio,
                "Netting efficiency below threshold"
            );
        }

        Ok(report)
    }

    /// Group transfers by (payer, payee)
    fn build_obligations(transfers: &[TransferView]) -> Vec<Obligation> {
        let mut by_pair: BTreeMap<(ParticipantId, ParticipantId), Obligation> = BTreeMap::new();

        for view in transfers {
            let transfer = &view.transfer;
            let obligation = by_pair
                .entry((transfer.payer.clone(), transfer.payee.clone()))
                .or_insert_with(|| Obligation {
                    payer: transfer.payer.clone(),
                    payee: transfer.payee.clone(),
                    amount: Decimal::ZERO,
                    transfer_ids: Vec::new(),
                });
            obligation.amount += transfer.amount;
            obligation.transfer_ids.push(transfer.transfer_id);
        }

        by_pair.into_values().collect()
    }

    /// Offset reverse obligations (A owes B 100, B owes A 80 → A owes B 20)
    fn apply_bilateral_netting(obligations: Vec<Obligation>) -> Vec<Obligation> {
        let mut by_pair: BTreeMap<(ParticipantId, ParticipantId), Obligation> = obligations
            .into_iter()
            .map(|o| ((o.payer.clone(), o.payee.clone()), o))
            .collect();

        let mut result = Vec::new();
        while let Some(((payer, payee), forward)) = by_pair.pop_first() {
            let Some(reverse) = by_pair.remove(&(payee, payer)) else {
                result.push(forward);
                continue;
            };

            let (mut larger, smaller) = if forward.amount >= reverse.amount {
                (forward, reverse)
            } else {
                (reverse, forward)
            };

            // Equal flows cancel out entirely
            if larger.amount == smaller.amount {
                continue;
            }

            larger.amount -= smaller.amount;
            larger.transfer_ids.extend(smaller.transfer_ids);
            larger.transfer_ids.sort();
            result.push(larger);
        }

        result
    }

    /// Net position per participant, sorted by participant
    fn net_positions(obligations: &[Obligation]) -> Vec<NetPosition> {
        let mut positions: BTreeMap<ParticipantId, NetPosition> = BTreeMap::new();

        for obligation in obligations {
            positions
                .entry(obligation.payer.clone())
                .or_insert_with(|| NetPosition::new(obligation.payer.clone()))
                .add_obligation(obligation.amount, true);
            positions
                .entry(obligation.payee.clone())
                .or_insert_with(|| NetPosition::new(obligation.payee.clone()))
                .add_obligation(obligation.amount, false);
        }

        positions.into_values().collect()
    }

    /// Greedy match: largest payer against largest receiver
    fn generate_net_transfers(positions: &[NetPosition]) -> Vec<NetTransfer> {
        let by_size = |side: Vec<(ParticipantId, Decimal)>| {
            let mut side = side;
            side.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            side
        };

        let mut payers = by_size(
            positions
                .iter()
                .filter(|p| p.is_net_payer())
                .map(|p| (p.participant.clone(), p.net.abs()))
                .collect(),
        );
        let mut receivers = by_size(
            positions
                .iter()
                .filter(|p| p.is_net_receiver())
                .map(|p| (p.participant.clone(), p.net))
                .collect(),
        );

        let mut transfers = Vec::new();
        for (payer, payer_remaining) in payers.iter_mut() {
            for (receiver, receiver_remaining) in receivers.iter_mut() {
                if *payer_remaining == Decimal::ZERO {
                    break;
                }
                if *receiver_remaining == Decimal::ZERO {
                    continue;
                }

                let amount = (*payer_remaining).min(*receiver_remaining);
                transfers.push(NetTransfer {
                    payer: payer.clone(),
                    payee: receiver.clone(),
                    amount,
                });
                *payer_remaining -= amount;
                *receiver_remaining -= amount;
            }
        }

        transfers
    }
}

impl Default for NettingEngine {
    fn default() -> Self {
        Self::new(0.0, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ledger_core::types::TransferRecord;
    use ledger_core::{Condition, Currency, TransferId, WindowId, WindowState};
    use proptest::prelude::*;

    fn usd() -> Currency {
        Currency::from_code("USD").unwrap()
    }

    fn window() -> SettlementWindow {
        SettlementWindow {
            window_id: WindowId(1),
            currency: usd(),
            state: WindowState::Closed,
            created_at: Utc::now(),
            changed_at: Utc::now(),
            reason: None,
        }
    }

    fn committed(payer: &str, payee: &str, amount: i64) -> TransferView {
        let now = Utc::now();
        TransferView {
            transfer: TransferRecord {
                transfer_id: TransferId::new(),
                payer: ParticipantId::new(payer),
                payee: ParticipantId::new(payee),
                amount: Decimal::new(amount, 2),
                currency: usd(),
                condition: Condition("unused".to_string()),
                expiration: now + Duration::minutes(1),
                created_at: now,
            },
            state: TransferState::Committed,
            state_changed_at: now,
            fulfilment: None,
            window_id: Some(WindowId(1)),
        }
    }

    #[test]
    fn test_multilateral_netting() {
        let engine = NettingEngine::default();
        let transfers = vec![
            committed("dfspa", "dfspb", 10000),
            committed("dfspb", "dfspc", 8000),
            committed("dfspc", "dfspa", 5000),
        ];

        let report = engine.compute(&window(), &transfers).unwrap();

        assert_eq!(report.total_gross, Decimal::new(23000, 2));
        assert_eq!(report.net_of(&"dfspa".into()), Decimal::new(-5000, 2));
        assert_eq!(report.net_of(&"dfspb".into()), Decimal::new(2000, 2));
        assert_eq!(report.net_of(&"dfspc".into()), Decimal::new(3000, 2));

        // A pays C 30, then B 20
        assert_eq!(report.total_net, Decimal::new(5000, 2));
        assert_eq!(report.net_transfers.len(), 2);
        assert_eq!(report.net_transfers[0].payee, ParticipantId::new("dfspc"));
        assert!((report.efficiency() - 0.782).abs() < 0.01);
    }

    #[test]
    fn test_bilateral_offset() {
        let engine = NettingEngine::default();
        let transfers = vec![
            committed("dfspa", "dfspb", 10000),
            committed("dfspb", "dfspa", 8000),
        ];

        let report = engine.compute(&window(), &transfers).unwrap();

        assert_eq!(report.obligations.len(), 1);
        assert_eq!(report.obligations[0].payer, ParticipantId::new("dfspa"));
        assert_eq!(report.obligations[0].amount, Decimal::new(2000, 2));
        assert_eq!(report.obligations[0].transfer_ids.len(), 2);
        assert_eq!(report.total_net, Decimal::new(2000, 2));

        let gross_only = NettingEngine::new(0.0, false)
            .compute(&window(), &transfers)
            .unwrap();
        assert_eq!(gross_only.obligations.len(), 2);
        assert_eq!(gross_only.total_net, report.total_net);
    }

    #[test]
    fn test_balanced_flows_cancel() {
        let engine = NettingEngine::default();
        let transfers = vec![
            committed("dfspa", "dfspb", 5000),
            committed("dfspb", "dfspa", 5000),
        ];

        let report = engine.compute(&window(), &transfers).unwrap();
        assert!(report.obligations.is_empty());
        assert!(report.net_transfers.is_empty());
        assert_eq!(report.efficiency(), 1.0);
    }

    #[test]
    fn test_empty_window() {
        let report = NettingEngine::default().compute(&window(), &[]).unwrap();
        assert_eq!(report.transfer_count, 0);
        assert_eq!(report.total_gross, Decimal::ZERO);
        assert_eq!(report.efficiency(), 0.0);
    }

    #[test]
    fn test_rejects_foreign_content() {
        let engine = NettingEngine::default();

        let mut euro = committed("dfspa", "dfspb", 100);
        euro.transfer.currency = Currency::from_code("EUR").unwrap();
        assert!(matches!(
            engine.compute(&window(), &[euro]),
            Err(Error::Netting(_))
        ));

        let mut reserved = committed("dfspa", "dfspb", 100);
        reserved.state = TransferState::Reserved;
        assert!(matches!(
            engine.compute(&window(), &[reserved]),
            Err(Error::Netting(_))
        ));
    }

    fn flow_strategy() -> impl Strategy<Value = Vec<(usize, usize, i64)>> {
        prop::collection::vec((0usize..5, 1usize..5, 1i64..100_000), 1..40)
    }

    proptest! {
        /// Nets sum to zero and the net transfers settle every position
        #[test]
        fn prop_net_transfers_settle_positions(flows in flow_strategy()) {
            let names = ["dfspa", "dfspb", "dfspc", "dfspd", "dfspe"];
            let transfers: Vec<_> = flows
                .iter()
                .map(|(payer, offset, amount)| {
                    committed(names[*payer], names[(payer + offset) % names.len()], *amount)
                })
                .collect();

            let report = NettingEngine::default().compute(&window(), &transfers).unwrap();

            let total: Decimal = report.positions.iter().map(|p| p.net).sum();
            prop_assert_eq!(total, Decimal::ZERO);
            prop_assert!(report.total_net <= report.total_gross);

            for position in &report.positions {
                let paid: Decimal = report
                    .net_transfers
                    .iter()
                    .filter(|t| t.payer == position.participant)
                    .map(|t| t.amount)
                    .sum();
                let received: Decimal = report
                    .net_transfers
                    .iter()
                    .filter(|t| t.payee == position.participant)
                    .map(|t| t.amount)
                    .sum();
                prop_assert_eq!(received - paid, position.net);
            }
        }
    }
}
