//! Settlement engine
//!
//! Orchestrates one settlement cycle per window:
//!
//! ```text
//! close_and_net(currency)            confirm(window)
//!   OPEN ──close──▶ CLOSED ──net──▶ PENDING_SETTLEMENT ──settle──▶ SETTLED
//!                                          │
//!                                   reject(window)
//!                                          ▼
//!                                       ABORTED ──confirm──▶ SETTLED
//! ```

use crate::{
    config::Config,
    netting::NettingEngine,
    types::{SettlementReport, SettlementStatus},
    Error, Result,
};
use ledger_core::{Currency, Ledger, TransferView, WindowId, WindowState};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Settlement engine
#[derive(Debug)]
pub struct SettlementEngine {
    ledger: Arc<Ledger>,
    netting: NettingEngine,
    reports: RwLock<BTreeMap<WindowId, SettlementReport>>,
    config: Config,
}

impl SettlementEngine {
    /// Open the ledger described by `config.ledger` and wrap it
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let ledger = Arc::new(Ledger::open_with_config_participants(config.ledger.clone()).await?);
        Ok(Self::with_ledger(ledger, config))
    }

    /// Wrap an already open ledger
    pub fn with_ledger(ledger: Arc<Ledger>, config: Config) -> Self {
        let netting = NettingEngine::new(
            config.netting.min_netting_ratio,
            config.netting.enable_bilateral_optimization,
        );

        Self {
            ledger,
            netting,
            reports: RwLock::new(BTreeMap::new()),
            config,
        }
    }

    /// Close the OPEN window of `currency` and net it
    ///
    /// The window moves to PENDING_SETTLEMENT; with `schedule.auto_confirm`
    /// it is settled right away. If netting fails after the close has
    /// committed, the window stays CLOSED until [`Self::submit`] or
    /// [`Self::recover_closed`] picks it up.
    pub async fn close_and_net(&self, currency: Currency) -> Result<SettlementReport> {
        let window = self
            .ledger
            .open_window(currency.clone())
            .await?
            .ok_or(ledger_core::Error::NoOpenWindow(currency))?;
        let window_id = window.window_id;

        let next = self
            .ledger
            .close_window(window_id, Some("settlement close".to_string()))
            .await?;
        tracing::info!(%window_id, next_window_id = %next, "Closed window for settlement");

        self.submit(window_id).await.map_err(|e| {
            tracing::error!(%window_id, error = %e, "Closed window left unsubmitted");
            e
        })
    }

    /// Net a CLOSED window and move it to PENDING_SETTLEMENT
    ///
    /// A window already PENDING_SETTLEMENT is re-netted and its report stored
    /// again.
    pub async fn submit(&self, window_id: WindowId) -> Result<SettlementReport> {
        let report = self.net_window(window_id).await?;
        if self.ledger.get_window(window_id).await?.state == WindowState::Closed {
            self.ledger.begin_settlement(window_id).await?;
        }
        self.store(report.clone()).await?;

        if self.config.schedule.auto_confirm {
            return self.confirm(window_id).await;
        }

        Ok(report)
    }

    /// Submit every window that was closed but never netted
    pub async fn recover_closed(&self) -> Result<Vec<SettlementReport>> {
        let mut reports = Vec::new();
        for window in self.ledger.windows_by_state(WindowState::Closed).await? {
            tracing::warn!(window_id = %window.window_id, "Resubmitting closed window");
            reports.push(self.submit(window.window_id).await?);
        }
        Ok(reports)
    }

    /// Compute the net settlement of a closed window from ledger data
    pub async fn net_window(&self, window_id: WindowId) -> Result<SettlementReport> {
        let window = self.ledger.get_window(window_id).await?;
        if window.state == WindowState::Open {
            return Err(ledger_core::Error::InvalidWindowState {
                window_id,
                state: window.state,
                expected: "CLOSED, PENDING_SETTLEMENT, ABORTED or SETTLED".to_string(),
            }
            .into());
        }

        let rows = self.ledger.window_transfers(window_id).await?;
        let mut transfers: Vec<TransferView> = Vec::with_capacity(rows.len());
        for row in rows {
            transfers.push(self.ledger.get_transfer(row.transfer_id).await?);
        }

        let report = self.netting.compute(&window, &transfers)?;
        tracing::info!(
            %window_id,
            transfers = report.transfer_count,
            gross = %report.total_gross,
            net = %report.total_net,
            efficiency = report.efficiency(),
            "Netted window"
        );
        Ok(report)
    }

    /// Confirm settlement of a window: every transfer becomes SETTLED
    ///
    /// The report is stored as settled once the ledger has settled the
    /// window, even when the settled count disagrees with it.
    pub async fn confirm(&self, window_id: WindowId) -> Result<SettlementReport> {
        let settled = self.ledger.settle_window(window_id).await?;

        let mut report = match self.report(window_id).await {
            Some(report) => report,
            None => self.net_window(window_id).await?,
        };
        report.status = SettlementStatus::Settled;
        report.reason = None;

        if settled != report.transfer_count {
            let message = format!(
                "Window {} settled {} transfers but its report has {}",
                window_id, settled, report.transfer_count
            );
            tracing::error!(%window_id, settled, expected = report.transfer_count, "Settled count mismatch");
            report.reason = Some(message.clone());
            self.store(report).await?;
            return Err(Error::Netting(message));
        }

        self.store(report.clone()).await?;

        tracing::info!(%window_id, settled, "Settlement confirmed");
        Ok(report)
    }

    /// Record a failed settlement; the window can be confirmed again later
    pub async fn reject(&self, window_id: WindowId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.ledger.abort_window(window_id, reason.clone()).await?;

        let report = self.reports.write().await.get_mut(&window_id).map(|report| {
            report.status = SettlementStatus::Aborted;
            report.reason = Some(reason.clone());
            report.clone()
        });
        if let Some(report) = report {
            self.write_report(&report).await?;
        }

        tracing::warn!(%window_id, %reason, "Settlement rejected");
        Ok(())
    }

    /// Last report for a window
    pub async fn report(&self, window_id: WindowId) -> Option<SettlementReport> {
        self.reports.read().await.get(&window_id).cloned()
    }

    /// All reports, oldest window first
    pub async fn reports(&self) -> Vec<SettlementReport> {
        self.reports.read().await.values().cloned().collect()
    }

    /// Underlying ledger
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop the ledger's background tasks
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down settlement engine");
        self.ledger.shutdown().await?;
        Ok(())
    }

    async fn store(&self, report: SettlementReport) -> Result<()> {
        self.write_report(&report).await?;
        self.reports.write().await.insert(report.window_id, report);
        Ok(())
    }

    async fn write_report(&self, report: &SettlementReport) -> Result<()> {
        let Some(dir) = &self.config.report_dir else {
            return Ok(());
        };

        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("window-{}.json", report.window_id.0));
        tokio::fs::write(&path, serde_json::to_vec_pretty(report)?).await?;
        tracing::debug!(path = %path.display(), "Wrote settlement report");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use ledger_core::{Fulfilment, ParticipantId, StaticReferenceData, TransferId, TransferRequest};
    use rust_decimal::Decimal;

    fn usd() -> Currency {
        Currency::from_code("USD").unwrap()
    }

    async fn engine(temp_dir: &tempfile::TempDir, auto_confirm: bool) -> SettlementEngine {
        let mut config = Config::default();
        config.ledger.data_dir = temp_dir.path().join("ledger");
        config.ledger.sweeper.enabled = false;
        config.schedule.auto_confirm = auto_confirm;
        config.report_dir = Some(temp_dir.path().join("reports"));

        let reference = Arc::new(
            StaticReferenceData::new()
                .with_participant("dfsp1", &usd(), Decimal::from(1000))
                .with_participant("dfsp2", &usd(), Decimal::from(1000)),
        );
        let ledger = Ledger::open(config.ledger.clone(), reference).await.unwrap();
        SettlementEngine::with_ledger(Arc::new(ledger), config)
    }

    async fn commit(engine: &SettlementEngine, payer: &str, payee: &str, amount: i64) {
        let fulfilment = Fulfilment::random();
        let id = engine
            .ledger()
            .prepare(TransferRequest {
                transfer_id: TransferId::new(),
                payer: ParticipantId::new(payer),
                payee: ParticipantId::new(payee),
                amount: Decimal::from(amount),
                currency: usd(),
                condition: fulfilment.condition().unwrap(),
                expiration: Utc::now() + Duration::minutes(5),
            })
            .await
            .unwrap();
        engine.ledger().fulfil(id, fulfilment).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_net_confirm() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = engine(&temp_dir, false).await;
        commit(&engine, "dfsp1", "dfsp2", 300).await;
        commit(&engine, "dfsp2", "dfsp1", 100).await;

        let report = engine.close_and_net(usd()).await.unwrap();
        assert_eq!(report.status, SettlementStatus::PendingConfirmation);
        assert_eq!(report.transfer_count, 2);
        assert_eq!(report.net_of(&"dfsp1".into()), Decimal::from(-200));
        assert_eq!(
            engine.ledger().get_window(report.window_id).await.unwrap().state,
            WindowState::PendingSettlement
        );
        assert!(temp_dir
            .path()
            .join(format!("reports/window-{}.json", report.window_id.0))
            .exists());

        let confirmed = engine.confirm(report.window_id).await.unwrap();
        assert_eq!(confirmed.status, SettlementStatus::Settled);
        assert_eq!(confirmed.report_id, report.report_id);

        let position = engine
            .ledger()
            .position("dfsp1".into(), usd())
            .await
            .unwrap();
        assert_eq!(position.value, Decimal::ZERO);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_confirm_and_empty_window() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = engine(&temp_dir, true).await;

        let report = engine.close_and_net(usd()).await.unwrap();
        assert_eq!(report.status, SettlementStatus::Settled);
        assert_eq!(report.transfer_count, 0);
        assert_eq!(
            engine.ledger().get_window(report.window_id).await.unwrap().state,
            WindowState::Settled
        );

        // A fresh OPEN window replaced the closed one
        let open = engine.ledger().open_window(usd()).await.unwrap().unwrap();
        assert_ne!(open.window_id, report.window_id);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reject_then_confirm() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = engine(&temp_dir, false).await;
        commit(&engine, "dfsp1", "dfsp2", 50).await;

        let report = engine.close_and_net(usd()).await.unwrap();
        engine.reject(report.window_id, "funds not received").await.unwrap();

        let rejected = engine.report(report.window_id).await.unwrap();
        assert_eq!(rejected.status, SettlementStatus::Aborted);
        assert_eq!(rejected.reason.as_deref(), Some("funds not received"));

        let confirmed = engine.confirm(report.window_id).await.unwrap();
        assert_eq!(confirmed.status, SettlementStatus::Settled);
        assert_eq!(engine.reports().await.len(), 1);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_recover_window_left_closed() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = engine(&temp_dir, false).await;
        commit(&engine, "dfsp1", "dfsp2", 120).await;

        // Closed outside a settlement cycle, never netted
        let stranded = engine.ledger().open_window(usd()).await.unwrap().unwrap().window_id;
        engine.ledger().close_window(stranded, None).await.unwrap();
        assert!(engine.report(stranded).await.is_none());

        let recovered = engine.recover_closed().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].window_id, stranded);
        assert_eq!(recovered[0].transfer_count, 1);
        assert_eq!(
            engine.ledger().get_window(stranded).await.unwrap().state,
            WindowState::PendingSettlement
        );
        assert!(engine.recover_closed().await.unwrap().is_empty());

        // The next cycle closes the replacement window, not the stranded one
        let next = engine.close_and_net(usd()).await.unwrap();
        assert_ne!(next.window_id, stranded);
        assert_eq!(next.transfer_count, 0);

        engine.confirm(stranded).await.unwrap();
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_confirm_count_mismatch_keeps_settled_report() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = engine(&temp_dir, false).await;
        commit(&engine, "dfsp1", "dfsp2", 30).await;

        let report = engine.close_and_net(usd()).await.unwrap();
        engine
            .reports
            .write()
            .await
            .get_mut(&report.window_id)
            .unwrap()
            .transfer_count = 2;

        let err = engine.confirm(report.window_id).await.unwrap_err();
        assert!(matches!(err, Error::Netting(_)));

        let stored = engine.report(report.window_id).await.unwrap();
        assert_eq!(stored.status, SettlementStatus::Settled);
        assert!(stored.reason.is_some());
        assert_eq!(
            engine.ledger().get_window(report.window_id).await.unwrap().state,
            WindowState::Settled
        );
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_currency() {
        let temp_dir = tempfile::tempdir().unwrap();
        let engine = engine(&temp_dir, false).await;

        let err = engine
            .close_and_net(Currency::from_code("EUR").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err.ledger(),
            Some(ledger_core::Error::NoOpenWindow(_))
        ));
        engine.shutdown().await.unwrap();
    }
}
