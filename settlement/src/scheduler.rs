//! Settlement schedule
//!
//! Closes the OPEN window of every settlement currency at fixed UTC times of
//! day and hands the closed windows to the [`SettlementEngine`] for netting.
//!
//! - Default: 4 closes per day (00:00, 06:00, 12:00, 18:00 UTC)
//! - Pilot: 2 closes per day
//! - Ad-hoc: manual trigger for ops

use crate::{engine::SettlementEngine, Error, Result, SettlementReport};
use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use ledger_core::Currency;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// A close counts as due for this long after its time of day
const CLOSE_TOLERANCE_SECS: i64 = 60;

/// Closes closer together than this are treated as the same close
const DUPLICATE_GUARD_SECS: i64 = 120;

/// Settlement schedule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Times of day (UTC, "HH:MM") when open windows are closed
    pub window_times: Vec<String>,

    /// Confirm settlement right after netting
    pub auto_confirm: bool,

    /// How often the scheduler wakes up (seconds)
    pub check_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            window_times: vec![
                "00:00".to_string(),
                "06:00".to_string(),
                "12:00".to_string(),
                "18:00".to_string(),
            ],
            auto_confirm: false,
            check_interval_secs: 30,
        }
    }
}

impl ScheduleConfig {
    /// Pilot configuration (2 closes per day)
    pub fn pilot() -> Self {
        Self {
            window_times: vec!["06:00".to_string(), "18:00".to_string()],
            ..Self::default()
        }
    }

    /// Parse window times, sorted
    pub fn parse_times(&self) -> Result<Vec<NaiveTime>> {
        let mut times = self
            .window_times
            .iter()
            .map(|time_str| {
                NaiveTime::parse_from_str(time_str, "%H:%M").map_err(|e| {
                    Error::Config(format!("Invalid time format '{}': {}", time_str, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        times.sort();
        Ok(times)
    }

    /// Next scheduled close strictly after `now`
    pub fn next_close_time(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let times = self.parse_times()?;
        let at = |date: chrono::NaiveDate, time: NaiveTime| {
            date.and_time(time)
                .and_local_timezone(Utc)
                .single()
                .ok_or_else(|| Error::Config("Invalid timezone conversion".to_string()))
        };

        if let Some(time) = times.iter().find(|t| now.time() < **t) {
            return at(now.date_naive(), *time);
        }

        let first = times
            .first()
            .ok_or_else(|| Error::Config("No window times configured".to_string()))?;
        at((now + Duration::days(1)).date_naive(), *first)
    }

    /// `now` falls within the tolerance after a scheduled close
    pub fn is_close_time(&self, now: DateTime<Utc>) -> Result<bool> {
        let current = now.time().num_seconds_from_midnight() as i64;

        Ok(self.parse_times()?.iter().any(|time| {
            let since = (current - time.num_seconds_from_midnight() as i64).rem_euclid(86_400);
            since < CLOSE_TOLERANCE_SECS
        }))
    }
}

/// Drives scheduled window closes
#[derive(Debug)]
pub struct SettlementScheduler {
    engine: Arc<SettlementEngine>,
    config: RwLock<ScheduleConfig>,
    currencies: Vec<Currency>,
    last_close: RwLock<Option<DateTime<Utc>>>,
}

impl SettlementScheduler {
    /// Create scheduler for the given settlement currencies
    pub fn new(engine: Arc<SettlementEngine>, config: ScheduleConfig, currencies: Vec<Currency>) -> Self {
        Self {
            engine,
            config: RwLock::new(config),
            currencies,
            last_close: RwLock::new(None),
        }
    }

    /// Run until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let secs = self.config.read().await.check_interval_secs.max(1);
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(secs));

        info!(currencies = ?self.currencies, "Settlement scheduler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.check(Utc::now()).await {
                        warn!("Scheduler check failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Settlement scheduler stopped");
    }

    /// Close every currency's window if `now` is a scheduled close
    pub async fn check(&self, now: DateTime<Utc>) -> Result<Vec<SettlementReport>> {
        if !self.config.read().await.is_close_time(now)? {
            return Ok(Vec::new());
        }

        {
            let mut last_close = self.last_close.write().await;
            if let Some(last) = *last_close {
                if (now - last).num_seconds().abs() < DUPLICATE_GUARD_SECS {
                    debug!("Windows already closed for this slot, skipping");
                    return Ok(Vec::new());
                }
            }
            *last_close = Some(now);
        }

        Ok(self.close_all("schedule").await)
    }

    /// Close every currency's window now
    pub async fn trigger_adhoc(&self, requester: &str) -> Vec<SettlementReport> {
        info!(requester, "Ad-hoc settlement triggered");
        *self.last_close.write().await = Some(Utc::now());
        self.close_all(requester).await
    }

    async fn close_all(&self, trigger: &str) -> Vec<SettlementReport> {
        let mut reports = match self.engine.recover_closed().await {
            Ok(recovered) => recovered,
            Err(e) => {
                warn!(error = %e, "Failed to resubmit closed windows");
                Vec::new()
            }
        };

        for currency in &self.currencies {
            match self.engine.close_and_net(currency.clone()).await {
                Ok(report) => {
                    info!(
                        %currency,
                        window_id = %report.window_id,
                        transfers = report.transfer_count,
                        trigger,
                        "Window closed and netted"
                    );
                    reports.push(report);
                }
                Err(e) => warn!(%currency, error = %e, "Failed to close window"),
            }
        }

        reports
    }

    /// Replace the schedule
    pub async fn update_config(&self, config: ScheduleConfig) -> Result<()> {
        config.parse_times()?;
        *self.config.write().await = config;
        info!("Settlement schedule updated");
        Ok(())
    }

    /// Next scheduled close
    pub async fn next_close_time(&self) -> Result<DateTime<Utc>> {
        self.config.read().await.next_close_time(Utc::now())
    }

    /// Time of the last close performed by this scheduler
    pub async fn last_close(&self) -> Option<DateTime<Utc>> {
        *self.last_close.read().await
    }
}
