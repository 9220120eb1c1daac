//! Timeout sweeper
//!
//! A single tokio task that wakes every `sweeper.interval_ms`, reads the
//! timeout index up to the current time and expires each due transfer in
//! its own transaction. A candidate that a concurrent `fulfil` or `abort`
//! already moved out of RESERVED is a lost race: it is counted and dropped.
//!
//! ```text
//!   SweeperHandle ──mpsc──▶ Sweeper task ──spawn_blocking──▶ sweep_once()
//!                              ▲
//!                          interval tick
//! ```

use crate::metrics::Metrics;
use crate::transfer::TransferStateMachine;
use crate::types::TransferId;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Result of one sweep cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Due timeouts read from the index
    pub examined: usize,

    /// Transfers moved to EXPIRED by this cycle
    pub expired: usize,

    /// Candidates already terminal (or gone) when locked
    pub lost_races: usize,

    /// Candidates that failed with an unexpected error
    pub failed: usize,
}

impl SweepReport {
    fn merge(&mut self, other: &SweepReport) {
        self.examined += other.examined;
        self.expired += other.expired;
        self.lost_races += other.lost_races;
        self.failed += other.failed;
    }
}

/// Run one sweep cycle as of `now`
pub fn sweep_once(
    machine: &TransferStateMachine,
    now: DateTime<Utc>,
    batch_size: usize,
) -> Result<SweepReport> {
    let due: Vec<TransferId> = machine.due_timeouts(now, batch_size)?;
    let mut report = SweepReport {
        examined: due.len(),
        ..SweepReport::default()
    };

    for transfer_id in due {
        match machine.expire(&transfer_id, now) {
            Ok(()) => report.expired += 1,
            Err(Error::AlreadyTerminal { state, .. }) => {
                tracing::debug!(%transfer_id, %state, "Sweeper lost race");
                report.lost_races += 1;
            }
            Err(Error::NotFound(_)) => {
                tracing::debug!(%transfer_id, "Sweeper candidate vanished");
                report.lost_races += 1;
            }
            Err(e) => {
                tracing::error!(%transfer_id, error = %e, "Failed to expire transfer");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

/// Message sent to the sweeper task
#[derive(Debug)]
pub enum SweeperMessage {
    /// Run a cycle immediately
    SweepNow {
        /// Receives the cycle report
        response: oneshot::Sender<Result<SweepReport>>,
    },

    /// Stop the task
    Shutdown,
}

/// Background sweeper task
#[derive(Debug)]
pub struct Sweeper {
    machine: TransferStateMachine,
    mailbox: mpsc::Receiver<SweeperMessage>,
    interval: Duration,
    batch_size: usize,
    metrics: Arc<Metrics>,
    totals: SweepReport,
}

impl Sweeper {
    /// Create sweeper
    pub fn new(
        machine: TransferStateMachine,
        mailbox: mpsc::Receiver<SweeperMessage>,
        interval: Duration,
        batch_size: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            machine,
            mailbox,
            interval,
            batch_size,
            metrics,
            totals: SweepReport::default(),
        }
    }

    /// Run the sweep loop until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(interval_ms = self.interval.as_millis() as u64, "Timeout sweeper started");

        loop {
            tokio::select! {
                msg = self.mailbox.recv() => match msg {
                    Some(SweeperMessage::SweepNow { response }) => {
                        let result = self.sweep().await;
                        let _ = response.send(result);
                    }
                    Some(SweeperMessage::Shutdown) | None => break,
                },

                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::error!("Sweep cycle failed: {}", e);
                    }
                }
            }
        }

        tracing::info!(
            expired = self.totals.expired,
            lost_races = self.totals.lost_races,
            "Timeout sweeper stopped"
        );
    }

    async fn sweep(&mut self) -> Result<SweepReport> {
        let machine = self.machine.clone();
        let batch_size = self.batch_size;
        let started = Instant::now();

        let report = tokio::task::spawn_blocking(move || sweep_once(&machine, Utc::now(), batch_size))
            .await
            .map_err(|e| Error::Concurrency(format!("Sweep task failed: {}", e)))??;

        self.metrics
            .sweep_duration
            .observe(started.elapsed().as_secs_f64());
        self.metrics.sweep_lost_races.inc_by(report.lost_races as u64);
        self.totals.merge(&report);

        if report.examined > 0 {
            tracing::debug!(
                examined = report.examined,
                expired = report.expired,
                lost_races = report.lost_races,
                "Sweep cycle finished"
            );
        }

        Ok(report)
    }
}

/// Handle for sending messages to the sweeper
#[derive(Debug, Clone)]
pub struct SweeperHandle {
    sender: mpsc::Sender<SweeperMessage>,
}

impl SweeperHandle {
    /// Run a sweep cycle now and wait for its report
    pub async fn sweep_now(&self) -> Result<SweepReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SweeperMessage::SweepNow { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Sweeper mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Sweeper response channel closed".to_string()))?
    }

    /// Ask the sweeper to stop
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(SweeperMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Sweeper mailbox closed".to_string()))
    }
}

/// Spawn the sweeper task
pub fn spawn_sweeper(
    machine: TransferStateMachine,
    interval: Duration,
    batch_size: usize,
    metrics: Arc<Metrics>,
) -> (SweeperHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(16);
    let sweeper = Sweeper::new(machine, rx, interval, batch_size, metrics);

    let task = tokio::spawn(sweeper.run());

    (SweeperHandle { sender: tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_merge() {
        let mut total = SweepReport::default();
        total.merge(&SweepReport {
            examined: 3,
            expired: 2,
            lost_races: 1,
            failed: 0,
        });
        total.merge(&SweepReport {
            examined: 1,
            expired: 0,
            lost_races: 0,
            failed: 1,
        });

        assert_eq!(total.examined, 4);
        assert_eq!(total.expired, 2);
        assert_eq!(total.lost_races, 1);
        assert_eq!(total.failed, 1);
    }
}
