//! Periodic driver of the invoice lifecycle.
//!
//! Each tick loads every live invoice and advances it through the state
//! machine one at a time. A failure on one invoice is logged and counted, the
//! rest of the tick carries on. Invoices that reach `sweeping` are handed to a
//! bounded pool of sweep tasks; when the pool is full the sweep waits for a
//! later tick.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashSet;
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::chain::{ChainGateway, ChainGateways};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::invoice::{Invoice, InvoiceStatus};
use crate::machine::StateMachine;
use crate::metrics;
use crate::store::InvoiceStore;
use crate::sweep::{SettlementEngine, SweepOutcome};
use crate::webhook::Notifier;

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub examined: usize,
    pub errors: usize,
    pub sweeps_started: usize,
    /// Sweeps skipped because every worker was busy.
    pub sweeps_deferred: usize,
}

pub struct ReconciliationLoop<G> {
    config: Arc<EngineConfig>,
    store: Arc<InvoiceStore>,
    machine: StateMachine<G>,
    engine: Arc<SettlementEngine<G>>,
    workers: Arc<Semaphore>,
    in_flight: Arc<DashSet<String>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl<G: ChainGateway + 'static> ReconciliationLoop<G> {
    pub fn new(
        config: Arc<EngineConfig>,
        store: Arc<InvoiceStore>,
        gateways: Arc<ChainGateways<G>>,
        notifier: Arc<dyn Notifier>,
        cancel: CancellationToken,
    ) -> Self {
        let machine = StateMachine::new(
            config.clone(),
            store.clone(),
            gateways.clone(),
            notifier.clone(),
        );
        let engine = Arc::new(SettlementEngine::new(
            config.clone(),
            store.clone(),
            gateways,
            notifier,
        ));
        let workers = Arc::new(Semaphore::new(config.sweep_workers.max(1)));
        Self {
            config,
            store,
            machine,
            engine,
            workers,
            in_flight: Arc::new(DashSet::new()),
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// Tick every `poll_interval` until cancelled, then wait for in-flight sweeps.
    pub async fn run(&self) {
        tracing::info!(
            interval_secs = self.config.poll_interval.as_secs(),
            workers = self.config.sweep_workers,
            "reconciliation loop started"
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => match self.tick().await {
                    Ok(report) if report.errors > 0 => {
                        tracing::warn!(?report, "reconciliation tick finished with errors")
                    }
                    Ok(report) => tracing::debug!(?report, "reconciliation tick finished"),
                    Err(e) => tracing::warn!(error = %e, "reconciliation tick failed"),
                },
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("reconciliation loop stopped");
    }

    /// One pass over all live invoices. Only a failure to list invoices fails the tick.
    pub async fn tick(&self) -> Result<TickReport> {
        metrics::RECONCILE_TICKS.inc();
        let now = Utc::now();
        let invoices = self.store.list_live()?;
        let mut report = TickReport {
            examined: invoices.len(),
            ..Default::default()
        };

        for invoice in invoices {
            if self.cancel.is_cancelled() {
                break;
            }
            let id = invoice.id.clone();
            match self.machine.advance(invoice, now).await {
                Ok(advanced) if advanced.status == InvoiceStatus::Sweeping => {
                    self.spawn_sweep(advanced, &mut report)
                }
                Ok(_) => {}
                Err(e) => {
                    report.errors += 1;
                    metrics::INVOICE_ERRORS.with_label_values(&[e.code()]).inc();
                    tracing::warn!(invoice_id = %id, error = %e, code = e.code(), "failed to advance invoice");
                }
            }
        }

        Ok(report)
    }

    fn spawn_sweep(&self, invoice: Invoice, report: &mut TickReport) {
        if !self.in_flight.insert(invoice.id.clone()) {
            tracing::debug!(invoice_id = %invoice.id, "sweep already running");
            return;
        }
        let permit = match self.workers.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.in_flight.remove(&invoice.id);
                report.sweeps_deferred += 1;
                tracing::debug!(invoice_id = %invoice.id, "sweep pool full, deferring to next tick");
                return;
            }
        };
        report.sweeps_started += 1;

        let engine = self.engine.clone();
        let in_flight = self.in_flight.clone();
        let cancel = self.cancel.clone();
        let id = invoice.id;
        self.tracker.spawn(async move {
            let _permit = permit;
            match engine.settle(&id, &cancel).await {
                Ok(SweepOutcome::Busy) => {
                    tracing::debug!(invoice_id = %id, "sweep lease held elsewhere")
                }
                Ok(SweepOutcome::Deferred { reason }) => {
                    tracing::info!(invoice_id = %id, reason = %reason, "sweep deferred")
                }
                Ok(outcome) => tracing::debug!(invoice_id = %id, ?outcome, "sweep attempt finished"),
                Err(e) => {
                    metrics::INVOICE_ERRORS.with_label_values(&[e.code()]).inc();
                    tracing::warn!(invoice_id = %id, error = %e, code = e.code(), "sweep attempt failed")
                }
            }
            in_flight.remove(&id);
        });
    }

    /// Wait for every sweep spawned so far. The loop keeps accepting new ones.
    pub async fn drain_sweeps(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    pub fn engine(&self) -> &Arc<SettlementEngine<G>> {
        &self.engine
    }
}
