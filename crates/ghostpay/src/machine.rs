//! Invoice lifecycle rules.
//!
//! ```text
//! pending ──► underpaid ──► confirming ──► sweeping ──► completed
//!    │            │              │             │
//!    └──► expired ◄┘             └──► failed ◄─┘
//! ```
//!
//! The free functions are pure. [`StateMachine::advance`] applies them to one
//! stored invoice per tick, consulting the chain gateway for balances and
//! block height, and persists each step with a compare-and-swap.

use std::sync::Arc;

use alloy::primitives::U256;
use chrono::{DateTime, Utc};

use crate::amount::parse_units;
use crate::chain::{asset_balance, asset_decimals, ChainGateway, ChainGateways};
use crate::config::EngineConfig;
use crate::error::{GhostpayError, Result};
use crate::invoice::{Invoice, InvoiceStatus};
use crate::metrics;
use crate::store::InvoiceStore;
use crate::webhook::{notify_status, Notifier};

/// Whether `from -> to` is an edge of the lifecycle graph.
pub fn can_transition(from: InvoiceStatus, to: InvoiceStatus) -> bool {
    use InvoiceStatus::*;
    matches!(
        (from, to),
        (Pending, Underpaid)
            | (Pending | Underpaid, Confirming)
            | (Pending | Underpaid, Expired)
            | (Confirming, Sweeping)
            | (Sweeping, Completed)
            | (Pending | Underpaid | Confirming | Sweeping, Failed)
    )
}

pub fn ensure_transition(id: &str, from: InvoiceStatus, to: InvoiceStatus) -> Result<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(GhostpayError::InvalidTransition {
            id: id.to_string(),
            from,
            to,
        })
    }
}

/// Outcome of comparing an observed balance with the requested amount.
pub fn payment_status(
    current: InvoiceStatus,
    observed: U256,
    required: U256,
) -> Option<InvoiceStatus> {
    if !current.is_awaiting_payment() {
        return None;
    }
    if observed >= required {
        Some(InvoiceStatus::Confirming)
    } else if current == InvoiceStatus::Pending && !observed.is_zero() {
        Some(InvoiceStatus::Underpaid)
    } else {
        None
    }
}

/// Confirmation depth reached. Rows confirmed before block tracking existed
/// carry no `confirmed_block` and count as confirmed.
pub fn confirmations_reached(
    confirmed_block: Option<u64>,
    current_block: u64,
    confirmations: u64,
) -> bool {
    match confirmed_block {
        _ if confirmations == 0 => true,
        Some(seen) => current_block >= seen.saturating_add(confirmations),
        None => true,
    }
}

pub fn sweep_deadline_passed(
    invoice: &Invoice,
    now: DateTime<Utc>,
    deadline: chrono::Duration,
) -> bool {
    invoice.status == InvoiceStatus::Sweeping
        && invoice
            .confirmed_at
            .is_some_and(|confirmed_at| now >= confirmed_at + deadline)
}

/// Applies the per-tick rules to stored invoices.
pub struct StateMachine<G> {
    config: Arc<EngineConfig>,
    store: Arc<InvoiceStore>,
    gateways: Arc<ChainGateways<G>>,
    notifier: Arc<dyn Notifier>,
}

impl<G: ChainGateway> StateMachine<G> {
    pub fn new(
        config: Arc<EngineConfig>,
        store: Arc<InvoiceStore>,
        gateways: Arc<ChainGateways<G>>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            store,
            gateways,
            notifier,
        }
    }

    /// CAS `invoice` into `to` and notify. Returns `false` when another writer got there first.
    fn commit(&self, invoice: &mut Invoice, to: InvoiceStatus, now: DateTime<Utc>) -> Result<bool> {
        ensure_transition(&invoice.id, invoice.status, to)?;
        if !self.store.transition(&invoice.id, invoice.status, to, now)? {
            tracing::debug!(invoice_id = %invoice.id, from = %invoice.status, to = %to, "lost transition race");
            return Ok(false);
        }
        self.record(invoice, to);
        Ok(true)
    }

    fn record(&self, invoice: &mut Invoice, to: InvoiceStatus) {
        tracing::info!(
            invoice_id = %invoice.id,
            chain = %invoice.chain,
            from = %invoice.status,
            to = %to,
            "invoice transition"
        );
        invoice.status = to;
        metrics::TRANSITIONS.with_label_values(&[to.as_str()]).inc();
        notify_status(self.notifier.as_ref(), invoice, to);
    }

    /// Run rules 1 to 4 (up to the sweep hand-off) for one invoice. Several
    /// steps may apply in one call; the returned invoice reflects the last one.
    pub async fn advance(&self, mut invoice: Invoice, now: DateTime<Utc>) -> Result<Invoice> {
        // 1. Expiry.
        if invoice.status.is_awaiting_payment() && invoice.is_expired_at(now) {
            self.commit(&mut invoice, InvoiceStatus::Expired, now)?;
            return Ok(invoice);
        }

        // 2. Payment detection.
        if invoice.status.is_awaiting_payment() {
            let gateway = self.gateways.get(invoice.chain)?;
            let decimals = asset_decimals(gateway, invoice.token).await?;
            let required = parse_units(&invoice.amount_requested, decimals)?;
            if required.is_zero() {
                return Err(GhostpayError::Validation(format!(
                    "amount {} rounds to zero at {decimals} decimals",
                    invoice.amount_requested
                )));
            }
            let observed = asset_balance(gateway, invoice.deposit_address, invoice.token).await?;

            match payment_status(invoice.status, observed, required) {
                Some(InvoiceStatus::Confirming) => {
                    let block = gateway.block_number().await?;
                    if !self
                        .store
                        .mark_confirming(&invoice.id, invoice.status, now, Some(block))?
                    {
                        return Ok(invoice);
                    }
                    tracing::info!(
                        invoice_id = %invoice.id,
                        observed = %observed,
                        required = %required,
                        block,
                        "payment detected"
                    );
                    invoice.confirmed_at = Some(now);
                    invoice.confirmed_block = Some(block);
                    self.record(&mut invoice, InvoiceStatus::Confirming);
                }
                Some(InvoiceStatus::Underpaid) => {
                    tracing::info!(
                        invoice_id = %invoice.id,
                        observed = %observed,
                        required = %required,
                        "partial payment detected"
                    );
                    self.commit(&mut invoice, InvoiceStatus::Underpaid, now)?;
                    return Ok(invoice);
                }
                _ => return Ok(invoice),
            }
        }

        // 3. Confirmation depth.
        if invoice.status == InvoiceStatus::Confirming {
            let confirmations = self.config.confirmations(invoice.chain);
            if confirmations > 0 && invoice.confirmed_block.is_some() {
                let current = self.gateways.get(invoice.chain)?.block_number().await?;
                if !confirmations_reached(invoice.confirmed_block, current, confirmations) {
                    return Ok(invoice);
                }
            }
            if !self.commit(&mut invoice, InvoiceStatus::Sweeping, now)? {
                return Ok(invoice);
            }
        }

        // 4. Sweep deadline. The sweep itself is the caller's job.
        if sweep_deadline_passed(&invoice, now, self.config.sweep_deadline) {
            if self.commit(&mut invoice, InvoiceStatus::Failed, now)? {
                tracing::warn!(invoice_id = %invoice.id, "sweep deadline passed, invoice failed");
            }
        }

        Ok(invoice)
    }
}
