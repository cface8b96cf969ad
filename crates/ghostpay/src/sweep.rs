//! Two-phase settlement: fund gas from the fee wallet, then move the received
//! funds to the main wallet.
//!
//! Every step records its transaction hash before waiting on it, so an attempt
//! that dies anywhere resumes on the next tick without re-sending anything that
//! may already be on its way. Only the holder of the invoice's sweep lease
//! submits transactions.

use std::sync::Arc;
use std::time::Instant;

use alloy::primitives::{Address, TxHash, U256};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::amount::{buffered_gas_limit, gas_cost};
use crate::chain::{ChainGateway, ChainGateways};
use crate::config::EngineConfig;
use crate::constants::NATIVE_TRANSFER_GAS;
use crate::error::{GhostpayError, Result};
use crate::invoice::{Invoice, InvoiceStatus};
use crate::metrics;
use crate::store::InvoiceStore;
use crate::wallet::{WalletDeriver, WalletKey};
use crate::webhook::{notify_status, Notifier};

/// Result of one settlement attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Funds moved and mined; the invoice is `completed`.
    Completed { tx_out_hash: String },
    /// Nothing sent this time; the invoice stays `sweeping`.
    Deferred { reason: String },
    /// The outbound transfer reverted; the invoice is `failed`.
    Failed { reason: String },
    /// Another attempt holds the lease.
    Busy,
    /// The invoice is no longer `sweeping`.
    Skipped,
}

impl SweepOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Deferred { .. } => "deferred",
            Self::Failed { .. } => "failed",
            Self::Busy => "busy",
            Self::Skipped => "skipped",
        }
    }
}

/// Moves funds off deposit addresses.
pub struct SettlementEngine<G> {
    config: Arc<EngineConfig>,
    store: Arc<InvoiceStore>,
    wallets: WalletDeriver,
    gateways: Arc<ChainGateways<G>>,
    notifier: Arc<dyn Notifier>,
}

impl<G: ChainGateway> SettlementEngine<G> {
    pub fn new(
        config: Arc<EngineConfig>,
        store: Arc<InvoiceStore>,
        gateways: Arc<ChainGateways<G>>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let wallets = config.wallets();
        Self {
            config,
            store,
            wallets,
            gateways,
            notifier,
        }
    }

    /// Claim and settle one `sweeping` invoice.
    ///
    /// Errors leave the invoice `sweeping` with whatever hashes were recorded.
    /// Cancelling `cancel` abandons the attempt at its next await point and
    /// releases the lease.
    pub async fn settle(&self, invoice_id: &str, cancel: &CancellationToken) -> Result<SweepOutcome> {
        let owner = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        if !self
            .store
            .try_claim(invoice_id, &owner, now, self.config.sweep_lease)?
        {
            let outcome = match self.store.get_invoice(invoice_id)? {
                Some(inv) if inv.status == InvoiceStatus::Sweeping => SweepOutcome::Busy,
                Some(_) => SweepOutcome::Skipped,
                None => return Err(GhostpayError::NotFound(format!("invoice {invoice_id}"))),
            };
            return Ok(outcome);
        }

        // Re-read under the lease so recorded hashes are current.
        let invoice = match self.store.get_invoice(invoice_id)? {
            Some(inv) => inv,
            None => return Err(GhostpayError::NotFound(format!("invoice {invoice_id}"))),
        };

        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GhostpayError::Settlement("sweep cancelled".to_string())),
            r = self.sweep_claimed(&invoice, &owner) => r,
        };

        let outcome = match result {
            Ok(Swept::Deferred(reason)) => {
                tracing::info!(invoice_id = %invoice.id, reason = %reason, "sweep deferred");
                Ok(SweepOutcome::Deferred { reason })
            }
            Ok(Swept::Sent(tx_out)) => {
                if self.store.complete_sweep(&invoice.id, &owner, Utc::now())? {
                    tracing::info!(
                        invoice_id = %invoice.id,
                        chain = %invoice.chain,
                        tx = %tx_out,
                        "sweep completed"
                    );
                    metrics::TRANSITIONS
                        .with_label_values(&[InvoiceStatus::Completed.as_str()])
                        .inc();
                    notify_status(self.notifier.as_ref(), &invoice, InvoiceStatus::Completed);
                    Ok(SweepOutcome::Completed { tx_out_hash: tx_out })
                } else {
                    Err(GhostpayError::Settlement(format!(
                        "lease on {} lost before completion",
                        invoice.id
                    )))
                }
            }
            Err(GhostpayError::Reverted(tx)) => {
                if self.store.fail_claimed(&invoice.id, &owner)? {
                    tracing::error!(invoice_id = %invoice.id, tx = %tx, "outbound transfer reverted, invoice failed");
                    metrics::TRANSITIONS
                        .with_label_values(&[InvoiceStatus::Failed.as_str()])
                        .inc();
                    notify_status(self.notifier.as_ref(), &invoice, InvoiceStatus::Failed);
                }
                Ok(SweepOutcome::Failed {
                    reason: format!("transaction {tx} reverted"),
                })
            }
            Err(e) => Err(e),
        };

        // No-op once the invoice is terminal.
        self.store.release_claim(&invoice.id, &owner)?;

        let label = match &outcome {
            Ok(o) => o.label(),
            Err(_) => "error",
        };
        metrics::SWEEPS
            .with_label_values(&[invoice.chain.as_str(), label])
            .inc();
        metrics::SWEEP_LATENCY
            .with_label_values(&[invoice.chain.as_str()])
            .observe(started.elapsed().as_secs_f64());

        outcome
    }

    /// Settle `invoice` while holding its lease.
    async fn sweep_claimed(&self, invoice: &Invoice, owner: &str) -> Result<Swept> {
        let gateway = self.gateways.get(invoice.chain)?;
        let main = self.wallets.main_wallet()?;
        let deposit = self.wallets.deposit_key(invoice.hd_index)?;
        if deposit.address() != invoice.deposit_address {
            return Err(GhostpayError::Configuration(format!(
                "deposit key for index {} derives {}, invoice expects {}; was MAIN_MNEMONIC changed?",
                invoice.hd_index,
                deposit.address(),
                invoice.deposit_address
            )));
        }

        if let Some(tx_out) = &invoice.tx_out_hash {
            return self.await_outbound(gateway, invoice, tx_out).await;
        }

        if invoice.token.is_native() {
            self.sweep_native(gateway, invoice, owner, &deposit, main).await
        } else {
            self.sweep_token(gateway, invoice, owner, &deposit, main).await
        }
    }

    /// Resume: the outbound transfer was already sent, only its receipt matters.
    async fn await_outbound(&self, gateway: &G, invoice: &Invoice, tx_out: &str) -> Result<Swept> {
        tracing::info!(invoice_id = %invoice.id, tx = %tx_out, "resuming sweep, waiting on recorded transfer");
        let tx_hash = parse_tx_hash(tx_out)?;
        let receipt = gateway
            .wait_for_receipt(tx_hash, self.config.receipt_timeout)
            .await?;
        if !receipt.success {
            return Err(GhostpayError::Reverted(tx_out.to_string()));
        }
        Ok(Swept::Sent(tx_out.to_string()))
    }

    async fn sweep_token(
        &self,
        gateway: &G,
        invoice: &Invoice,
        owner: &str,
        deposit: &WalletKey,
        main: Address,
    ) -> Result<Swept> {
        let fee_wallet = self.wallets.fee_wallet()?;
        let timeout = self.config.receipt_timeout;

        // An earlier funding transfer must be mined before the balance says anything.
        if let Some(gas_tx) = &invoice.gas_tx_hash {
            let receipt = gateway
                .wait_for_receipt(parse_tx_hash(gas_tx)?, timeout)
                .await?;
            if !receipt.success {
                tracing::warn!(invoice_id = %invoice.id, tx = %gas_tx, "recorded gas funding reverted");
            }
        }

        // The transfer goes out with exactly the limit and price funded here.
        let gas_price = gateway.gas_price().await?;
        let gas_units = gateway.estimate_transfer_gas(invoice.token).await?;
        let gas_limit = buffered_gas_limit(gas_units, self.config.gas_buffer_percent);
        let needed = U256::from(gas_limit) * U256::from(gas_price);
        let native = gateway.native_balance(deposit.address()).await?;

        if native < needed {
            let deficit = needed - native;
            let gas_tx = gateway
                .send_native(&fee_wallet, deposit.address(), deficit, Some(gas_price))
                .await?;
            let gas_tx_str = format!("{gas_tx}");
            if !self.store.record_gas_tx(&invoice.id, owner, &gas_tx_str)? {
                if invoice.gas_tx_hash.is_none() {
                    return Err(lease_lost(invoice, "gas funding", &gas_tx_str));
                }
                tracing::warn!(
                    invoice_id = %invoice.id,
                    tx = %gas_tx_str,
                    "gas_tx_hash already recorded, keeping the first funding reference"
                );
            }
            tracing::info!(
                invoice_id = %invoice.id,
                chain = %invoice.chain,
                deficit = %deficit,
                tx = %gas_tx_str,
                "funded deposit address with gas"
            );
            let receipt = gateway.wait_for_receipt(gas_tx, timeout).await?;
            if !receipt.success {
                return Err(GhostpayError::Settlement(format!(
                    "gas funding {gas_tx_str} reverted"
                )));
            }
        }

        let balance = gateway
            .token_balance(deposit.address(), invoice.token)
            .await?;
        if balance.is_zero() {
            return Err(GhostpayError::Settlement(format!(
                "deposit address {} holds no {}",
                deposit.address(),
                invoice.token
            )));
        }

        let tx_out = gateway
            .send_token(deposit, invoice.token, main, balance, gas_limit, gas_price)
            .await?;
        let tx_out_str = format!("{tx_out}");
        if !self.store.record_tx_out(&invoice.id, owner, &tx_out_str)? {
            return Err(lease_lost(invoice, "outbound transfer", &tx_out_str));
        }

        let receipt = gateway.wait_for_receipt(tx_out, timeout).await?;
        if !receipt.success {
            return Err(GhostpayError::Reverted(tx_out_str));
        }

        if self.config.refund_gas_remainder {
            if let Err(e) = self
                .refund_remainder(gateway, deposit, fee_wallet.address())
                .await
            {
                tracing::warn!(invoice_id = %invoice.id, error = %e, "gas remainder refund failed");
            }
        }

        Ok(Swept::Sent(tx_out_str))
    }

    async fn sweep_native(
        &self,
        gateway: &G,
        invoice: &Invoice,
        owner: &str,
        deposit: &WalletKey,
        main: Address,
    ) -> Result<Swept> {
        let gas_price = gateway.gas_price().await?;
        let needed = gas_cost(
            NATIVE_TRANSFER_GAS,
            gas_price,
            self.config.gas_buffer_percent,
        );
        let balance = gateway.native_balance(deposit.address()).await?;

        if balance <= needed {
            return Ok(Swept::Deferred(format!(
                "balance {balance} does not cover gas {needed}"
            )));
        }
        let amount = balance - needed;

        let tx_out = gateway
            .send_native(deposit, main, amount, Some(gas_price))
            .await?;
        let tx_out_str = format!("{tx_out}");
        if !self.store.record_tx_out(&invoice.id, owner, &tx_out_str)? {
            return Err(lease_lost(invoice, "outbound transfer", &tx_out_str));
        }

        let receipt = gateway
            .wait_for_receipt(tx_out, self.config.receipt_timeout)
            .await?;
        if !receipt.success {
            return Err(GhostpayError::Reverted(tx_out_str));
        }
        Ok(Swept::Sent(tx_out_str))
    }

    /// Return native leftovers above one transfer fee plus the reserve to the fee wallet.
    async fn refund_remainder(&self, gateway: &G, deposit: &WalletKey, fee_wallet: Address) -> Result<()> {
        let gas_price = gateway.gas_price().await?;
        let keep = U256::from(NATIVE_TRANSFER_GAS) * U256::from(gas_price)
            + self.config.refund_reserve_wei;
        let remaining = gateway.native_balance(deposit.address()).await?;
        if remaining <= keep {
            return Ok(());
        }
        let refund = remaining - keep;
        let tx = gateway
            .send_native(deposit, fee_wallet, refund, Some(gas_price))
            .await?;
        tracing::info!(from = %deposit.address(), amount = %refund, tx = %tx, "gas remainder refunded");
        Ok(())
    }
}

enum Swept {
    /// Outbound transfer mined successfully.
    Sent(String),
    Deferred(String),
}

/// A transaction left the node but its hash could not be recorded because the
/// lease moved on. The hash is only in the log from here on.
fn lease_lost(invoice: &Invoice, what: &str, tx: &str) -> GhostpayError {
    tracing::error!(
        invoice_id = %invoice.id,
        chain = %invoice.chain,
        tx = %tx,
        "{what} broadcast after the sweep lease was lost, hash not recorded"
    );
    GhostpayError::Settlement(format!(
        "lease on {} lost, unrecorded {what} {tx}",
        invoice.id
    ))
}

fn parse_tx_hash(raw: &str) -> Result<TxHash> {
    raw.parse()
        .map_err(|e| GhostpayError::Settlement(format!("invalid recorded tx hash '{raw}': {e}")))
}
