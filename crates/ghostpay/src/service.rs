//! Caller-facing invoice operations: creation, cancellation, operator failure,
//! status and listing.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::amount::validate_positive;
use crate::chain::{ChainGateway, ChainGateways};
use crate::config::EngineConfig;
use crate::constants::{Chain, Token};
use crate::error::{GhostpayError, Result};
use crate::invoice::{
    CreatedInvoice, Invoice, InvoiceFilter, InvoicePage, InvoiceStatus, NewInvoice,
};
use crate::machine::ensure_transition;
use crate::metrics;
use crate::store::{InvoiceDraft, InvoiceStore};
use crate::wallet::WalletDeriver;
use crate::webhook::{notify_status, validate_webhook_url, Notifier};

/// Native balance of the fee wallet on one chain.
#[derive(Debug, Clone, Serialize)]
pub struct FeeWalletBalance {
    pub chain: Chain,
    pub address: Address,
    /// Wei; `None` when the chain could not be queried.
    pub balance: Option<U256>,
    pub error: Option<String>,
}

pub struct InvoiceService<G> {
    config: Arc<EngineConfig>,
    store: Arc<InvoiceStore>,
    wallets: WalletDeriver,
    gateways: Arc<ChainGateways<G>>,
    notifier: Arc<dyn Notifier>,
}

impl<G: ChainGateway> InvoiceService<G> {
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

    /// Validate `request` and persist a new `pending` invoice under a fresh
    /// derivation index. Nothing is consumed when validation fails.
    pub fn create(&self, request: NewInvoice) -> Result<CreatedInvoice> {
        let chain = Chain::parse(&request.chain).ok_or_else(|| {
            GhostpayError::Validation(format!(
                "unsupported chain '{}', expected BSC or POLYGON",
                request.chain
            ))
        })?;
        let token = Token::parse(&request.token).ok_or_else(|| {
            GhostpayError::Validation(format!(
                "unsupported token '{}', expected USDT, BNB or POL",
                request.token
            ))
        })?;
        if !token.supported_on(chain) {
            return Err(GhostpayError::Validation(format!(
                "token {token} is not available on {chain}"
            )));
        }

        let amount = request
            .amount_native
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| GhostpayError::Validation("amount_native is required".to_string()))?
            .to_string();
        let decimals = self
            .config
            .chain(chain)
            .ok_or_else(|| GhostpayError::Configuration(format!("{chain} is not configured")))?
            .token_decimals(token);
        validate_positive(&amount, decimals)?;

        if let Some(usd) = request.amount_usd {
            if !usd.is_finite() || usd < 0.0 {
                return Err(GhostpayError::Validation(
                    "amount_usd must be a non-negative number".to_string(),
                ));
            }
        }

        let webhook_url = match request.webhook_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Some(validate_webhook_url(url)?),
            _ => None,
        };

        let now = Utc::now();
        let draft = InvoiceDraft {
            id: uuid::Uuid::new_v4().simple().to_string(),
            chain,
            token,
            amount_requested: amount,
            amount_usd: request.amount_usd,
            webhook_url,
            metadata: request.metadata,
            created_at: now,
            expires_at: now + self.config.invoice_ttl,
        };
        let invoice = self
            .store
            .insert_invoice(draft, |index| self.wallets.deposit_address(index))?;

        tracing::info!(
            invoice_id = %invoice.id,
            chain = %invoice.chain,
            token = %invoice.token,
            amount = %invoice.amount_requested,
            hd_index = invoice.hd_index,
            deposit_address = %invoice.deposit_address,
            "invoice created"
        );
        metrics::TRANSITIONS
            .with_label_values(&[InvoiceStatus::Pending.as_str()])
            .inc();

        Ok(CreatedInvoice {
            payment_url: self.config.payment_url(&invoice.id),
            invoice_id: invoice.id,
            deposit_address: invoice.deposit_address,
            chain: invoice.chain,
            token: invoice.token,
            amount_native: invoice.amount_requested,
            expires_at: invoice.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            status: invoice.status,
        })
    }

    pub fn get(&self, id: &str) -> Result<Invoice> {
        self.store
            .get_invoice(id)?
            .ok_or_else(|| GhostpayError::NotFound(format!("invoice {id}")))
    }

    pub fn current_status(&self, id: &str) -> Result<InvoiceStatus> {
        Ok(self.get(id)?.status)
    }

    /// Cancel an unpaid invoice (`pending` or `underpaid` -> `expired`).
    pub fn cancel(&self, id: &str) -> Result<Invoice> {
        self.force(id, InvoiceStatus::Expired, "invoice cancelled")
    }

    /// Operator action: fail any non-terminal invoice. A sweep holding a live
    /// lease must finish or lapse first.
    pub fn fail(&self, id: &str) -> Result<Invoice> {
        self.force(id, InvoiceStatus::Failed, "invoice failed by operator")
    }

    fn force(&self, id: &str, to: InvoiceStatus, message: &'static str) -> Result<Invoice> {
        let mut invoice = self.get(id)?;
        ensure_transition(id, invoice.status, to)?;

        if !self
            .store
            .transition(id, invoice.status, to, Utc::now())?
        {
            // Lost a race with the reconciliation loop or a live sweep lease.
            let current = self.current_status(id)?;
            return Err(GhostpayError::InvalidTransition {
                id: id.to_string(),
                from: current,
                to,
            });
        }

        tracing::info!(invoice_id = %id, from = %invoice.status, to = %to, "{message}");
        invoice.status = to;
        metrics::TRANSITIONS.with_label_values(&[to.as_str()]).inc();
        notify_status(self.notifier.as_ref(), &invoice, to);
        Ok(invoice)
    }

    pub fn list(&self, filter: InvoiceFilter, page: u32, limit: u32) -> Result<InvoicePage> {
        self.store.list_invoices(filter, page, limit)
    }

    pub fn status_counts(&self) -> Result<HashMap<InvoiceStatus, u64>> {
        self.store.status_counts()
    }

    /// Fee wallet address and native balance on each configured chain.
    pub async fn fee_wallet_balances(&self) -> Result<Vec<FeeWalletBalance>> {
        let address = self.wallets.fee_wallet()?.address();
        let mut report = Vec::new();
        for chain in Chain::ALL {
            let Ok(gateway) = self.gateways.get(chain) else {
                continue;
            };
            let (balance, error) = match gateway.native_balance(address).await {
                Ok(b) => (Some(b), None),
                Err(e) => {
                    tracing::warn!(chain = %chain, error = %e, "fee wallet balance unavailable");
                    (None, Some(e.to_string()))
                }
            };
            report.push(FeeWalletBalance {
                chain,
                address,
                balance,
                error,
            });
        }
        Ok(report)
    }
}
