use std::fmt;

use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{Chain, Token};

/// Lifecycle state of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    /// Waiting for payment.
    Pending,
    /// Some funds arrived, less than requested.
    Underpaid,
    /// Full payment observed, waiting for block confirmations.
    Confirming,
    /// Funds are being moved to the main wallet.
    Sweeping,
    Completed,
    Expired,
    Failed,
}

impl InvoiceStatus {
    pub const LIVE: [InvoiceStatus; 4] = [
        Self::Pending,
        Self::Underpaid,
        Self::Confirming,
        Self::Sweeping,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Underpaid => "underpaid",
            Self::Confirming => "confirming",
            Self::Sweeping => "sweeping",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "underpaid" => Some(Self::Underpaid),
            "confirming" => Some(Self::Confirming),
            "sweeping" => Some(Self::Sweeping),
            "completed" => Some(Self::Completed),
            "expired" => Some(Self::Expired),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Expired | Self::Failed)
    }

    /// States that may be cancelled or expire.
    pub fn is_awaiting_payment(&self) -> bool {
        matches!(self, Self::Pending | Self::Underpaid)
    }

    /// Whether entering this state notifies the invoice's webhook.
    pub fn notifies(&self) -> bool {
        self.is_terminal() || *self == Self::Confirming
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub chain: Chain,
    pub token: Token,
    /// Requested amount as a human decimal string in the asset's units.
    pub amount_requested: String,
    pub amount_usd: Option<f64>,
    pub deposit_address: Address,
    pub hd_index: i64,
    pub status: InvoiceStatus,
    pub gas_tx_hash: Option<String>,
    pub tx_out_hash: Option<String>,
    pub webhook_url: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Block height at which the full payment was first observed.
    pub confirmed_block: Option<u64>,
}

impl Invoice {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Caller input for invoice creation. Strings are validated, not trusted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewInvoice {
    pub chain: String,
    pub token: String,
    #[serde(default)]
    pub amount_native: Option<String>,
    #[serde(default)]
    pub amount_usd: Option<f64>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Creation response handed back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedInvoice {
    pub invoice_id: String,
    pub deposit_address: Address,
    pub chain: Chain,
    pub token: Token,
    pub amount_native: String,
    pub payment_url: String,
    pub expires_at: String,
    pub status: InvoiceStatus,
}

/// Filter for invoice listings.
#[derive(Debug, Clone, Copy, Default)]
pub struct InvoiceFilter {
    pub status: Option<InvoiceStatus>,
    pub chain: Option<Chain>,
}

/// One page of an invoice listing.
#[derive(Debug, Clone, Serialize)]
pub struct InvoicePage {
    pub invoices: Vec<Invoice>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}
