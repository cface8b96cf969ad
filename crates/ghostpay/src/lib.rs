//! Invoice settlement engine for crypto payments on BSC and Polygon.
//!
//! Each invoice gets its own deposit address derived from the merchant's seed
//! phrase. A reconciliation loop watches those addresses, moves invoices
//! through their lifecycle and sweeps received funds to the main wallet,
//! topping up gas from a fee wallet when a token deposit needs it.
//!
//! # Components
//!
//! - **Wallets** ([`WalletDeriver`]): BIP-44 deposit keys, fee and main wallet
//! - **Chain access** ([`ChainGateway`], [`EvmGateway`]): balances, gas, submission, receipts
//! - **Store** ([`InvoiceStore`]): SQLite, compare-and-swap status updates, sweep leases
//! - **State machine** ([`StateMachine`]): expiry, payment detection, confirmation depth
//! - **Settlement** ([`SettlementEngine`]): gas funding then transfer, resumable
//! - **Loop** ([`ReconciliationLoop`]): periodic driver with a bounded sweep pool
//! - **Webhooks** ([`HttpNotifier`]): best-effort status callbacks
//! - **Credentials** ([`Credentials`]): hashed API keys
//!
//! # Quick example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ghostpay::{
//!     ChainGateways, EngineConfig, EvmGateway, HttpNotifier, InvoiceService, InvoiceStore,
//!     NewInvoice,
//! };
//!
//! # fn main() -> ghostpay::Result<()> {
//! let config = Arc::new(EngineConfig::from_env()?);
//! let store = Arc::new(InvoiceStore::open(&config.db_path)?);
//! let gateways = Arc::new(ChainGateways::new(
//!     config.chains.iter().cloned().map(EvmGateway::new).collect::<ghostpay::Result<Vec<_>>>()?,
//! ));
//! let notifier = Arc::new(HttpNotifier::new(config.webhook_secret.clone())?);
//! let invoices = InvoiceService::new(config, store, gateways, notifier);
//!
//! let created = invoices.create(NewInvoice {
//!     chain: "BSC".into(),
//!     token: "USDT".into(),
//!     amount_native: Some("25.00".into()),
//!     ..Default::default()
//! })?;
//! println!("pay to {}", created.deposit_address);
//! # Ok(())
//! # }
//! ```

// Core types
pub mod amount;
pub mod config;
pub mod constants;
pub mod error;
pub mod invoice;

// Keys and chain access
pub mod chain;
pub mod erc20;
pub mod wallet;

// Persistence and credentials
pub mod credentials;
pub mod store;

// Lifecycle
pub mod machine;
pub mod reconcile;
pub mod service;
pub mod sweep;

// Outbound notifications and observability
pub mod hmac;
pub mod metrics;
pub mod network;
pub mod webhook;

// Re-exports
pub use chain::{ChainGateway, ChainGateways, EvmGateway, TxReceipt};
pub use config::{ConfigError, EngineConfig};
pub use constants::{Chain, ChainConfig, Token};
pub use credentials::{ApiCredential, Credentials, IssuedCredential, API_KEY_HEADER};
pub use error::{GhostpayError, Result};
pub use invoice::{CreatedInvoice, Invoice, InvoiceFilter, InvoicePage, InvoiceStatus, NewInvoice};
pub use machine::StateMachine;
pub use reconcile::{ReconciliationLoop, TickReport};
pub use service::{FeeWalletBalance, InvoiceService};
pub use store::InvoiceStore;
pub use sweep::{SettlementEngine, SweepOutcome};
pub use wallet::{WalletDeriver, WalletKey};
pub use webhook::{HttpNotifier, Notifier, WebhookPayload};
