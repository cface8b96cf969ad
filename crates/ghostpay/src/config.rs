use std::env;
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::{Address, U256};
use url::Url;

use crate::constants::{Chain, ChainConfig};
use crate::error::GhostpayError;
use crate::wallet::WalletDeriver;

const DEFAULT_DB_PATH: &str = "data/ghost.db";
const DEFAULT_PAYMENT_PATH: &str = "pay";
const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_INVOICE_TTL_MINUTES: i64 = 30;
const DEFAULT_GAS_BUFFER_PERCENT: u32 = 20;
const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 20;
const DEFAULT_SWEEP_WORKERS: usize = 4;
const DEFAULT_RECEIPT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_SWEEP_DEADLINE_MINUTES: i64 = 1440;
const DEFAULT_SWEEP_LEASE_SECS: i64 = 600;

/// Engine configuration, built once at startup and passed into constructors.
#[derive(Clone)]
pub struct EngineConfig {
    /// SQLite database path
    pub db_path: String,
    /// Seed phrase deposit addresses are derived from
    pub main_mnemonic: Option<String>,
    /// Sweep destination override
    pub main_wallet_address: Option<Address>,
    /// Seed phrase of the gas-funding wallet
    pub fee_mnemonic: Option<String>,
    /// Private key of the gas-funding wallet (takes precedence over `fee_mnemonic`)
    pub fee_private_key: Option<String>,
    /// One entry per supported chain
    pub chains: Vec<ChainConfig>,
    /// Public base URL payment links are built from
    pub public_base_url: String,
    /// Path segment of the payment page (`{base}/{payment_path}/pay/{id}`)
    pub payment_path: String,
    pub invoice_ttl: chrono::Duration,
    /// Safety margin added to every gas estimate, in percent
    pub gas_buffer_percent: u32,
    pub poll_interval: Duration,
    /// Maximum concurrent sweeps
    pub sweep_workers: usize,
    pub receipt_timeout: Duration,
    /// Invoices still sweeping this long after confirmation are failed
    pub sweep_deadline: chrono::Duration,
    /// How long a sweep claim stays valid before another attempt may take over
    pub sweep_lease: chrono::Duration,
    /// Return leftover gas from deposit addresses to the fee wallet after a token sweep
    pub refund_gas_remainder: bool,
    /// Wei kept on the deposit address on top of the refund transfer's own fee
    pub refund_reserve_wei: U256,
    /// HMAC key for webhook signatures (None = unsigned webhooks)
    pub webhook_secret: Option<Vec<u8>>,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("db_path", &self.db_path)
            .field("main_mnemonic", &self.main_mnemonic.as_ref().map(|_| "[REDACTED]"))
            .field("main_wallet_address", &self.main_wallet_address)
            .field("fee_mnemonic", &self.fee_mnemonic.as_ref().map(|_| "[REDACTED]"))
            .field(
                "fee_private_key",
                &self.fee_private_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("chains", &self.chains)
            .field("public_base_url", &self.public_base_url)
            .field("payment_path", &self.payment_path)
            .field("invoice_ttl", &self.invoice_ttl)
            .field("gas_buffer_percent", &self.gas_buffer_percent)
            .field("poll_interval", &self.poll_interval)
            .field("sweep_workers", &self.sweep_workers)
            .field("receipt_timeout", &self.receipt_timeout)
            .field("sweep_deadline", &self.sweep_deadline)
            .field("sweep_lease", &self.sweep_lease)
            .field("refund_gas_remainder", &self.refund_gas_remainder)
            .field("refund_reserve_wei", &self.refund_reserve_wei)
            .field(
                "webhook_secret",
                &self.webhook_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            main_mnemonic: None,
            main_wallet_address: None,
            fee_mnemonic: None,
            fee_private_key: None,
            chains: Chain::ALL.iter().map(|c| ChainConfig::for_chain(*c)).collect(),
            public_base_url: DEFAULT_PUBLIC_BASE_URL.to_string(),
            payment_path: DEFAULT_PAYMENT_PATH.to_string(),
            invoice_ttl: chrono::Duration::minutes(DEFAULT_INVOICE_TTL_MINUTES),
            gas_buffer_percent: DEFAULT_GAS_BUFFER_PERCENT,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECONDS),
            sweep_workers: DEFAULT_SWEEP_WORKERS,
            receipt_timeout: Duration::from_secs(DEFAULT_RECEIPT_TIMEOUT_SECS),
            sweep_deadline: chrono::Duration::minutes(DEFAULT_SWEEP_DEADLINE_MINUTES),
            sweep_lease: chrono::Duration::seconds(DEFAULT_SWEEP_LEASE_SECS),
            refund_gas_remainder: true,
            refund_reserve_wei: U256::ZERO,
            webhook_secret: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path = env::var("DB_PATH").unwrap_or(defaults.db_path);

        // Optional: key material. Missing material only fails the operation needing it.
        let main_mnemonic = non_empty_var("MAIN_MNEMONIC");
        let fee_mnemonic = non_empty_var("FEE_MNEMONIC");
        let fee_private_key = non_empty_var("FEE_PRIVATE_KEY");
        let main_wallet_address = match non_empty_var("MAIN_WALLET_ADDRESS") {
            Some(raw) => Some(
                raw.trim()
                    .parse::<Address>()
                    .map_err(|_| ConfigError::InvalidAddress(raw))?,
            ),
            None => None,
        };

        let mut bsc = ChainConfig::bsc();
        apply_chain_overrides(&mut bsc, "BSC")?;
        let mut polygon = ChainConfig::polygon();
        apply_chain_overrides(&mut polygon, "POLYGON")?;

        let public_base_url =
            non_empty_var("PUBLIC_BASE_URL").unwrap_or(defaults.public_base_url);
        Url::parse(&public_base_url)
            .map_err(|_| ConfigError::InvalidUrl(public_base_url.clone()))?;
        let payment_path = non_empty_var("PAYMENT_PATH")
            .map(|p| p.trim_matches('/').to_string())
            .unwrap_or(defaults.payment_path);

        let sweep_workers: usize = parse_var("SWEEP_WORKERS", DEFAULT_SWEEP_WORKERS)?;

        let refund_gas_remainder = env::var("REFUND_GAS_REMAINDER")
            .map(|v| !matches!(v.trim(), "false" | "0" | "no"))
            .unwrap_or(true);

        let webhook_secret = non_empty_var("WEBHOOK_SECRET").map(|s| s.into_bytes());
        if let Some(ref secret) = webhook_secret {
            if secret.len() < 32 {
                tracing::warn!(
                    "WEBHOOK_SECRET is short ({} bytes, recommended 32+); \
                     use `openssl rand -hex 32` to generate one",
                    secret.len()
                );
            }
        }

        if main_mnemonic.is_none() {
            tracing::warn!("MAIN_MNEMONIC not set; invoices cannot be created or swept");
        }

        let config = Self {
            db_path,
            main_mnemonic,
            main_wallet_address,
            fee_mnemonic,
            fee_private_key,
            chains: vec![bsc, polygon],
            public_base_url,
            payment_path,
            invoice_ttl: chrono::Duration::minutes(parse_var(
                "INVOICE_TTL_MINUTES",
                DEFAULT_INVOICE_TTL_MINUTES,
            )?),
            gas_buffer_percent: parse_var("GAS_BUFFER_PERCENT", DEFAULT_GAS_BUFFER_PERCENT)?,
            poll_interval: Duration::from_secs(parse_var(
                "POLL_INTERVAL_SECONDS",
                DEFAULT_POLL_INTERVAL_SECONDS,
            )?),
            sweep_workers,
            receipt_timeout: Duration::from_secs(parse_var(
                "RECEIPT_TIMEOUT_SECS",
                DEFAULT_RECEIPT_TIMEOUT_SECS,
            )?),
            sweep_deadline: chrono::Duration::minutes(parse_var(
                "SWEEP_DEADLINE_MINUTES",
                DEFAULT_SWEEP_DEADLINE_MINUTES,
            )?),
            sweep_lease: chrono::Duration::seconds(parse_var(
                "SWEEP_LEASE_SECS",
                DEFAULT_SWEEP_LEASE_SECS,
            )?),
            refund_gas_remainder,
            refund_reserve_wei: parse_var("REFUND_RESERVE_WEI", U256::ZERO)?,
            webhook_secret,
        };
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks on values that parse fine on their own.
    ///
    /// A token sweep may wait on up to three receipts while holding its lease
    /// (earlier gas funding, fresh gas funding, outbound transfer), so the
    /// lease must outlast all three.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_workers == 0 {
            return Err(ConfigError::InvalidNumber {
                var: "SWEEP_WORKERS",
                value: "0".to_string(),
            });
        }
        let receipt_secs = i64::try_from(self.receipt_timeout.as_secs()).unwrap_or(i64::MAX);
        if self.sweep_lease.num_seconds() <= receipt_secs.saturating_mul(3) {
            return Err(ConfigError::LeaseTooShort {
                lease_secs: self.sweep_lease.num_seconds(),
                receipt_timeout_secs: self.receipt_timeout.as_secs(),
            });
        }
        Ok(())
    }

    /// Wallet resolver over the configured key material.
    pub fn wallets(&self) -> WalletDeriver {
        WalletDeriver::new(
            self.main_mnemonic.clone(),
            self.main_wallet_address,
            self.fee_mnemonic.clone(),
            self.fee_private_key.clone(),
        )
    }

    pub fn chain(&self, chain: Chain) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain == chain)
    }

    /// Confirmation depth required on `chain` (zero when the chain is not configured).
    pub fn confirmations(&self, chain: Chain) -> u64 {
        self.chain(chain).map(|c| c.confirmations).unwrap_or(0)
    }

    /// Customer-facing payment page of an invoice.
    pub fn payment_url(&self, invoice_id: &str) -> String {
        format!(
            "{}/{}/pay/{}",
            self.public_base_url.trim_end_matches('/'),
            self.payment_path,
            invoice_id
        )
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn parse_var<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match non_empty_var(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
        None => Ok(default),
    }
}

fn apply_chain_overrides(config: &mut ChainConfig, prefix: &'static str) -> Result<(), ConfigError> {
    if let Some(rpc_url) = non_empty_var(&format!("{prefix}_RPC_URL")) {
        Url::parse(&rpc_url).map_err(|_| ConfigError::InvalidUrl(rpc_url.clone()))?;
        config.rpc_url = rpc_url;
    }
    if let Some(raw) = non_empty_var(&format!("{prefix}_USDT_CONTRACT")) {
        config.usdt_contract = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(raw))?;
    }
    config.usdt_decimals = parse_var(
        match prefix {
            "BSC" => "BSC_USDT_DECIMALS",
            _ => "POLYGON_USDT_DECIMALS",
        },
        config.usdt_decimals,
    )?;
    let confirmations_var = match prefix {
        "BSC" => "BSC_CONFIRMATIONS",
        _ => "POLYGON_CONFIRMATIONS",
    };
    config.confirmations = parse_var(confirmations_var, config.confirmations)?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(
        "SWEEP_LEASE_SECS ({lease_secs}) must exceed three receipt timeouts \
         (RECEIPT_TIMEOUT_SECS = {receipt_timeout_secs})"
    )]
    LeaseTooShort {
        lease_secs: i64,
        receipt_timeout_secs: u64,
    },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid value for {var}: {value}")]
    InvalidNumber { var: &'static str, value: String },
}

impl From<ConfigError> for GhostpayError {
    fn from(err: ConfigError) -> Self {
        GhostpayError::Configuration(err.to_string())
    }
}
