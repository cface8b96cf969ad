//! Deterministic deposit-address derivation and wallet resolution.
//!
//! Deposit keys follow BIP-44 for Ethereum (`m/44'/60'/0'/0/{index}`), which is
//! the path every EVM wallet uses for BSC and Polygon as well.

use std::fmt;

use alloy::primitives::Address;
use alloy::signers::local::{coins_bip39::English, MnemonicBuilder, PrivateKeySigner};

use crate::error::{GhostpayError, Result};

/// A derived or imported key pair. The private key never appears in `Debug` output.
#[derive(Clone)]
pub struct WalletKey {
    signer: PrivateKeySigner,
}

impl WalletKey {
    pub fn from_signer(signer: PrivateKeySigner) -> Self {
        Self { signer }
    }

    /// Parse a hex private key, with or without the `0x` prefix.
    pub fn from_private_key(key: &str) -> Result<Self> {
        let key = key.trim();
        let key = key.strip_prefix("0x").unwrap_or(key);
        let signer: PrivateKeySigner = key
            .parse()
            .map_err(|e| GhostpayError::Configuration(format!("invalid private key: {e}")))?;
        Ok(Self { signer })
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// `0x`-prefixed, 64 hex digit private key.
    pub fn private_key_hex(&self) -> String {
        format!("{:#x}", self.signer.to_bytes())
    }

    pub fn signer(&self) -> &PrivateKeySigner {
        &self.signer
    }
}

impl fmt::Debug for WalletKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletKey")
            .field("address", &self.address())
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// Derive the key at `index` from a BIP-39 seed phrase. Pure: the same inputs
/// always produce the same key.
pub fn derive(seed: &str, index: u32) -> Result<WalletKey> {
    let signer = MnemonicBuilder::<English>::default()
        .phrase(seed.trim())
        .index(index)
        .map_err(|e| GhostpayError::Configuration(format!("invalid derivation index {index}: {e}")))?
        .build()
        .map_err(|e| GhostpayError::Configuration(format!("invalid seed phrase: {e}")))?;
    Ok(WalletKey::from_signer(signer))
}

/// Holds the seed material and resolves every wallet the engine signs with or pays to.
#[derive(Clone, Default)]
pub struct WalletDeriver {
    main_mnemonic: Option<String>,
    main_wallet_address: Option<Address>,
    fee_mnemonic: Option<String>,
    fee_private_key: Option<String>,
}

impl WalletDeriver {
    pub fn new(
        main_mnemonic: Option<String>,
        main_wallet_address: Option<Address>,
        fee_mnemonic: Option<String>,
        fee_private_key: Option<String>,
    ) -> Self {
        let non_empty = |s: Option<String>| s.filter(|s| !s.trim().is_empty());
        Self {
            main_mnemonic: non_empty(main_mnemonic),
            main_wallet_address,
            fee_mnemonic: non_empty(fee_mnemonic),
            fee_private_key: non_empty(fee_private_key),
        }
    }

    fn main_seed(&self) -> Result<&str> {
        self.main_mnemonic.as_deref().ok_or_else(|| {
            GhostpayError::Configuration("MAIN_MNEMONIC is required to derive deposit keys".into())
        })
    }

    /// Key controlling the deposit address of invoice index `hd_index`.
    pub fn deposit_key(&self, hd_index: i64) -> Result<WalletKey> {
        let index = u32::try_from(hd_index).map_err(|_| {
            GhostpayError::Validation(format!("hd_index {hd_index} is outside the derivable range"))
        })?;
        derive(self.main_seed()?, index)
    }

    pub fn deposit_address(&self, hd_index: i64) -> Result<Address> {
        Ok(self.deposit_key(hd_index)?.address())
    }

    /// Fee wallet: explicit private key, else index 0 of the fee seed.
    pub fn fee_wallet(&self) -> Result<WalletKey> {
        if let Some(key) = &self.fee_private_key {
            return WalletKey::from_private_key(key);
        }
        if let Some(seed) = &self.fee_mnemonic {
            return derive(seed, 0);
        }
        Err(GhostpayError::Configuration(
            "no fee wallet configured: set FEE_PRIVATE_KEY or FEE_MNEMONIC".to_string(),
        ))
    }

    /// Sweep destination: explicit address, else index 0 of the main seed.
    pub fn main_wallet(&self) -> Result<Address> {
        if let Some(address) = self.main_wallet_address {
            return Ok(address);
        }
        if let Some(seed) = &self.main_mnemonic {
            return Ok(derive(seed, 0)?.address());
        }
        Err(GhostpayError::Configuration(
            "no main wallet configured: set MAIN_WALLET_ADDRESS or MAIN_MNEMONIC".to_string(),
        ))
    }
}

impl fmt::Debug for WalletDeriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |s: &Option<String>| s.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("WalletDeriver")
            .field("main_mnemonic", &redact(&self.main_mnemonic))
            .field("main_wallet_address", &self.main_wallet_address)
            .field("fee_mnemonic", &redact(&self.fee_mnemonic))
            .field("fee_private_key", &redact(&self.fee_private_key))
            .finish()
    }
}
