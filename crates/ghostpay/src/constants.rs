use std::fmt;

use alloy::primitives::{address, Address};
use serde::{Deserialize, Serialize};

use crate::error::{GhostpayError, Result};

/// BNB Smart Chain mainnet chain ID.
pub const BSC_CHAIN_ID: u64 = 56;

/// Polygon PoS mainnet chain ID.
pub const POLYGON_CHAIN_ID: u64 = 137;

pub const BSC_RPC_URL: &str = "https://bsc-dataseed.binance.org";
pub const POLYGON_RPC_URL: &str = "https://polygon-rpc.com";

/// USDT (BEP-20) on BNB Smart Chain.
pub const BSC_USDT: Address = address!("55d398326f99059fF775485246999027B3197955");

/// USDT (PoS bridged) on Polygon.
pub const POLYGON_USDT: Address = address!("c2132D05D31c914a87C6611C10748AEb04B58e8F");

/// Gas units consumed by a plain value transfer.
pub const NATIVE_TRANSFER_GAS: u64 = 21_000;

/// Gas units budgeted for an ERC-20 `transfer`, before the buffer.
pub const TOKEN_TRANSFER_GAS: u64 = 65_000;

/// Native assets on both supported chains use 18 decimals.
pub const NATIVE_DECIMALS: u8 = 18;

/// Binance-Peg USDT is an 18-decimal token.
pub const BSC_USDT_DECIMALS: u8 = 18;

/// Bridged USDT on Polygon keeps Ethereum's 6 decimals.
pub const POLYGON_USDT_DECIMALS: u8 = 6;

/// Supported EVM chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Chain {
    #[serde(rename = "BSC")]
    Bsc,
    #[serde(rename = "POLYGON")]
    Polygon,
}

impl Chain {
    pub const ALL: [Chain; 2] = [Chain::Bsc, Chain::Polygon];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bsc => "BSC",
            Self::Polygon => "POLYGON",
        }
    }

    /// Case-insensitive parse of the wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BSC" => Some(Self::Bsc),
            "POLYGON" => Some(Self::Polygon),
            _ => None,
        }
    }

    pub fn chain_id(&self) -> u64 {
        match self {
            Self::Bsc => BSC_CHAIN_ID,
            Self::Polygon => POLYGON_CHAIN_ID,
        }
    }

    /// The gas currency of this chain.
    pub fn native_token(&self) -> Token {
        match self {
            Self::Bsc => Token::Bnb,
            Self::Polygon => Token::Pol,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assets an invoice can be denominated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Token {
    #[serde(rename = "USDT")]
    Usdt,
    #[serde(rename = "BNB")]
    Bnb,
    #[serde(rename = "POL")]
    Pol,
}

impl Token {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usdt => "USDT",
            Self::Bnb => "BNB",
            Self::Pol => "POL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USDT" => Some(Self::Usdt),
            "BNB" => Some(Self::Bnb),
            "POL" => Some(Self::Pol),
            _ => None,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, Self::Bnb | Self::Pol)
    }

    /// Whether the asset exists on `chain`. Native assets only live on their own chain.
    pub fn supported_on(&self, chain: Chain) -> bool {
        match self {
            Self::Usdt => true,
            native => chain.native_token() == *native,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime configuration of one chain gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub chain: Chain,
    pub chain_id: u64,
    pub rpc_url: String,
    /// Chain uses proof-of-authority header extensions; the gateway sends
    /// legacy gas-price transactions for it.
    pub poa: bool,
    pub usdt_contract: Address,
    pub usdt_decimals: u8,
    /// Block confirmations required between payment detection and sweeping.
    pub confirmations: u64,
}

impl ChainConfig {
    pub fn bsc() -> Self {
        Self {
            chain: Chain::Bsc,
            chain_id: BSC_CHAIN_ID,
            rpc_url: BSC_RPC_URL.to_string(),
            poa: true,
            usdt_contract: BSC_USDT,
            usdt_decimals: BSC_USDT_DECIMALS,
            confirmations: 3,
        }
    }

    pub fn polygon() -> Self {
        Self {
            chain: Chain::Polygon,
            chain_id: POLYGON_CHAIN_ID,
            rpc_url: POLYGON_RPC_URL.to_string(),
            poa: true,
            usdt_contract: POLYGON_USDT,
            usdt_decimals: POLYGON_USDT_DECIMALS,
            confirmations: 1,
        }
    }

    pub fn for_chain(chain: Chain) -> Self {
        match chain {
            Chain::Bsc => Self::bsc(),
            Chain::Polygon => Self::polygon(),
        }
    }

    /// Decimal places `token` is denominated in on this chain.
    pub fn token_decimals(&self, token: Token) -> u8 {
        match token {
            Token::Usdt => self.usdt_decimals,
            _ => NATIVE_DECIMALS,
        }
    }

    /// Contract address backing a non-native token on this chain.
    pub fn token_contract(&self, token: Token) -> Result<Address> {
        match token {
            Token::Usdt => Ok(self.usdt_contract),
            native => Err(GhostpayError::Validation(format!(
                "{native} is a native asset on {}, it has no contract",
                self.chain
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_and_token_parse_case_insensitively() {
        assert_eq!(Chain::parse("bsc"), Some(Chain::Bsc));
        assert_eq!(Chain::parse(" Polygon "), Some(Chain::Polygon));
        assert_eq!(Chain::parse("ETHEREUM"), None);
        assert_eq!(Token::parse("usdt"), Some(Token::Usdt));
        assert_eq!(Token::parse("eth"), None);
    }

    #[test]
    fn native_tokens_bound_to_their_chain() {
        assert!(Token::Usdt.supported_on(Chain::Bsc));
        assert!(Token::Usdt.supported_on(Chain::Polygon));
        assert!(Token::Bnb.supported_on(Chain::Bsc));
        assert!(!Token::Bnb.supported_on(Chain::Polygon));
        assert!(Token::Pol.supported_on(Chain::Polygon));
        assert!(!Token::Pol.supported_on(Chain::Bsc));
    }

    #[test]
    fn native_token_has_no_contract() {
        let cfg = ChainConfig::bsc();
        assert_eq!(cfg.token_contract(Token::Usdt).unwrap(), BSC_USDT);
        assert!(cfg.token_contract(Token::Bnb).is_err());
    }

    #[test]
    fn stablecoin_decimals_differ_per_chain() {
        assert_eq!(ChainConfig::bsc().token_decimals(Token::Usdt), 18);
        assert_eq!(ChainConfig::polygon().token_decimals(Token::Usdt), 6);
        assert_eq!(ChainConfig::polygon().token_decimals(Token::Pol), 18);
    }

    #[test]
    fn wire_names_round_trip_through_serde() {
        assert_eq!(serde_json::to_string(&Chain::Polygon).unwrap(), "\"POLYGON\"");
        assert_eq!(serde_json::to_string(&Token::Pol).unwrap(), "\"POL\"");
    }
}
