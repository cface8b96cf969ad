//! Per-chain access: balances, gas pricing, submission and receipt waiting.
//!
//! [`ChainGateway`] is the seam between the engine and the ledger. Reads return
//! the node's current view and are never cached here; callers re-poll. No call
//! retries on its own, every RPC failure surfaces as
//! [`GhostpayError::TransientChain`].

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, TxHash, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::TransactionRequest;
use url::Url;

use crate::constants::{
    Chain, ChainConfig, Token, NATIVE_DECIMALS, NATIVE_TRANSFER_GAS, TOKEN_TRANSFER_GAS,
};
use crate::erc20;
use crate::error::{GhostpayError, Result};
use crate::wallet::WalletKey;

/// How often a pending transaction is re-checked while waiting for its receipt.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Outcome of a mined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub success: bool,
    pub block_number: Option<u64>,
}

/// Chain capability used by the state machine and the sweeper.
pub trait ChainGateway: Send + Sync {
    fn chain(&self) -> Chain;

    fn native_balance(&self, address: Address)
        -> impl Future<Output = Result<U256>> + Send;

    fn token_balance(
        &self,
        address: Address,
        token: Token,
    ) -> impl Future<Output = Result<U256>> + Send;

    fn token_decimals(&self, token: Token) -> impl Future<Output = Result<u8>> + Send;

    /// Current legacy gas price in wei.
    fn gas_price(&self) -> impl Future<Output = Result<u128>> + Send;

    /// Gas units a transfer of `token` is budgeted at.
    fn estimate_transfer_gas(&self, token: Token) -> impl Future<Output = Result<u64>> + Send;

    fn block_number(&self) -> impl Future<Output = Result<u64>> + Send;

    /// Send `amount` wei from `key` to `to`. Uses the current gas price when `gas_price` is `None`.
    fn send_native(
        &self,
        key: &WalletKey,
        to: Address,
        amount: U256,
        gas_price: Option<u128>,
    ) -> impl Future<Output = Result<TxHash>> + Send;

    /// Transfer `amount` of `token` from `key` to `to`. The node reserves
    /// `gas_limit * gas_price` from the sender's native balance, so both must
    /// match whatever the sender was funded for.
    fn send_token(
        &self,
        key: &WalletKey,
        token: Token,
        to: Address,
        amount: U256,
        gas_limit: u64,
        gas_price: u128,
    ) -> impl Future<Output = Result<TxHash>> + Send;

    /// Wait until `tx_hash` is mined. Elapsing `timeout` yields
    /// [`GhostpayError::ReceiptTimeout`]; the transaction may still land later.
    fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
        timeout: Duration,
    ) -> impl Future<Output = Result<TxReceipt>> + Send;
}

/// Base units of `token` on `gateway`'s chain.
pub async fn asset_decimals<G: ChainGateway>(gateway: &G, token: Token) -> Result<u8> {
    if token.is_native() {
        Ok(NATIVE_DECIMALS)
    } else {
        gateway.token_decimals(token).await
    }
}

/// Balance of `token` at `address`, native or contract-backed.
pub async fn asset_balance<G: ChainGateway>(
    gateway: &G,
    address: Address,
    token: Token,
) -> Result<U256> {
    if token.is_native() {
        gateway.native_balance(address).await
    } else {
        gateway.token_balance(address, token).await
    }
}

/// One gateway per supported chain.
pub struct ChainGateways<G> {
    gateways: HashMap<Chain, G>,
}

impl<G: ChainGateway> ChainGateways<G> {
    pub fn new(gateways: impl IntoIterator<Item = G>) -> Self {
        Self {
            gateways: gateways.into_iter().map(|g| (g.chain(), g)).collect(),
        }
    }

    pub fn get(&self, chain: Chain) -> Result<&G> {
        self.gateways
            .get(&chain)
            .ok_or_else(|| GhostpayError::Configuration(format!("no gateway configured for {chain}")))
    }

}

/// JSON-RPC gateway to one EVM chain, backed by alloy.
pub struct EvmGateway {
    config: ChainConfig,
    rpc_url: Url,
    provider: RootProvider,
}

impl EvmGateway {
    pub fn new(config: ChainConfig) -> Result<Self> {
        let rpc_url: Url = config.rpc_url.parse().map_err(|e| {
            GhostpayError::Configuration(format!("invalid RPC URL for {}: {e}", config.chain))
        })?;
        let provider = RootProvider::new_http(rpc_url.clone());
        Ok(Self {
            config,
            rpc_url,
            provider,
        })
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    fn signing_provider(&self, key: &WalletKey) -> impl Provider {
        ProviderBuilder::new()
            .wallet(EthereumWallet::from(key.signer().clone()))
            .connect_http(self.rpc_url.clone())
    }

    fn rpc_error(&self, op: &str, e: impl std::fmt::Display) -> GhostpayError {
        GhostpayError::TransientChain(format!("{} {op} failed: {e}", self.config.chain))
    }
}

impl ChainGateway for EvmGateway {
    fn chain(&self) -> Chain {
        self.config.chain
    }

    async fn native_balance(&self, address: Address) -> Result<U256> {
        self.provider
            .get_balance(address)
            .await
            .map_err(|e| self.rpc_error("eth_getBalance", e))
    }

    async fn token_balance(&self, address: Address, token: Token) -> Result<U256> {
        let contract = self.config.token_contract(token)?;
        erc20::balance_of(&self.provider, contract, address).await
    }

    async fn token_decimals(&self, token: Token) -> Result<u8> {
        let contract = self.config.token_contract(token)?;
        erc20::decimals(&self.provider, contract).await
    }

    async fn gas_price(&self) -> Result<u128> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| self.rpc_error("eth_gasPrice", e))
    }

    async fn estimate_transfer_gas(&self, token: Token) -> Result<u64> {
        Ok(if token.is_native() {
            NATIVE_TRANSFER_GAS
        } else {
            TOKEN_TRANSFER_GAS
        })
    }

    async fn block_number(&self) -> Result<u64> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| self.rpc_error("eth_blockNumber", e))
    }

    async fn send_native(
        &self,
        key: &WalletKey,
        to: Address,
        amount: U256,
        gas_price: Option<u128>,
    ) -> Result<TxHash> {
        let mut tx = TransactionRequest::default()
            .with_from(key.address())
            .with_to(to)
            .with_value(amount)
            .with_gas_limit(NATIVE_TRANSFER_GAS)
            .with_chain_id(self.config.chain_id);

        // PoA chains only take legacy transactions; elsewhere the filler picks EIP-1559 fees
        // unless the caller pinned a price.
        match gas_price {
            Some(price) => tx.set_gas_price(price),
            None if self.config.poa => tx.set_gas_price(self.gas_price().await?),
            None => {}
        }

        let provider = self.signing_provider(key);
        let pending = provider
            .send_transaction(tx)
            .await
            .map_err(|e| self.rpc_error("native transfer", e))?;
        let tx_hash = *pending.tx_hash();

        tracing::info!(
            chain = %self.config.chain,
            from = %key.address(),
            to = %to,
            amount = %amount,
            tx = %tx_hash,
            "native transfer submitted"
        );
        Ok(tx_hash)
    }

    async fn send_token(
        &self,
        key: &WalletKey,
        token: Token,
        to: Address,
        amount: U256,
        gas_limit: u64,
        gas_price: u128,
    ) -> Result<TxHash> {
        let contract = self.config.token_contract(token)?;
        let provider = self.signing_provider(key);
        let tx_hash =
            erc20::transfer(&provider, contract, to, amount, gas_limit, gas_price).await?;

        tracing::info!(
            chain = %self.config.chain,
            token = %token,
            from = %key.address(),
            to = %to,
            amount = %amount,
            gas_limit,
            gas_price,
            tx = %tx_hash,
            "token transfer submitted"
        );
        Ok(tx_hash)
    }

    async fn wait_for_receipt(&self, tx_hash: TxHash, timeout: Duration) -> Result<TxReceipt> {
        let poll = async {
            loop {
                match self.provider.get_transaction_receipt(tx_hash).await {
                    Ok(Some(receipt)) => {
                        return Ok(TxReceipt {
                            tx_hash,
                            success: receipt.status(),
                            block_number: receipt.block_number,
                        })
                    }
                    Ok(None) => {}
                    Err(e) => return Err(self.rpc_error("eth_getTransactionReceipt", e)),
                }
                tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| GhostpayError::ReceiptTimeout {
                tx: format!("{tx_hash}"),
                timeout_secs: timeout.as_secs(),
            })?
    }
}
