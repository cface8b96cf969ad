#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{keccak256, Address, TxHash, U256};
use tokio_util::sync::CancellationToken;

use ghostpay::{
    Chain, ChainConfig, ChainGateway, ChainGateways, EngineConfig, GhostpayError, InvoiceService,
    InvoiceStore, ReconciliationLoop, Token, TxReceipt, WalletKey, WebhookPayload,
};

pub const MAIN_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
pub const FEE_MNEMONIC: &str = "test test test test test test test test test test test junk";

pub const GAS_PRICE: u128 = 5_000_000_000;

pub fn ether(n: u64) -> U256 {
    U256::from(n) * U256::from(10u64).pow(U256::from(18u64))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentKind {
    Native,
    Token,
}

#[derive(Debug, Clone)]
pub struct SentTx {
    pub kind: SentKind,
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub gas_price: u128,
    pub hash: TxHash,
}

type SendHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct MockState {
    native: HashMap<Address, U256>,
    tokens: HashMap<Address, U256>,
    decimals: u8,
    block: u64,
    gas_price: u128,
    nonce: u64,
    receipts: HashMap<TxHash, TxReceipt>,
    sent: Vec<SentTx>,
    fail_reads: bool,
    fail_token_sends: bool,
    revert_token_transfers: bool,
    hold_receipts: bool,
    /// Gas price the chain moves to right after any native transfer.
    gas_price_after_native_send: Option<u128>,
    /// Runs after a token transfer is accepted, before the sender gets the hash back.
    on_token_send: Option<SendHook>,
}

/// In-memory ledger standing in for one chain.
#[derive(Clone)]
pub struct MockChain {
    chain: Chain,
    state: Arc<Mutex<MockState>>,
}

impl MockChain {
    pub fn new(chain: Chain) -> Self {
        let decimals = match chain {
            Chain::Bsc => 18,
            Chain::Polygon => 6,
        };
        Self {
            chain,
            state: Arc::new(Mutex::new(MockState {
                decimals,
                block: 1_000,
                gas_price: GAS_PRICE,
                ..Default::default()
            })),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_native(&self, address: Address, amount: U256) {
        self.state().native.insert(address, amount);
    }

    pub fn set_token(&self, address: Address, amount: U256) {
        self.state().tokens.insert(address, amount);
    }

    pub fn native_of(&self, address: Address) -> U256 {
        self.state().native.get(&address).copied().unwrap_or_default()
    }

    pub fn token_of(&self, address: Address) -> U256 {
        self.state().tokens.get(&address).copied().unwrap_or_default()
    }

    pub fn advance_blocks(&self, n: u64) {
        self.state().block += n;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.state().fail_reads = fail;
    }

    pub fn set_fail_token_sends(&self, fail: bool) {
        self.state().fail_token_sends = fail;
    }

    pub fn set_revert_token_transfers(&self, revert: bool) {
        self.state().revert_token_transfers = revert;
    }

    pub fn set_hold_receipts(&self, hold: bool) {
        self.state().hold_receipts = hold;
    }

    pub fn set_gas_price_after_native_send(&self, price: u128) {
        self.state().gas_price_after_native_send = Some(price);
    }

    pub fn on_token_send(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.state().on_token_send = Some(Arc::new(hook));
    }

    pub fn sent(&self) -> Vec<SentTx> {
        self.state().sent.clone()
    }

    pub fn sent_from(&self, from: Address, kind: SentKind) -> Vec<SentTx> {
        self.sent()
            .into_iter()
            .filter(|tx| tx.from == from && tx.kind == kind)
            .collect()
    }

    fn check_reads(state: &MockState) -> ghostpay::Result<()> {
        if state.fail_reads {
            return Err(GhostpayError::TransientChain("rpc unavailable".to_string()));
        }
        Ok(())
    }

    fn next_hash(state: &mut MockState) -> TxHash {
        state.nonce += 1;
        keccak256(state.nonce.to_be_bytes())
    }
}

impl ChainGateway for MockChain {
    fn chain(&self) -> Chain {
        self.chain
    }

    async fn native_balance(&self, address: Address) -> ghostpay::Result<U256> {
        let state = self.state();
        Self::check_reads(&state)?;
        Ok(state.native.get(&address).copied().unwrap_or_default())
    }

    async fn token_balance(&self, address: Address, _token: Token) -> ghostpay::Result<U256> {
        let state = self.state();
        Self::check_reads(&state)?;
        Ok(state.tokens.get(&address).copied().unwrap_or_default())
    }

    async fn token_decimals(&self, _token: Token) -> ghostpay::Result<u8> {
        let state = self.state();
        Self::check_reads(&state)?;
        Ok(state.decimals)
    }

    async fn gas_price(&self) -> ghostpay::Result<u128> {
        let state = self.state();
        Self::check_reads(&state)?;
        Ok(state.gas_price)
    }

    async fn estimate_transfer_gas(&self, token: Token) -> ghostpay::Result<u64> {
        Ok(if token.is_native() { 21_000 } else { 65_000 })
    }

    async fn block_number(&self) -> ghostpay::Result<u64> {
        let state = self.state();
        Self::check_reads(&state)?;
        Ok(state.block)
    }

    async fn send_native(
        &self,
        key: &WalletKey,
        to: Address,
        amount: U256,
        gas_price: Option<u128>,
    ) -> ghostpay::Result<TxHash> {
        let mut state = self.state();
        let price = gas_price.unwrap_or(state.gas_price);
        let fee = U256::from(21_000u64) * U256::from(price);
        let from = key.address();
        let balance = state.native.get(&from).copied().unwrap_or_default();
        if balance < amount + fee {
            return Err(GhostpayError::TransientChain(
                "insufficient funds for gas * price + value".to_string(),
            ));
        }
        state.native.insert(from, balance - amount - fee);
        *state.native.entry(to).or_default() += amount;

        let hash = Self::next_hash(&mut state);
        let block = state.block;
        state.receipts.insert(
            hash,
            TxReceipt {
                tx_hash: hash,
                success: true,
                block_number: Some(block),
            },
        );
        state.sent.push(SentTx {
            kind: SentKind::Native,
            from,
            to,
            amount,
            gas_price: price,
            hash,
        });
        if let Some(next) = state.gas_price_after_native_send {
            state.gas_price = next;
        }
        Ok(hash)
    }

    async fn send_token(
        &self,
        key: &WalletKey,
        _token: Token,
        to: Address,
        amount: U256,
        gas_limit: u64,
        gas_price: u128,
    ) -> ghostpay::Result<TxHash> {
        let mut state = self.state();
        if state.fail_token_sends {
            return Err(GhostpayError::TransientChain("nonce too low".to_string()));
        }
        let from = key.address();
        // Like a real txpool: the whole limit must be covered up front, only gas used is charged.
        let reserved = U256::from(gas_limit) * U256::from(gas_price);
        let native = state.native.get(&from).copied().unwrap_or_default();
        if native < reserved {
            return Err(GhostpayError::TransientChain(format!(
                "insufficient funds for gas * price: have {native} want {reserved}"
            )));
        }
        let used = U256::from(gas_limit.min(65_000)) * U256::from(gas_price);
        state.native.insert(from, native - used);

        let success = !state.revert_token_transfers;
        if success {
            let balance = state.tokens.get(&from).copied().unwrap_or_default();
            state.tokens.insert(from, balance - amount);
            *state.tokens.entry(to).or_default() += amount;
        }

        let hash = Self::next_hash(&mut state);
        let block = state.block;
        state.receipts.insert(
            hash,
            TxReceipt {
                tx_hash: hash,
                success,
                block_number: Some(block),
            },
        );
        state.sent.push(SentTx {
            kind: SentKind::Token,
            from,
            to,
            amount,
            gas_price,
            hash,
        });
        let hook = state.on_token_send.clone();
        drop(state);
        if let Some(hook) = hook {
            hook();
        }
        Ok(hash)
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
        timeout: Duration,
    ) -> ghostpay::Result<TxReceipt> {
        // Let other tasks interleave, like a real network round trip would.
        tokio::task::yield_now().await;
        let state = self.state();
        if state.hold_receipts {
            return Err(GhostpayError::ReceiptTimeout {
                tx: format!("{tx_hash}"),
                timeout_secs: timeout.as_secs(),
            });
        }
        state
            .receipts
            .get(&tx_hash)
            .copied()
            .ok_or_else(|| GhostpayError::TransientChain(format!("unknown transaction {tx_hash}")))
    }
}

/// Captures webhook deliveries instead of sending them.
#[derive(Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<(String, WebhookPayload)>>,
}

impl RecordingNotifier {
    pub fn calls(&self) -> Vec<(String, WebhookPayload)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn statuses_for(&self, invoice_id: &str) -> Vec<ghostpay::InvoiceStatus> {
        self.calls()
            .into_iter()
            .filter(|(_, p)| p.invoice_id == invoice_id)
            .map(|(_, p)| p.status)
            .collect()
    }
}

impl ghostpay::Notifier for RecordingNotifier {
    fn deliver(&self, url: &str, payload: WebhookPayload) {
        self.calls.lock().unwrap().push((url.to_string(), payload));
    }
}

pub fn test_config() -> EngineConfig {
    let mut bsc = ChainConfig::bsc();
    bsc.confirmations = 0;
    let mut polygon = ChainConfig::polygon();
    polygon.confirmations = 0;
    EngineConfig {
        db_path: ":memory:".to_string(),
        main_mnemonic: Some(MAIN_MNEMONIC.to_string()),
        fee_mnemonic: Some(FEE_MNEMONIC.to_string()),
        chains: vec![bsc, polygon],
        public_base_url: "https://pay.example.com".to_string(),
        receipt_timeout: Duration::from_secs(1),
        poll_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

pub struct Harness {
    pub config: Arc<EngineConfig>,
    pub store: Arc<InvoiceStore>,
    pub bsc: MockChain,
    pub polygon: MockChain,
    pub gateways: Arc<ChainGateways<MockChain>>,
    pub notifier: Arc<RecordingNotifier>,
    pub service: InvoiceService<MockChain>,
    pub reconciler: ReconciliationLoop<MockChain>,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(InvoiceStore::open(&config.db_path).unwrap());
        let bsc = MockChain::new(Chain::Bsc);
        let polygon = MockChain::new(Chain::Polygon);
        let gateways = Arc::new(ChainGateways::new([bsc.clone(), polygon.clone()]));
        let notifier = Arc::new(RecordingNotifier::default());
        let cancel = CancellationToken::new();

        let service = InvoiceService::new(
            config.clone(),
            store.clone(),
            gateways.clone(),
            notifier.clone(),
        );
        let reconciler = ReconciliationLoop::new(
            config.clone(),
            store.clone(),
            gateways.clone(),
            notifier.clone(),
            cancel.clone(),
        );

        // Plenty of gas in the fee wallet on both chains.
        if let Ok(fee) = config.wallets().fee_wallet() {
            bsc.set_native(fee.address(), ether(10));
            polygon.set_native(fee.address(), ether(10));
        }

        Self {
            config,
            store,
            bsc,
            polygon,
            gateways,
            notifier,
            service,
            reconciler,
            cancel,
        }
    }

    pub fn main_wallet(&self) -> Address {
        self.config.wallets().main_wallet().unwrap()
    }

    pub fn fee_wallet(&self) -> Address {
        self.config.wallets().fee_wallet().unwrap().address()
    }

    /// Tick, then wait for every sweep the tick started.
    pub async fn tick(&self) -> ghostpay::TickReport {
        let report = self.reconciler.tick().await.unwrap();
        self.reconciler.drain_sweeps().await;
        report
    }

    pub fn status(&self, id: &str) -> ghostpay::InvoiceStatus {
        self.service.current_status(id).unwrap()
    }
}
