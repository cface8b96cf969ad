mod common;

use alloy::primitives::U256;
use ghostpay::amount::gas_cost;
use ghostpay::{EngineConfig, InvoiceStatus, NewInvoice, SweepOutcome};
use tokio_util::sync::CancellationToken;

use common::{ether, Harness, MockChain, SentKind, GAS_PRICE};

fn usdt_on_bsc(amount: &str) -> NewInvoice {
    NewInvoice {
        chain: "BSC".into(),
        token: "USDT".into(),
        amount_native: Some(amount.into()),
        webhook_url: Some("https://merchant.example/hook".into()),
        ..Default::default()
    }
}

fn pol_on_polygon(amount: &str) -> NewInvoice {
    NewInvoice {
        chain: "POLYGON".into(),
        token: "POL".into(),
        amount_native: Some(amount.into()),
        webhook_url: Some("https://merchant.example/hook".into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn token_invoice_settles_end_to_end() {
    let h = Harness::new();
    let created = h.service.create(usdt_on_bsc("10.00")).unwrap();
    assert_eq!(created.status, InvoiceStatus::Pending);

    // Nothing paid yet.
    h.tick().await;
    assert_eq!(h.status(&created.invoice_id), InvoiceStatus::Pending);

    h.bsc.set_token(created.deposit_address, ether(10));
    let report = h.tick().await;
    assert_eq!(report.sweeps_started, 1);
    assert_eq!(h.status(&created.invoice_id), InvoiceStatus::Completed);

    let invoice = h.service.get(&created.invoice_id).unwrap();
    assert!(invoice.gas_tx_hash.is_some());
    assert!(invoice.tx_out_hash.is_some());
    assert!(invoice.confirmed_at.is_some());
    assert!(invoice.completed_at.is_some());

    // Funds reached the main wallet, gas came from the fee wallet exactly once.
    assert_eq!(h.bsc.token_of(h.main_wallet()), ether(10));
    assert_eq!(h.bsc.token_of(created.deposit_address), U256::ZERO);
    let funding = h.bsc.sent_from(h.fee_wallet(), SentKind::Native);
    assert_eq!(funding.len(), 1);
    assert_eq!(funding[0].to, created.deposit_address);
    assert_eq!(funding[0].amount, gas_cost(65_000, GAS_PRICE, 20));

    // One webhook per notifying state, none for sweeping.
    assert_eq!(
        h.notifier.statuses_for(&created.invoice_id),
        vec![InvoiceStatus::Confirming, InvoiceStatus::Completed]
    );

    // Further ticks leave the terminal invoice alone.
    h.tick().await;
    assert_eq!(h.notifier.statuses_for(&created.invoice_id).len(), 2);
    assert_eq!(h.bsc.sent().len(), 2);
}

#[tokio::test]
async fn token_transfer_spends_exactly_the_funded_gas_budget() {
    let h = Harness::new();
    let created = h.service.create(usdt_on_bsc("10")).unwrap();
    h.bsc.set_token(created.deposit_address, ether(10));
    // The network gets pricier the moment the funding lands.
    h.bsc.set_gas_price_after_native_send(GAS_PRICE * 3);

    h.tick().await;

    assert_eq!(h.status(&created.invoice_id), InvoiceStatus::Completed);
    let funding = h.bsc.sent_from(h.fee_wallet(), SentKind::Native);
    assert_eq!(funding.len(), 1);
    assert_eq!(funding[0].amount, U256::from(78_000u64) * U256::from(GAS_PRICE));

    let transfer = h.bsc.sent_from(created.deposit_address, SentKind::Token);
    assert_eq!(transfer.len(), 1);
    assert_eq!(transfer[0].gas_price, GAS_PRICE);
    assert_eq!(h.bsc.token_of(h.main_wallet()), ether(10));
}

#[tokio::test]
async fn transfer_broadcast_after_losing_lease_is_not_completed() {
    let h = Harness::new();
    let created = h.service.create(usdt_on_bsc("10")).unwrap();
    h.bsc.set_token(created.deposit_address, ether(10));
    h.bsc.set_native(created.deposit_address, ether(1));

    let machine = ghostpay::StateMachine::new(
        h.config.clone(),
        h.store.clone(),
        h.gateways.clone(),
        h.notifier.clone(),
    );
    let invoice = h.service.get(&created.invoice_id).unwrap();
    machine.advance(invoice, chrono::Utc::now()).await.unwrap();

    // While the transfer is in flight the lease lapses and another worker claims it.
    let store = h.store.clone();
    let id = created.invoice_id.clone();
    let lease = h.config.sweep_lease;
    h.bsc.on_token_send(move || {
        let later = chrono::Utc::now() + lease + chrono::Duration::seconds(1);
        assert!(store.try_claim(&id, "takeover", later, lease).unwrap());
    });

    let err = h
        .reconciler
        .engine()
        .settle(&created.invoice_id, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "settlement_error");

    let invoice = h.service.get(&created.invoice_id).unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Sweeping);
    assert!(invoice.tx_out_hash.is_none());
    assert!(!h
        .notifier
        .statuses_for(&created.invoice_id)
        .contains(&InvoiceStatus::Completed));
}

#[tokio::test]
async fn funded_deposit_skips_gas_top_up() {
    let h = Harness::new();
    let created = h.service.create(usdt_on_bsc("5")).unwrap();
    h.bsc.set_token(created.deposit_address, ether(5));
    h.bsc.set_native(created.deposit_address, ether(1));

    h.tick().await;

    assert_eq!(h.status(&created.invoice_id), InvoiceStatus::Completed);
    let invoice = h.service.get(&created.invoice_id).unwrap();
    assert!(invoice.gas_tx_hash.is_none());
    assert!(h.bsc.sent_from(h.fee_wallet(), SentKind::Native).is_empty());
}

#[tokio::test]
async fn leftover_gas_is_refunded_to_fee_wallet() {
    let h = Harness::new();
    let created = h.service.create(usdt_on_bsc("5")).unwrap();
    h.bsc.set_token(created.deposit_address, ether(5));
    h.bsc.set_native(created.deposit_address, ether(1));

    h.tick().await;

    let refunds = h.bsc.sent_from(created.deposit_address, SentKind::Native);
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].to, h.fee_wallet());
    // Only the refund's own fee is left behind (reserve defaults to zero).
    assert_eq!(h.bsc.native_of(created.deposit_address), U256::ZERO);
}

#[tokio::test]
async fn refund_can_be_disabled() {
    let h = Harness::with_config(EngineConfig {
        refund_gas_remainder: false,
        ..common::test_config()
    });
    let created = h.service.create(usdt_on_bsc("5")).unwrap();
    h.bsc.set_token(created.deposit_address, ether(5));
    h.bsc.set_native(created.deposit_address, ether(1));

    h.tick().await;

    assert_eq!(h.status(&created.invoice_id), InvoiceStatus::Completed);
    assert!(h
        .bsc
        .sent_from(created.deposit_address, SentKind::Native)
        .is_empty());
}

#[tokio::test]
async fn native_invoice_sweeps_balance_minus_gas() {
    let h = Harness::new();
    let created = h.service.create(pol_on_polygon("1.5")).unwrap();
    h.polygon.set_native(created.deposit_address, ether(2));

    h.tick().await;

    assert_eq!(h.status(&created.invoice_id), InvoiceStatus::Completed);
    let sent = h.polygon.sent_from(created.deposit_address, SentKind::Native);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, h.main_wallet());
    assert_eq!(sent[0].amount, ether(2) - gas_cost(21_000, GAS_PRICE, 20));
    // Native sweeps never touch the fee wallet.
    assert!(h.polygon.sent_from(h.fee_wallet(), SentKind::Native).is_empty());
}

#[tokio::test]
async fn native_dust_below_gas_is_not_swept() {
    let h = Harness::new();
    // Requested amount is below what the transfer itself would cost.
    let created = h.service.create(pol_on_polygon("0.0001")).unwrap();
    let dust = gas_cost(21_000, GAS_PRICE, 20);
    h.polygon.set_native(created.deposit_address, dust);

    h.tick().await;

    let invoice = h.service.get(&created.invoice_id).unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Sweeping);
    assert!(invoice.tx_out_hash.is_none());
    assert!(h.polygon.sent().is_empty());

    let outcome = h
        .reconciler
        .engine()
        .settle(&created.invoice_id, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, SweepOutcome::Deferred { .. }));
}

#[tokio::test]
async fn failed_transfer_keeps_gas_reference_and_does_not_refund_twice() {
    let h = Harness::new();
    let created = h.service.create(usdt_on_bsc("10")).unwrap();
    h.bsc.set_token(created.deposit_address, ether(10));
    h.bsc.set_fail_token_sends(true);

    h.tick().await;

    let invoice = h.service.get(&created.invoice_id).unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Sweeping);
    let gas_tx = invoice.gas_tx_hash.clone().expect("gas funding recorded");
    assert!(invoice.tx_out_hash.is_none());

    h.bsc.set_fail_token_sends(false);
    h.tick().await;

    let invoice = h.service.get(&created.invoice_id).unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Completed);
    assert_eq!(invoice.gas_tx_hash.as_deref(), Some(gas_tx.as_str()));
    assert_eq!(h.bsc.sent_from(h.fee_wallet(), SentKind::Native).len(), 1);
    assert_eq!(h.bsc.token_of(h.main_wallet()), ether(10));
}

#[tokio::test]
async fn recorded_transfer_is_awaited_not_resent() {
    let h = Harness::new();
    let created = h.service.create(usdt_on_bsc("10")).unwrap();
    h.bsc.set_token(created.deposit_address, ether(10));
    h.bsc.set_native(created.deposit_address, ether(1));
    h.bsc.set_hold_receipts(true);

    h.tick().await;

    let invoice = h.service.get(&created.invoice_id).unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Sweeping);
    let tx_out = invoice.tx_out_hash.clone().expect("outbound transfer recorded");

    h.bsc.set_hold_receipts(false);
    h.tick().await;

    let invoice = h.service.get(&created.invoice_id).unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Completed);
    assert_eq!(invoice.tx_out_hash.as_deref(), Some(tx_out.as_str()));
    assert_eq!(
        h.bsc.sent_from(created.deposit_address, SentKind::Token).len(),
        1
    );
}

#[tokio::test]
async fn reverted_transfer_fails_invoice() {
    let h = Harness::new();
    let created = h.service.create(usdt_on_bsc("10")).unwrap();
    h.bsc.set_token(created.deposit_address, ether(10));
    h.bsc.set_revert_token_transfers(true);

    h.tick().await;

    assert_eq!(h.status(&created.invoice_id), InvoiceStatus::Failed);
    assert_eq!(
        h.notifier.statuses_for(&created.invoice_id),
        vec![InvoiceStatus::Confirming, InvoiceStatus::Failed]
    );
}

#[tokio::test]
async fn missing_fee_wallet_leaves_invoice_sweeping() {
    let h = Harness::with_config(EngineConfig {
        fee_mnemonic: None,
        ..common::test_config()
    });
    let created = h.service.create(usdt_on_bsc("10")).unwrap();
    h.bsc.set_token(created.deposit_address, ether(10));

    let report = h.tick().await;
    assert_eq!(report.errors, 0);

    assert_eq!(h.status(&created.invoice_id), InvoiceStatus::Sweeping);
    assert!(h.bsc.sent().is_empty());

    let err = h
        .reconciler
        .engine()
        .settle(&created.invoice_id, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "configuration_error");
}

#[tokio::test]
async fn concurrent_attempts_send_one_transfer() {
    let h = Harness::new();
    let created = h.service.create(usdt_on_bsc("10")).unwrap();
    h.bsc.set_token(created.deposit_address, ether(10));
    h.bsc.set_native(created.deposit_address, ether(1));

    // Drive the invoice to `sweeping` directly so the loop starts no sweep of its own.
    let other = ghostpay::SettlementEngine::new(
        h.config.clone(),
        h.store.clone(),
        h.gateways.clone(),
        h.notifier.clone(),
    );
    let machine = ghostpay::StateMachine::new(
        h.config.clone(),
        h.store.clone(),
        h.gateways.clone(),
        h.notifier.clone(),
    );
    let invoice = h.service.get(&created.invoice_id).unwrap();
    let invoice = machine.advance(invoice, chrono::Utc::now()).await.unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Sweeping);

    let cancel = CancellationToken::new();
    let (a, b) = tokio::join!(
        h.reconciler.engine().settle(&created.invoice_id, &cancel),
        other.settle(&created.invoice_id, &cancel),
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, SweepOutcome::Completed { .. }))
        .count();
    assert_eq!(completed, 1, "{outcomes:?}");
    assert!(outcomes
        .iter()
        .any(|o| matches!(o, SweepOutcome::Busy | SweepOutcome::Skipped)));
    assert_eq!(
        h.bsc.sent_from(created.deposit_address, SentKind::Token).len(),
        1
    );
}

#[tokio::test]
async fn cancelled_sweep_releases_lease() {
    let h = Harness::new();
    let created = h.service.create(usdt_on_bsc("10")).unwrap();
    h.bsc.set_token(created.deposit_address, ether(10));
    h.bsc.set_native(created.deposit_address, ether(1));

    let machine = ghostpay::StateMachine::new(
        h.config.clone(),
        h.store.clone(),
        h.gateways.clone(),
        h.notifier.clone(),
    );
    let invoice = h.service.get(&created.invoice_id).unwrap();
    machine.advance(invoice, chrono::Utc::now()).await.unwrap();

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let err = h
        .reconciler
        .engine()
        .settle(&created.invoice_id, &cancelled)
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(h.status(&created.invoice_id), InvoiceStatus::Sweeping);

    // The lease is free again, a fresh attempt completes.
    let outcome = h
        .reconciler
        .engine()
        .settle(&created.invoice_id, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, SweepOutcome::Completed { .. }));
}

#[test]
fn mock_chain_is_a_chain_gateway() {
    fn assert_gateway<G: ghostpay::ChainGateway + Clone + 'static>(_: &G) {}
    assert_gateway(&MockChain::new(ghostpay::Chain::Bsc));
}
