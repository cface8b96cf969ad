use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ghostpay::{
    ChainGateways, Credentials, EngineConfig, EvmGateway, HttpNotifier, InvoiceService,
    InvoiceStore, ReconciliationLoop,
};

mod shutdown;

const USAGE: &str = "\
usage: ghostpay-node [command]

commands:
  run                  run the reconciliation loop (default)
  status               print invoice counts and fee wallet balances
  issue-key <label>    create an API key and print it once
  revoke-key <id>      revoke an API key
  delete-key <id>      delete a revoked API key
  list-keys            list API keys";

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let config = match EngineConfig::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    tracing::debug!(?config, "configuration loaded");

    let store = match InvoiceStore::open(&config.db_path) {
        Ok(store) => {
            tracing::info!("Invoice store: SQLite at {}", config.db_path);
            Arc::new(store)
        }
        Err(e) => {
            tracing::error!("Failed to open invoice store at {}: {e}", config.db_path);
            std::process::exit(1);
        }
    };

    let result = match args.first().map(String::as_str) {
        None | Some("run") => run(config, store).await,
        Some("status") => status(config, store).await,
        Some("issue-key") => issue_key(store, args.get(1)),
        Some("revoke-key") => with_id(args.get(1), |id| Credentials::new(store).revoke(id)),
        Some("delete-key") => with_id(args.get(1), |id| Credentials::new(store).delete(id)),
        Some("list-keys") => list_keys(store),
        Some("-h" | "--help" | "help") => {
            println!("{USAGE}");
            Ok(())
        }
        Some(other) => {
            eprintln!("unknown command '{other}'\n\n{USAGE}");
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        tracing::error!(code = e.code(), "{e}");
        std::process::exit(1);
    }
}

fn build_services(
    config: &EngineConfig,
) -> ghostpay::Result<(Arc<ChainGateways<EvmGateway>>, Arc<HttpNotifier>)> {
    let gateways = config
        .chains
        .iter()
        .cloned()
        .map(EvmGateway::new)
        .collect::<ghostpay::Result<Vec<_>>>()?;
    for gateway in &gateways {
        let chain = gateway.config();
        tracing::info!(
            chain = %chain.chain,
            chain_id = chain.chain_id,
            rpc = %chain.rpc_url,
            confirmations = chain.confirmations,
            "chain gateway configured"
        );
    }
    let notifier = HttpNotifier::new(config.webhook_secret.clone())?;
    if config.webhook_secret.is_none() {
        tracing::warn!("WEBHOOK_SECRET not set, webhooks will be sent unsigned");
    }
    Ok((Arc::new(ChainGateways::new(gateways)), Arc::new(notifier)))
}

async fn run(config: Arc<EngineConfig>, store: Arc<InvoiceStore>) -> ghostpay::Result<()> {
    let (gateways, notifier) = build_services(&config)?;

    // Missing key material only blocks creation and sweeping; expiry keeps working.
    let wallets = config.wallets();
    match wallets.main_wallet() {
        Ok(address) => tracing::info!(%address, "sweep destination"),
        Err(e) => tracing::warn!("{e}"),
    }
    match wallets.fee_wallet() {
        Ok(key) => tracing::info!(address = %key.address(), "fee wallet"),
        Err(e) => tracing::warn!("{e}"),
    }

    let sig_down = match shutdown::SigDown::try_new() {
        Ok(s) => s,
        Err(e) => {
            return Err(ghostpay::GhostpayError::Configuration(format!(
                "failed to install signal handlers: {e}"
            )))
        }
    };

    let reconciler = Arc::new(ReconciliationLoop::new(
        config,
        store,
        gateways,
        notifier,
        sig_down.cancellation_token(),
    ));
    let loop_handle = {
        let reconciler = reconciler.clone();
        tokio::spawn(async move { reconciler.run().await })
    };

    sig_down.recv().await;
    if let Err(e) = loop_handle.await {
        tracing::error!("reconciliation loop task failed: {e}");
    }
    tracing::debug!(metrics = %ghostpay::metrics::metrics_output(), "final metrics");
    tracing::info!("shutdown complete");
    Ok(())
}

async fn status(config: Arc<EngineConfig>, store: Arc<InvoiceStore>) -> ghostpay::Result<()> {
    let (gateways, notifier) = build_services(&config)?;
    let service = InvoiceService::new(config, store, gateways, notifier);

    let counts = service.status_counts()?;
    let balances = service.fee_wallet_balances().await?;
    let report = serde_json::json!({
        "invoices": counts
            .iter()
            .map(|(status, count)| (status.as_str().to_string(), serde_json::json!(count)))
            .collect::<serde_json::Map<_, _>>(),
        "fee_wallet": balances,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn issue_key(store: Arc<InvoiceStore>, label: Option<&String>) -> ghostpay::Result<()> {
    let label = label.map(String::as_str).unwrap_or("default");
    let issued = Credentials::new(store).issue(label)?;
    println!("id:     {}", issued.credential.id);
    println!("label:  {}", issued.credential.label);
    println!("key:    {}", issued.secret);
    println!("\nStore this key now, it cannot be shown again.");
    Ok(())
}

fn list_keys(store: Arc<InvoiceStore>) -> ghostpay::Result<()> {
    let keys = Credentials::new(store).list(1, 500)?;
    println!("{}", serde_json::to_string_pretty(&keys)?);
    Ok(())
}

fn with_id(
    id: Option<&String>,
    op: impl FnOnce(&str) -> ghostpay::Result<()>,
) -> ghostpay::Result<()> {
    let id = id.ok_or_else(|| ghostpay::GhostpayError::Validation("missing key id".to_string()))?;
    op(id)?;
    println!("ok");
    Ok(())
}
