// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crossrail_settlement::api;
use crossrail_settlement::chain::{
    ChainCredit, ChainListener, DisabledCredit, GatewayClient, DEFAULT_NETWORK,
};
use crossrail_settlement::chain::gateway::signer_provider;
use crossrail_settlement::config::{
    env_optional, env_or_default, env_required, env_secs_or_default, CHAIN_NETWORK_ENV,
    CHAIN_RPC_URL_ENV, DATA_DIR_ENV, DEFAULT_DATA_DIR, FIAT_RATES_ENV,
    GATEWAY_CONTRACT_ADDRESS_ENV, GATEWAY_SIGNER_KEY_ENV, MERCHANTS_FILE_ENV, RATE_FEED_URL_ENV,
    SETTLE_STALE_AFTER_SECS_ENV, SETTLE_SWEEP_INTERVAL_SECS_ENV, WEBHOOK_SECRET_ENV,
};
use crossrail_settlement::ledger::LedgerStore;
use crossrail_settlement::merchants::{MerchantDirectory, MerchantResolver};
use crossrail_settlement::providers::{DisabledTransfers, FiatTransferApi, HttpTransferClient};
use crossrail_settlement::rates::{ConversionService, FixedRates, HttpRateFeed, RateSource};
use crossrail_settlement::reconcile::ReconcileCoordinator;
use crossrail_settlement::settlement::{
    SettlementDispatcher, SettlementQueue, SettlementSweeper, SettlementWorker,
};
use crossrail_settlement::state::AppState;

/// Capacity of the bounded settlement queue.
const SETTLEMENT_QUEUE_CAPACITY: usize = 1024;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if env_or_default("LOG_FORMAT", "pretty") == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let data_dir = PathBuf::from(env_or_default(DATA_DIR_ENV, DEFAULT_DATA_DIR));
    std::fs::create_dir_all(&data_dir)?;

    let ledger = Arc::new(LedgerStore::open(&data_dir.join("ledger.redb"))?);
    let directory = Arc::new(MerchantDirectory::open(&data_dir.join("merchants.redb"))?);
    let resolver = Arc::new(MerchantResolver::new(directory));

    if let Some(file) = env_optional(MERCHANTS_FILE_ENV) {
        let imported = resolver.sync_from_file(Path::new(&file))?;
        info!(count = imported, file = %file, "merchant directory synced");
    }

    let (queue, settlement_rx) = SettlementQueue::bounded(SETTLEMENT_QUEUE_CAPACITY);
    let coordinator = Arc::new(ReconcileCoordinator::new(
        ledger.clone(),
        resolver.clone(),
        queue.clone(),
    ));

    // Conversion sources: the fixed operator table answers first, then the
    // HTTP price feed.
    let mut sources: Vec<Arc<dyn RateSource>> = Vec::new();
    if let Some(spec) = env_optional(FIAT_RATES_ENV) {
        sources.push(Arc::new(FixedRates::parse(&spec)?));
    }
    if let Some(feed_url) = env_optional(RATE_FEED_URL_ENV) {
        sources.push(Arc::new(HttpRateFeed::new(feed_url)?));
    }
    if sources.is_empty() {
        warn!("no conversion sources configured, only same-currency settlements will succeed");
    }
    let rates = Arc::new(ConversionService::new(sources));

    let transfers: Arc<dyn FiatTransferApi> = match HttpTransferClient::from_env() {
        Ok(client) => Arc::new(client),
        Err(e) => {
            warn!(error = %e, "fiat payout rail disabled");
            Arc::new(DisabledTransfers)
        }
    };

    let rpc_url = env_optional(CHAIN_RPC_URL_ENV);
    let contract_address = env_optional(GATEWAY_CONTRACT_ADDRESS_ENV);

    let chain: Arc<dyn ChainCredit> = match (
        rpc_url.as_deref(),
        env_optional(GATEWAY_SIGNER_KEY_ENV),
        contract_address.as_deref(),
    ) {
        (Some(rpc), Some(key), Some(address)) => {
            let provider = signer_provider(rpc, &key)?;
            Arc::new(GatewayClient::new(&provider, address)?)
        }
        _ => {
            warn!("crypto payout rail disabled, no signer configured");
            Arc::new(DisabledCredit)
        }
    };

    let dispatcher = Arc::new(SettlementDispatcher::new(
        ledger.clone(),
        resolver,
        rates,
        transfers,
        chain,
    ));

    let shutdown = CancellationToken::new();
    let stale_after =
        chrono::Duration::seconds(env_secs_or_default(SETTLE_STALE_AFTER_SECS_ENV, 600) as i64);
    let sweep_interval =
        StdDuration::from_secs(env_secs_or_default(SETTLE_SWEEP_INTERVAL_SECS_ENV, 60));

    tokio::spawn(
        SettlementWorker::new(dispatcher, settlement_rx, stale_after).run(shutdown.clone()),
    );
    tokio::spawn(
        SettlementSweeper::new(ledger.clone(), queue.clone(), sweep_interval, stale_after)
            .run(shutdown.clone()),
    );

    match (rpc_url, contract_address) {
        (Some(rpc), Some(address)) => {
            let network = env_or_default(CHAIN_NETWORK_ENV, DEFAULT_NETWORK);
            let listener =
                ChainListener::new(coordinator.clone(), ledger.clone(), rpc, &address, network)?;
            tokio::spawn(listener.run(shutdown.clone()));
        }
        _ => warn!("chain listener disabled, no RPC endpoint or contract address configured"),
    }

    let webhook_secret = env_required(WEBHOOK_SECRET_ENV)?;
    let state = AppState::new(ledger, coordinator, queue, webhook_secret);
    let app = api::router(state);

    let host = env_or_default("HOST", "0.0.0.0");
    let port = env_or_default("PORT", "8080");
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Crossrail settlement engine listening");

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutdown signal received");
                shutdown.cancel();
            }
        })
        .await?;

    shutdown.cancel();
    Ok(())
}
