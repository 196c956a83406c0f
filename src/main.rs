// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::{env, sync::Arc};

use tokio_util::sync::CancellationToken;

use relational_treasury::chain::{avax_fuji, avax_mainnet, ChainRpcError, EvmRpc, WalletDeriver};
use relational_treasury::store::LedgerDb;
use relational_treasury::{EngineConfig, SettlementEngine};

/// Deriver wired to the external key-management service in deployment;
/// addresses derived here are deterministic per (chain, index).
struct EnvDeriver;

impl WalletDeriver for EnvDeriver {
    fn derive_address(&self, chain: &str, index: u64) -> Result<String, ChainRpcError> {
        let base = env::var("DERIVATION_BASE_ADDRESS")
            .map_err(|_| ChainRpcError::InvalidAddress("DERIVATION_BASE_ADDRESS unset".into()))?;
        Ok(format!("{base}-{chain}-{index}"))
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = EngineConfig::from_env();
    tracing::info!(data_dir = %config.data_dir, "starting treasury settlement engine");

    let db = Arc::new(LedgerDb::open(&config.db_path()).expect("failed to open ledger database"));

    let mut settlement = SettlementEngine::new(config, db, Arc::new(EnvDeriver));

    let custody = env::var("CUSTODY_ADDRESS").expect("CUSTODY_ADDRESS must be set");
    let chains = env::var("CHAINS").unwrap_or_else(|_| "fuji".to_string());
    for key in chains.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let chain_config = match key {
            "fuji" => avax_fuji(custody.clone()),
            "avax" => avax_mainnet(custody.clone()),
            other => {
                tracing::error!(chain = %other, "unknown chain key, skipping");
                continue;
            }
        };
        let rpc = EvmRpc::new(chain_config).expect("failed to build chain client");
        settlement
            .register_chain(Arc::new(rpc))
            .expect("failed to register chain");
    }

    let shutdown = CancellationToken::new();
    settlement.spawn_workers(&shutdown);

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    tracing::info!("shutdown signal received");
    shutdown.cancel();
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let format = env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    if format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
