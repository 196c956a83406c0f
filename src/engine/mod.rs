// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Settlement Engine
//!
//! Wires the store, the per-chain RPC capabilities, and the components into
//! one service object:
//!
//! - [`scanner`] — per-chain deposit discovery workers
//! - [`reconciler`] — candidate dedup and confirmation tracking
//! - [`poster`] — the balanced-posting contract
//! - [`projector`] — read-side balances and replay audit
//! - [`withdrawals`] — the withdrawal state machine
//! - [`sweeper`] — per-chain custody consolidation workers

pub mod poster;
pub mod projector;
pub mod reconciler;
pub mod scanner;
pub mod sweeper;
pub mod withdrawals;

pub use poster::LedgerPoster;
pub use projector::{BalanceProjector, RebuildReport};
pub use reconciler::DepositReconciler;
pub use scanner::ChainScanner;
pub use sweeper::SweepEngine;
pub use withdrawals::WithdrawalProcessor;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::chain::{ChainRpc, WalletDeriver};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::{SignedAmount, User, UserWallet};
use crate::store::{BalanceCache, LedgerDb};

/// Hot-balance cache sizing.
const BALANCE_CACHE_CAPACITY: usize = 1024;
const BALANCE_CACHE_TTL: Duration = Duration::from_secs(30);

/// The assembled treasury settlement service.
pub struct SettlementEngine {
    config: EngineConfig,
    db: Arc<LedgerDb>,
    poster: Arc<LedgerPoster>,
    projector: BalanceProjector,
    reconciler: Arc<DepositReconciler>,
    deriver: Arc<dyn WalletDeriver>,
    rpcs: HashMap<String, Arc<dyn ChainRpc>>,
}

impl SettlementEngine {
    pub fn new(
        config: EngineConfig,
        db: Arc<LedgerDb>,
        deriver: Arc<dyn WalletDeriver>,
    ) -> Self {
        let cache = Arc::new(BalanceCache::new(BALANCE_CACHE_CAPACITY, BALANCE_CACHE_TTL));
        let poster = Arc::new(LedgerPoster::new(db.clone(), cache.clone()));
        let projector = BalanceProjector::new(db.clone(), cache);
        let reconciler = Arc::new(DepositReconciler::new(db.clone(), poster.clone(), &config));
        Self {
            config,
            db,
            poster,
            projector,
            reconciler,
            deriver,
            rpcs: HashMap::new(),
        }
    }

    /// Register a chain: bootstraps its chart of accounts and remembers the
    /// RPC capability for workers and the withdrawal processor.
    pub fn register_chain(&mut self, rpc: Arc<dyn ChainRpc>) -> Result<(), EngineError> {
        let config = rpc.config();
        self.db
            .bootstrap_chain_accounts(&config.key, &config.custody_address)?;
        tracing::info!(chain = %config.key, "chain registered");
        self.rpcs.insert(config.key.clone(), rpc);
        Ok(())
    }

    /// Spawn one scanner and one sweeper per registered chain. Workers stop
    /// when `shutdown` is cancelled.
    pub fn spawn_workers(&self, shutdown: &CancellationToken) {
        for (key, rpc) in &self.rpcs {
            let scanner = ChainScanner::new(
                self.db.clone(),
                self.reconciler.clone(),
                rpc.clone(),
                &self.config,
            );
            tokio::spawn(scanner.run(shutdown.clone()));

            let sweeper = SweepEngine::new(
                self.db.clone(),
                self.poster.clone(),
                rpc.clone(),
                format!("sweeper-{key}"),
                &self.config,
            );
            tokio::spawn(sweeper.run(shutdown.clone()));
        }
    }

    // =========================================================================
    // Service surface for the API/admin layer
    // =========================================================================

    pub fn create_user(&self, user_id: &str) -> Result<User, EngineError> {
        let user = User::new(user_id.to_string());
        self.db.create_user(&user)?;
        Ok(user)
    }

    /// The user's deposit wallet on a chain, derived on first use.
    pub fn deposit_wallet(&self, user_id: &str, chain: &str) -> Result<UserWallet, EngineError> {
        if self.db.get_user(user_id)?.is_none() {
            return Err(EngineError::not_found("user", user_id));
        }
        Ok(self
            .db
            .create_wallet_for_user(user_id, chain, self.deriver.as_ref())?)
    }

    pub fn balance(&self, user_id: &str, chain: &str) -> Result<SignedAmount, EngineError> {
        self.projector.balance(user_id, chain)
    }

    pub fn projector(&self) -> &BalanceProjector {
        &self.projector
    }

    pub fn poster(&self) -> &Arc<LedgerPoster> {
        &self.poster
    }

    pub fn reconciler(&self) -> &Arc<DepositReconciler> {
        &self.reconciler
    }

    /// Withdrawal processor over the registered chains.
    pub fn withdrawal_processor(&self) -> WithdrawalProcessor {
        WithdrawalProcessor::new(
            self.db.clone(),
            self.poster.clone(),
            self.rpcs.clone(),
            &self.config,
        )
    }

    /// One-shot sweep trigger for a chain (admin surface). Worker loops use
    /// the same engine through [`spawn_workers`].
    ///
    /// [`spawn_workers`]: Self::spawn_workers
    pub fn sweep_engine(&self, chain: &str) -> Result<SweepEngine, EngineError> {
        let rpc = self
            .rpcs
            .get(chain)
            .ok_or_else(|| EngineError::Rejected(format!("unsupported chain {chain}")))?;
        Ok(SweepEngine::new(
            self.db.clone(),
            self.poster.clone(),
            rpc.clone(),
            format!("sweeper-{chain}-manual"),
            &self.config,
        ))
    }

    /// Audit access to the underlying store (ledgers, entries, snapshots).
    pub fn store(&self) -> &Arc<LedgerDb> {
        &self.db
    }
}
