// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Sweep engine: consolidates deposit-address funds into the custody wallet.
//!
//! State machine: Pending → Broadcasting → Confirmed | Failed.
//!
//! Sweeps are serialized per chain by the advisory lock on the treasury
//! state row. A concurrent invocation observes lock-busy and backs off; a
//! lock left behind by a crashed worker is reclaimed after the staleness
//! window. The sweepable surplus is the on-chain total minus outstanding
//! user liabilities minus the configured safety margin — funds owed to
//! users are never part of a sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::chain::{with_retries, ChainRpc};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::{Amount, ChainTransaction, SignedAmount, Sweep, SweepStatus};
use crate::store::{payouts_code, users_parent_code, LedgerDb, StoreError};

use super::poster::LedgerPoster;

pub struct SweepEngine {
    db: Arc<LedgerDb>,
    poster: Arc<LedgerPoster>,
    rpc: Arc<dyn ChainRpc>,
    /// Lock owner identity recorded for diagnostics.
    owner_id: String,
    lock_staleness: Duration,
    safety_margin: Amount,
    poll_interval: Duration,
    rpc_max_retries: u32,
    rpc_retry_base: Duration,
}

impl SweepEngine {
    pub fn new(
        db: Arc<LedgerDb>,
        poster: Arc<LedgerPoster>,
        rpc: Arc<dyn ChainRpc>,
        owner_id: impl Into<String>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            db,
            poster,
            rpc,
            owner_id: owner_id.into(),
            lock_staleness: config.lock_staleness,
            safety_margin: config.sweep_safety_margin,
            poll_interval: config.sweep_poll_interval,
            rpc_max_retries: config.rpc_max_retries,
            rpc_retry_base: config.rpc_retry_base,
        }
    }

    /// Run the sweep loop until the cancellation token is triggered.
    pub async fn run(self, shutdown: CancellationToken) {
        let chain = self.rpc.config().key.clone();
        tracing::info!(chain = %chain, owner = %self.owner_id, "sweep engine starting");

        loop {
            if shutdown.is_cancelled() {
                tracing::info!(chain = %chain, "sweep engine shutting down");
                return;
            }

            match self.sweep().await {
                Ok(Some(sweep)) => {
                    tracing::info!(chain = %chain, sweep_id = %sweep.sweep_id, status = ?sweep.status, "sweep pass done")
                }
                Ok(None) => {}
                Err(EngineError::LockBusy { holder, .. }) => {
                    tracing::debug!(chain = %chain, holder = %holder, "sweep lock busy, backing off")
                }
                Err(e) => {
                    tracing::warn!(chain = %chain, error = %e, "sweep pass failed, will retry")
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {},
                _ = shutdown.cancelled() => {
                    tracing::info!(chain = %chain, "sweep engine shutting down");
                    return;
                }
            }
        }
    }

    /// One sweep pass under the per-chain advisory lock.
    ///
    /// Returns `None` when there is nothing to consolidate (no Sweep row is
    /// created); a busy lock surfaces as [`EngineError::LockBusy`].
    pub async fn sweep(&self) -> Result<Option<Sweep>, EngineError> {
        let chain = self.rpc.config().key.clone();

        self.db
            .try_lock_treasury(&chain, &self.owner_id, self.lock_staleness)
            .map_err(|e| match e {
                StoreError::LockHeld { chain, holder } => EngineError::LockBusy { chain, holder },
                other => EngineError::Store(other),
            })?;

        let result = self.locked_sweep(&chain).await;

        if let Err(e) = self.db.unlock_treasury(&chain, &self.owner_id) {
            tracing::error!(chain = %chain, error = %e, "failed to release treasury lock");
        }

        result
    }

    async fn locked_sweep(&self, chain: &str) -> Result<Option<Sweep>, EngineError> {
        let config = self.rpc.config();
        let currency = config.native_currency.clone();

        // On-chain totals over deposit wallets and custody, refreshing the
        // per-wallet caches along the way.
        let mut onchain_total: Amount = 0;
        let mut richest: Option<(String, Amount)> = None;
        for address in self.db.list_wallet_addresses(chain)? {
            let balance = with_retries(self.rpc_max_retries, self.rpc_retry_base, || {
                self.rpc.address_balance(&address)
            })
            .await?;
            self.db.set_wallet_last_known_balance(&address, balance)?;
            onchain_total = onchain_total.saturating_add(balance);
            if richest.as_ref().map(|(_, b)| balance > *b).unwrap_or(true) {
                richest = Some((address, balance));
            }
        }
        let custody_balance = with_retries(self.rpc_max_retries, self.rpc_retry_base, || {
            self.rpc.address_balance(&config.custody_address)
        })
        .await?;
        onchain_total = onchain_total.saturating_add(custody_balance);

        let liabilities = self.chain_liabilities(chain, &currency)?;
        let liabilities_amount: Amount = liabilities.max(0) as Amount;

        let sweepable = onchain_total
            .saturating_sub(liabilities_amount)
            .saturating_sub(self.safety_margin);

        self.db
            .update_treasury_totals(chain, onchain_total, liabilities, sweepable)?;

        // Trial balance for the audit trail; drift here means the books and
        // the projections disagree and wants investigation.
        let snapshot = self.db.take_balance_snapshot(&currency, chain)?;
        if snapshot.drift {
            tracing::error!(chain = %chain, "trial balance drift detected");
        }

        let Some((from_address, from_balance)) = richest else {
            return Ok(None);
        };
        // One consolidation per pass: the richest deposit wallet, capped at
        // the sweepable surplus.
        let amount = sweepable.min(from_balance);
        if amount == 0 {
            tracing::debug!(chain = %chain, "nothing sweepable");
            return Ok(None);
        }

        let sweep = Sweep::new_pending(
            chain.to_string(),
            currency.clone(),
            amount,
            from_address.clone(),
            config.custody_address.to_lowercase(),
        );
        self.db.create_sweep(&sweep)?;

        let send = with_retries(self.rpc_max_retries, self.rpc_retry_base, || {
            self.rpc
                .broadcast_transfer(&config.custody_address, amount, &currency)
        })
        .await;

        let send = match send {
            Ok(send) => send,
            Err(e) => {
                tracing::warn!(chain = %chain, error = %e, "sweep broadcast failed");
                let failed = self.db.set_sweep_status(
                    &sweep.sweep_id,
                    SweepStatus::Failed,
                    Some(e.to_string()),
                )?;
                return Ok(Some(failed));
            }
        };

        self.db.upsert_chain_tx(&ChainTransaction::new_broadcasted(
            send.tx_hash.clone(),
            chain.to_string(),
            from_address,
            config.custody_address.to_lowercase(),
            amount,
            currency,
        ))?;
        self.db
            .mark_sweep_broadcasting(&sweep.sweep_id, &send.tx_hash)?;

        self.settle_sweep(&sweep.sweep_id).await
    }

    /// Drive a broadcasting sweep to its terminal state from the receipt.
    /// Safe to call repeatedly; unmined sweeps stay Broadcasting.
    pub async fn settle_sweep(&self, sweep_id: &str) -> Result<Option<Sweep>, EngineError> {
        let sweep = self
            .db
            .get_sweep(sweep_id)?
            .ok_or_else(|| EngineError::not_found("sweep", sweep_id))?;
        if sweep.status != SweepStatus::Broadcasting {
            return Ok(Some(sweep));
        }
        let Some(tx_hash) = sweep.tx_hash.clone() else {
            return Err(EngineError::InvalidTransition {
                entity: "sweep",
                id: sweep_id.to_string(),
                detail: "broadcasting without a hash".to_string(),
            });
        };

        let config = self.rpc.config();
        let receipt = with_retries(self.rpc_max_retries, self.rpc_retry_base, || {
            self.rpc.confirmations(&tx_hash)
        })
        .await?;

        match receipt {
            Some(receipt) if !receipt.success => {
                self.db.fail_chain_tx(&tx_hash)?;
                let failed = self.db.set_sweep_status(
                    sweep_id,
                    SweepStatus::Failed,
                    Some("on-chain execution reverted".to_string()),
                )?;
                Ok(Some(failed))
            }
            Some(receipt) if receipt.confirmations >= config.confirmation_depth => {
                self.db.record_chain_tx_confirmations(
                    &tx_hash,
                    receipt.confirmations,
                    config.confirmation_depth,
                )?;
                self.poster.post_sweep_settlement(
                    sweep_id,
                    &sweep.chain,
                    &sweep.currency,
                    sweep.amount,
                    &tx_hash,
                )?;
                let confirmed =
                    self.db
                        .set_sweep_status(sweep_id, SweepStatus::Confirmed, None)?;
                tracing::info!(sweep_id = %sweep_id, amount = %sweep.amount, "sweep confirmed");
                Ok(Some(confirmed))
            }
            _ => Ok(Some(sweep)),
        }
    }

    /// Outstanding user-owed funds on a chain: every user liability account
    /// plus the pending-payout reservations.
    fn chain_liabilities(&self, chain: &str, currency: &str) -> Result<SignedAmount, EngineError> {
        let mut total: SignedAmount = 0;
        if let Some(parent) = self.db.get_account_by_code(&users_parent_code(chain))? {
            for child in self.db.list_child_accounts(&parent.account_id)? {
                total += self.db.account_balance(&child.account_id, currency)?;
            }
        }
        if let Some(payouts) = self.db.get_account_by_code(&payouts_code(chain))? {
            total += self.db.account_balance(&payouts.account_id, currency)?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainConfig, ChainRpcError, SendResult, TransferEvent, TxConfirmation};
    use crate::models::{TxDirection, User};
    use crate::store::db::test_util::temp_db;
    use crate::store::BalanceCache;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    struct StubDeriver;
    impl crate::chain::WalletDeriver for StubDeriver {
        fn derive_address(&self, chain: &str, index: u64) -> Result<String, ChainRpcError> {
            Ok(format!("0x{chain}{index:038}"))
        }
    }

    struct CustodyRpc {
        config: ChainConfig,
        balances: Mutex<HashMap<String, u128>>,
        fail_broadcast: AtomicBool,
        broadcasts: AtomicU64,
    }

    impl CustodyRpc {
        fn new() -> Self {
            Self {
                config: ChainConfig {
                    key: "fuji".to_string(),
                    name: "mock".to_string(),
                    chain_id: 0,
                    rpc_url: "http://localhost".to_string(),
                    explorer_url: "http://localhost".to_string(),
                    confirmation_depth: 12,
                    native_currency: "AVAX".to_string(),
                    native_decimals: 18,
                    token_contracts: Vec::new(),
                    custody_address: "0xcustody".to_string(),
                },
                balances: Mutex::new(HashMap::new()),
                fail_broadcast: AtomicBool::new(false),
                broadcasts: AtomicU64::new(0),
            }
        }

        fn set_balance(&self, address: &str, balance: u128) {
            self.balances
                .lock()
                .unwrap()
                .insert(address.to_lowercase(), balance);
        }
    }

    #[async_trait]
    impl ChainRpc for CustodyRpc {
        fn config(&self) -> &ChainConfig {
            &self.config
        }

        async fn head_block(&self) -> Result<u64, ChainRpcError> {
            Ok(1_000)
        }

        async fn transfers_in_range(
            &self,
            _from: u64,
            _to: u64,
            _watched: &HashSet<String>,
        ) -> Result<Vec<TransferEvent>, ChainRpcError> {
            Ok(Vec::new())
        }

        async fn confirmations(
            &self,
            _tx_hash: &str,
        ) -> Result<Option<TxConfirmation>, ChainRpcError> {
            Ok(Some(TxConfirmation {
                block_number: 900,
                confirmations: 100,
                success: true,
            }))
        }

        async fn broadcast_transfer(
            &self,
            _to: &str,
            _amount: u128,
            _currency: &str,
        ) -> Result<SendResult, ChainRpcError> {
            if self.fail_broadcast.load(Ordering::SeqCst) {
                return Err(ChainRpcError::Broadcast("node rejected tx".to_string()));
            }
            let n = self.broadcasts.fetch_add(1, Ordering::SeqCst);
            Ok(SendResult {
                tx_hash: format!("0xsweep{n:04}"),
                explorer_url: format!("http://localhost/tx/0xsweep{n:04}"),
            })
        }

        async fn address_balance(&self, address: &str) -> Result<u128, ChainRpcError> {
            Ok(*self
                .balances
                .lock()
                .unwrap()
                .get(&address.to_lowercase())
                .unwrap_or(&0))
        }
    }

    fn setup(rpc: Arc<CustodyRpc>) -> (Arc<LedgerDb>, SweepEngine, String, tempfile::TempDir) {
        let (db, dir) = temp_db();
        let db = Arc::new(db);
        db.bootstrap_chain_accounts("fuji", "0xcustody").unwrap();
        db.create_user(&User::new("user-1".to_string())).unwrap();
        let wallet = db
            .create_wallet_for_user("user-1", "fuji", &StubDeriver)
            .unwrap();

        let mut config = EngineConfig::default();
        config.rpc_retry_base = Duration::from_millis(1);

        let cache = Arc::new(BalanceCache::new(16, Duration::from_secs(60)));
        let poster = Arc::new(LedgerPoster::new(db.clone(), cache));
        let sweeper = SweepEngine::new(db.clone(), poster, rpc, "sweeper-test", &config);
        (db, sweeper, wallet.address, dir)
    }

    #[tokio::test]
    async fn sweep_moves_surplus_and_posts_settlement() {
        let rpc = Arc::new(CustodyRpc::new());
        let (db, sweeper, deposit_addr, _dir) = setup(rpc.clone());

        // 500 on the deposit wallet, no user liabilities: all surplus.
        rpc.set_balance(&deposit_addr, 500);

        let sweep = sweeper.sweep().await.unwrap().unwrap();
        assert_eq!(sweep.status, SweepStatus::Confirmed);
        assert_eq!(sweep.amount, 500);
        assert_eq!(sweep.from_address, deposit_addr);

        // Settlement ledger moved deposits → custody in the books.
        let ledgers = db.list_ledgers_for_reference(&sweep.sweep_id).unwrap();
        assert_eq!(ledgers.len(), 1);

        // Lock released for the next pass.
        let state = db.get_treasury_state("fuji").unwrap();
        assert!(!state.locked);
        assert_eq!(state.onchain_total, 500);
        assert_eq!(state.sweepable_balance, 500);

        // Each pass leaves a trial-balance snapshot behind.
        let snapshots = db.list_balance_snapshots("AVAX", "fuji").unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!(!snapshots[0].drift);
    }

    #[tokio::test]
    async fn liabilities_and_margin_reduce_sweepable() {
        let rpc = Arc::new(CustodyRpc::new());
        let (db, sweeper, deposit_addr, _dir) = setup(rpc.clone());

        // Credit the user 300: liabilities 300 against 500 on-chain.
        let tx = ChainTransaction::new_observed(
            "0xfund".to_string(),
            "fuji".to_string(),
            TxDirection::Inbound,
            "0xext".to_string(),
            deposit_addr.clone(),
            300,
            "AVAX".to_string(),
            5,
        );
        db.upsert_chain_tx(&tx).unwrap();
        let cache = Arc::new(BalanceCache::new(4, Duration::from_secs(60)));
        let poster = LedgerPoster::new(db.clone(), cache);
        poster
            .post_deposit_credit("user-1", "fuji", "AVAX", 300, "0xfund")
            .unwrap();

        rpc.set_balance(&deposit_addr, 500);

        let sweep = sweeper.sweep().await.unwrap().unwrap();
        assert_eq!(sweep.amount, 200);

        let state = db.get_treasury_state("fuji").unwrap();
        assert_eq!(state.user_liabilities, 300);
        assert_eq!(state.sweepable_balance, 200);
    }

    #[tokio::test]
    async fn zero_surplus_is_a_no_op() {
        let rpc = Arc::new(CustodyRpc::new());
        let (db, sweeper, deposit_addr, _dir) = setup(rpc.clone());

        // Everything on-chain is owed to the user.
        let tx = ChainTransaction::new_observed(
            "0xfund".to_string(),
            "fuji".to_string(),
            TxDirection::Inbound,
            "0xext".to_string(),
            deposit_addr.clone(),
            500,
            "AVAX".to_string(),
            5,
        );
        db.upsert_chain_tx(&tx).unwrap();
        let cache = Arc::new(BalanceCache::new(4, Duration::from_secs(60)));
        let poster = LedgerPoster::new(db.clone(), cache);
        poster
            .post_deposit_credit("user-1", "fuji", "AVAX", 500, "0xfund")
            .unwrap();
        rpc.set_balance(&deposit_addr, 500);

        let result = sweeper.sweep().await.unwrap();
        assert!(result.is_none());

        // No Sweep row was created and the lock is free.
        let state = db.get_treasury_state("fuji").unwrap();
        assert!(!state.locked);
        assert_eq!(state.sweepable_balance, 0);
    }

    #[tokio::test]
    async fn concurrent_sweep_observes_lock_busy() {
        let rpc = Arc::new(CustodyRpc::new());
        let (db, sweeper, deposit_addr, _dir) = setup(rpc.clone());
        rpc.set_balance(&deposit_addr, 500);

        // Another worker holds the lock.
        db.try_lock_treasury("fuji", "other-sweeper", Duration::from_secs(600))
            .unwrap();

        let err = sweeper.sweep().await.unwrap_err();
        assert!(matches!(err, EngineError::LockBusy { .. }));

        // The holder's lock is untouched.
        let state = db.get_treasury_state("fuji").unwrap();
        assert_eq!(state.locked_by.as_deref(), Some("other-sweeper"));
    }

    #[tokio::test]
    async fn broadcast_failure_records_error_and_releases_lock() {
        let rpc = Arc::new(CustodyRpc::new());
        rpc.fail_broadcast.store(true, Ordering::SeqCst);
        let (db, sweeper, deposit_addr, _dir) = setup(rpc.clone());
        rpc.set_balance(&deposit_addr, 500);

        let sweep = sweeper.sweep().await.unwrap().unwrap();
        assert_eq!(sweep.status, SweepStatus::Failed);
        assert!(sweep.error.is_some());

        let state = db.get_treasury_state("fuji").unwrap();
        assert!(!state.locked);

        // No settlement was posted for the failed sweep.
        assert!(db.list_ledgers_for_reference(&sweep.sweep_id).unwrap().is_empty());
    }
}
