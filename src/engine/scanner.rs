// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Chain Scanner
//!
//! Background task that watches one chain's finalized history for transfers
//! touching known addresses and feeds them to the reconciler.
//!
//! ## Strategy
//!
//! Each pass reads the durable scan cursor, walks the window up to
//! `head - confirmation_depth` in chunks, and records every matching
//! transfer as a candidate chain transaction. The cursor advances only
//! after a chunk's batch is durably recorded; a crash mid-pass re-reads the
//! same range on the next tick, which the hash-keyed upsert absorbs.
//!
//! Blocks inside the confirmation window are never trusted; reorg handling
//! for already-recorded rows lives in the reconciler's confirmation pass.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::chain::{with_retries, ChainRpc};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::TxDirection;
use crate::store::LedgerDb;

use super::reconciler::DepositReconciler;

/// How far back to look when starting fresh (no cursor).
const INITIAL_LOOKBACK_BLOCKS: u64 = 10_000;

/// Per-chain scan worker.
pub struct ChainScanner {
    db: Arc<LedgerDb>,
    reconciler: Arc<DepositReconciler>,
    rpc: Arc<dyn ChainRpc>,
    poll_interval: Duration,
    chunk_size: u64,
    rpc_max_retries: u32,
    rpc_retry_base: Duration,
}

impl ChainScanner {
    pub fn new(
        db: Arc<LedgerDb>,
        reconciler: Arc<DepositReconciler>,
        rpc: Arc<dyn ChainRpc>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            db,
            reconciler,
            rpc,
            poll_interval: config.scan_poll_interval,
            chunk_size: config.scan_chunk_size,
            rpc_max_retries: config.rpc_max_retries,
            rpc_retry_base: config.rpc_retry_base,
        }
    }

    /// Run the scan loop until the cancellation token is triggered.
    ///
    /// This should be spawned as a background task:
    /// ```rust,ignore
    /// tokio::spawn(scanner.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        let chain = self.rpc.config().key.clone();
        tracing::info!(chain = %chain, "chain scanner starting");

        loop {
            if shutdown.is_cancelled() {
                tracing::info!(chain = %chain, "chain scanner shutting down");
                return;
            }

            if let Err(e) = self.scan_step().await {
                tracing::warn!(chain = %chain, error = %e, "scan pass failed, will retry");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {},
                _ = shutdown.cancelled() => {
                    tracing::info!(chain = %chain, "chain scanner shutting down");
                    return;
                }
            }
        }
    }

    /// Execute one scan pass: cursor → safe head, then confirmations.
    pub async fn scan_step(&self) -> Result<(), EngineError> {
        let config = self.rpc.config();
        let chain = config.key.as_str();

        let head = with_retries(self.rpc_max_retries, self.rpc_retry_base, || {
            self.rpc.head_block()
        })
        .await?;
        let safe_head = head.saturating_sub(config.confirmation_depth);

        let cursor = self.db.get_scan_state(chain)?.last_scanned_block;
        let start = if cursor == 0 {
            safe_head.saturating_sub(INITIAL_LOOKBACK_BLOCKS)
        } else {
            cursor + 1
        };

        if start <= safe_head {
            let mut from = start;
            while from <= safe_head {
                let to = (from + self.chunk_size - 1).min(safe_head);
                let recorded = self.scan_window(from, to).await?;
                if recorded > 0 {
                    tracing::debug!(
                        chain = %chain,
                        from_block = from,
                        to_block = to,
                        transfers = recorded,
                        "recorded transfer candidates"
                    );
                }
                // Only now is the window durably covered.
                self.db.advance_scan_cursor(chain, to)?;
                from = to + 1;
            }
        }

        let posted = self.reconciler.confirm_pending(self.rpc.as_ref(), head).await?;
        if posted > 0 {
            tracing::info!(chain = %chain, deposits = posted, "posted confirmed deposits");
        }
        Ok(())
    }

    /// Record all matching transfers in one window. Returns how many.
    async fn scan_window(&self, from_block: u64, to_block: u64) -> Result<usize, EngineError> {
        let config = self.rpc.config();
        let chain = config.key.as_str();

        let watched = self.watch_set()?;
        if watched.is_empty() {
            return Ok(0);
        }

        let events = with_retries(self.rpc_max_retries, self.rpc_retry_base, || {
            self.rpc.transfers_in_range(from_block, to_block, &watched)
        })
        .await?;

        let deposit_addresses: HashSet<String> =
            self.db.list_wallet_addresses(chain)?.into_iter().collect();

        let mut recorded = 0;
        let mut touched_wallets: HashSet<String> = HashSet::new();

        for event in &events {
            let to = event.to.to_lowercase();
            let from = event.from.to_lowercase();

            let direction = if watched.contains(&to) {
                TxDirection::Inbound
            } else if watched.contains(&from) {
                TxDirection::Outbound
            } else {
                continue;
            };

            self.reconciler.record_candidate(event, chain, direction)?;
            recorded += 1;

            if deposit_addresses.contains(&to) {
                touched_wallets.insert(to);
            }
        }

        // Refresh the non-authoritative balance cache on touched wallets.
        for address in touched_wallets {
            match with_retries(self.rpc_max_retries, self.rpc_retry_base, || {
                self.rpc.address_balance(&address)
            })
            .await
            {
                Ok(balance) => {
                    self.db.set_wallet_last_known_balance(&address, balance)?;
                }
                Err(e) => {
                    tracing::warn!(address = %address, error = %e, "wallet balance refresh failed");
                }
            }
        }

        Ok(recorded)
    }

    /// Deposit addresses plus the custody wallet, lowercased.
    fn watch_set(&self) -> Result<HashSet<String>, EngineError> {
        let config = self.rpc.config();
        let mut watched: HashSet<String> = self
            .db
            .list_wallet_addresses(&config.key)?
            .into_iter()
            .collect();
        watched.insert(config.custody_address.to_lowercase());
        Ok(watched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainConfig, ChainRpcError, SendResult, TransferEvent, TxConfirmation};
    use crate::models::{ChainTxStatus, User};
    use crate::store::db::test_util::temp_db;
    use crate::store::BalanceCache;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct StubDeriver;
    impl crate::chain::WalletDeriver for StubDeriver {
        fn derive_address(&self, chain: &str, index: u64) -> Result<String, ChainRpcError> {
            Ok(format!("0x{chain}{index:038}"))
        }
    }

    /// Scripted chain: fixed transfer set, per-hash receipts, injectable
    /// transient head failures.
    struct ScriptedRpc {
        config: ChainConfig,
        head: Mutex<u64>,
        transfers: Vec<TransferEvent>,
        receipts: Mutex<HashMap<String, TxConfirmation>>,
        head_failures: AtomicU32,
    }

    impl ScriptedRpc {
        fn new(head: u64, transfers: Vec<TransferEvent>) -> Self {
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
                head: Mutex::new(head),
                transfers,
                receipts: Mutex::new(HashMap::new()),
                head_failures: AtomicU32::new(0),
            }
        }

        fn confirm(&self, tx_hash: &str, block: u64, head: u64) {
            self.receipts.lock().unwrap().insert(
                tx_hash.to_string(),
                TxConfirmation {
                    block_number: block,
                    confirmations: head.saturating_sub(block) + 1,
                    success: true,
                },
            );
        }
    }

    #[async_trait]
    impl ChainRpc for ScriptedRpc {
        fn config(&self) -> &ChainConfig {
            &self.config
        }

        async fn head_block(&self) -> Result<u64, ChainRpcError> {
            if self.head_failures.load(Ordering::SeqCst) > 0 {
                self.head_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ChainRpcError::Transient("node busy".to_string()));
            }
            Ok(*self.head.lock().unwrap())
        }

        async fn transfers_in_range(
            &self,
            from: u64,
            to: u64,
            watched: &HashSet<String>,
        ) -> Result<Vec<TransferEvent>, ChainRpcError> {
            Ok(self
                .transfers
                .iter()
                .filter(|t| {
                    t.block_number >= from
                        && t.block_number <= to
                        && (watched.contains(&t.to.to_lowercase())
                            || watched.contains(&t.from.to_lowercase()))
                })
                .cloned()
                .collect())
        }

        async fn confirmations(
            &self,
            tx_hash: &str,
        ) -> Result<Option<TxConfirmation>, ChainRpcError> {
            Ok(self.receipts.lock().unwrap().get(tx_hash).copied())
        }

        async fn broadcast_transfer(
            &self,
            _to: &str,
            _amount: u128,
            _currency: &str,
        ) -> Result<SendResult, ChainRpcError> {
            Err(ChainRpcError::Broadcast("not in this test".to_string()))
        }

        async fn address_balance(&self, _address: &str) -> Result<u128, ChainRpcError> {
            Ok(1_000)
        }
    }

    fn build_scanner(
        rpc: Arc<ScriptedRpc>,
    ) -> (
        Arc<LedgerDb>,
        ChainScanner,
        Arc<DepositReconciler>,
        String,
        tempfile::TempDir,
    ) {
        let (db, dir) = temp_db();
        let db = Arc::new(db);
        db.bootstrap_chain_accounts("fuji", "0xcustody").unwrap();
        db.create_user(&User::new("user-1".to_string())).unwrap();
        let wallet = db
            .create_wallet_for_user("user-1", "fuji", &StubDeriver)
            .unwrap();

        let mut config = EngineConfig::default();
        config.scan_chunk_size = 100;
        config.rpc_retry_base = Duration::from_millis(1);

        let cache = Arc::new(BalanceCache::new(16, Duration::from_secs(60)));
        let poster = Arc::new(super::super::poster::LedgerPoster::new(db.clone(), cache));
        let reconciler = Arc::new(DepositReconciler::new(db.clone(), poster, &config));
        let scanner = ChainScanner::new(db.clone(), reconciler.clone(), rpc, &config);
        (db, scanner, reconciler, wallet.address, dir)
    }

    fn deposit_event(hash: &str, to: &str, block: u64) -> TransferEvent {
        TransferEvent {
            tx_hash: hash.to_string(),
            from: "0xexternal".to_string(),
            to: to.to_string(),
            amount: 50,
            currency: "AVAX".to_string(),
            block_number: block,
        }
    }

    /// Address derivation is deterministic, so transfers can name the
    /// wallet before the db exists.
    const WALLET_ADDR: &str = "0xfuji00000000000000000000000000000000000000";

    #[tokio::test]
    async fn scan_records_candidates_and_advances_cursor() {
        let rpc = Arc::new(ScriptedRpc::new(
            1_000,
            vec![deposit_event("0xd1", WALLET_ADDR, 950)],
        ));
        let (db, scanner, _reconciler, addr, _dir) = build_scanner(rpc);
        assert_eq!(addr, WALLET_ADDR);

        scanner.scan_step().await.unwrap();

        // Candidate recorded, cursor at safe head (1000 - 12).
        let tx = db.get_chain_tx("0xd1").unwrap().unwrap();
        assert_eq!(tx.status, ChainTxStatus::Pending);
        assert_eq!(db.get_scan_state("fuji").unwrap().last_scanned_block, 988);

        // Balance cache refreshed from the chain.
        let wallet = db.get_wallet_by_address(&addr).unwrap().unwrap();
        assert_eq!(wallet.last_known_balance, 1_000);
    }

    #[tokio::test]
    async fn rescan_after_simulated_crash_is_idempotent() {
        let event = deposit_event("0xd1", WALLET_ADDR, 950);
        let rpc = Arc::new(ScriptedRpc::new(1_000, vec![event.clone()]));
        let (db, scanner, reconciler, _addr, _dir) = build_scanner(rpc);

        // Crash mid-pass: the batch was durably recorded but the process
        // died before the cursor advanced.
        reconciler
            .record_candidate(&event, "fuji", crate::models::TxDirection::Inbound)
            .unwrap();
        assert_eq!(db.get_scan_state("fuji").unwrap().last_scanned_block, 0);

        // The next pass re-reads the same range; the upsert absorbs it.
        scanner.scan_step().await.unwrap();
        scanner.scan_step().await.unwrap();

        assert_eq!(db.get_scan_state("fuji").unwrap().last_scanned_block, 988);
        let pending = db
            .list_chain_txs_by_status("fuji", ChainTxStatus::Pending)
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn confirmed_deposit_flows_to_user_balance_through_scan() {
        let rpc = Arc::new(ScriptedRpc::new(
            1_000,
            vec![deposit_event("0xd1", WALLET_ADDR, 950)],
        ));
        rpc.confirm("0xd1", 950, 1_000);
        let (db, scanner, _reconciler, _addr, _dir) = build_scanner(rpc);

        scanner.scan_step().await.unwrap();

        assert_eq!(db.get_user_balance("user-1", "fuji").unwrap(), 50);
        let tx = db.get_chain_tx("0xd1").unwrap().unwrap();
        assert_eq!(tx.status, ChainTxStatus::Confirmed);
        assert!(tx.posted);
    }

    #[tokio::test]
    async fn transient_head_failures_are_retried() {
        let rpc = Arc::new(ScriptedRpc::new(
            1_000,
            vec![deposit_event("0xd1", WALLET_ADDR, 950)],
        ));
        rpc.head_failures.store(2, Ordering::SeqCst);
        let (db, scanner, _reconciler, _addr, _dir) = build_scanner(rpc);

        scanner.scan_step().await.unwrap();
        assert!(db.get_chain_tx("0xd1").unwrap().is_some());
    }
}
