// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Deposit reconciler: turns scanner-observed transfers into durable,
//! de-duplicated chain transactions and posts each confirmed inbound
//! deposit exactly once.

use std::sync::Arc;
use std::time::Duration;

use crate::chain::{with_retries, ChainRpc, TransferEvent};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::{ChainTransaction, ChainTxStatus, TxDirection};
use crate::store::{LedgerDb, StoreError, UpsertOutcome};

use super::poster::LedgerPoster;

pub struct DepositReconciler {
    db: Arc<LedgerDb>,
    poster: Arc<LedgerPoster>,
    rpc_max_retries: u32,
    rpc_retry_base: Duration,
}

impl DepositReconciler {
    pub fn new(db: Arc<LedgerDb>, poster: Arc<LedgerPoster>, config: &EngineConfig) -> Self {
        Self {
            db,
            poster,
            rpc_max_retries: config.rpc_max_retries,
            rpc_retry_base: config.rpc_retry_base,
        }
    }

    /// Record one observed transfer, idempotent by tx hash. Duplicates are
    /// absorbed; a reorged-out row re-enters as Pending at its new block.
    pub fn record_candidate(
        &self,
        event: &TransferEvent,
        chain: &str,
        direction: TxDirection,
    ) -> Result<UpsertOutcome, EngineError> {
        let candidate = ChainTransaction::new_observed(
            event.tx_hash.clone(),
            chain.to_string(),
            direction,
            event.from.clone(),
            event.to.clone(),
            event.amount,
            event.currency.clone(),
            event.block_number,
        );
        let outcome = self.db.upsert_chain_tx(&candidate)?;
        match outcome {
            UpsertOutcome::Inserted => {
                tracing::debug!(tx_hash = %event.tx_hash, chain = %chain, "recorded candidate")
            }
            UpsertOutcome::Revived => {
                tracing::info!(tx_hash = %event.tx_hash, chain = %chain, "revived reorged candidate")
            }
            UpsertOutcome::Duplicate => {}
        }
        Ok(outcome)
    }

    /// Advance confirmations for every pending transaction on a chain and
    /// post newly confirmed inbound deposits. Returns the number posted.
    ///
    /// A transaction whose receipt has vanished although its recorded block
    /// is past the confirmation depth was reorged out: it is marked Failed
    /// and will be revived if the scanner re-detects it.
    pub async fn confirm_pending(
        &self,
        rpc: &dyn ChainRpc,
        head: u64,
    ) -> Result<usize, EngineError> {
        let config = rpc.config();
        let pending = self
            .db
            .list_chain_txs_by_status(&config.key, ChainTxStatus::Pending)?;

        let mut posted = 0;
        for tx in pending {
            let receipt = with_retries(self.rpc_max_retries, self.rpc_retry_base, || {
                rpc.confirmations(&tx.tx_hash)
            })
            .await?;

            match receipt {
                Some(receipt) if !receipt.success => {
                    tracing::warn!(tx_hash = %tx.tx_hash, "on-chain execution reverted");
                    self.db.fail_chain_tx(&tx.tx_hash)?;
                }
                Some(receipt) => {
                    let updated = self.db.record_chain_tx_confirmations(
                        &tx.tx_hash,
                        receipt.confirmations,
                        config.confirmation_depth,
                    )?;
                    if updated.status == ChainTxStatus::Confirmed {
                        posted += self.post_if_inbound(&updated)?;
                    }
                }
                None => {
                    let superseded = tx
                        .block_number
                        .map(|block| head.saturating_sub(block) >= config.confirmation_depth)
                        .unwrap_or(false);
                    if superseded {
                        tracing::warn!(
                            tx_hash = %tx.tx_hash,
                            chain = %config.key,
                            "transaction superseded by reorg, re-queueing"
                        );
                        self.db.fail_chain_tx(&tx.tx_hash)?;
                    }
                }
            }
        }
        Ok(posted)
    }

    /// Credit the owning user for a confirmed inbound transfer. At most one
    /// posting per hash survives; replays are absorbed.
    fn post_if_inbound(&self, tx: &ChainTransaction) -> Result<usize, EngineError> {
        if tx.direction != TxDirection::Inbound || tx.posted {
            return Ok(0);
        }
        let Some(wallet) = self.db.get_wallet_by_address(&tx.to)? else {
            // Inbound to a treasury-owned address (custody funding); nothing
            // to credit a user for.
            tracing::debug!(tx_hash = %tx.tx_hash, to = %tx.to, "inbound to non-user address");
            return Ok(0);
        };

        match self.poster.post_deposit_credit(
            &wallet.user_id,
            &tx.chain,
            &tx.currency,
            tx.amount,
            &tx.tx_hash,
        ) {
            Ok(_) => {
                tracing::info!(
                    tx_hash = %tx.tx_hash,
                    user_id = %wallet.user_id,
                    amount = %tx.amount,
                    "credited confirmed deposit"
                );
                Ok(1)
            }
            Err(EngineError::Store(StoreError::AlreadyPosted(_))) => Ok(0),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainConfig, ChainRpcError, SendResult, TxConfirmation};
    use crate::models::User;
    use crate::store::db::test_util::temp_db;
    use crate::store::BalanceCache;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    struct StubDeriver;
    impl crate::chain::WalletDeriver for StubDeriver {
        fn derive_address(&self, chain: &str, index: u64) -> Result<String, ChainRpcError> {
            Ok(format!("0x{chain}{index:038}"))
        }
    }

    /// Mock chain: scripted head, receipts, and transfer windows.
    pub struct MockRpc {
        pub config: ChainConfig,
        pub head: Mutex<u64>,
        pub receipts: Mutex<HashMap<String, TxConfirmation>>,
    }

    impl MockRpc {
        pub fn new(confirmation_depth: u64) -> Self {
            Self {
                config: ChainConfig {
                    key: "fuji".to_string(),
                    name: "mock".to_string(),
                    chain_id: 0,
                    rpc_url: "http://localhost".to_string(),
                    explorer_url: "http://localhost".to_string(),
                    confirmation_depth,
                    native_currency: "AVAX".to_string(),
                    native_decimals: 18,
                    token_contracts: Vec::new(),
                    custody_address: "0xcustody".to_string(),
                },
                head: Mutex::new(0),
                receipts: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl ChainRpc for MockRpc {
        fn config(&self) -> &ChainConfig {
            &self.config
        }

        async fn head_block(&self) -> Result<u64, ChainRpcError> {
            Ok(*self.head.lock().unwrap())
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
            Ok(0)
        }
    }

    fn setup() -> (Arc<LedgerDb>, DepositReconciler, String, tempfile::TempDir) {
        let (db, dir) = temp_db();
        let db = Arc::new(db);
        db.bootstrap_chain_accounts("fuji", "0xcustody").unwrap();
        db.create_user(&User::new("user-1".to_string())).unwrap();
        let wallet = db
            .create_wallet_for_user("user-1", "fuji", &StubDeriver)
            .unwrap();
        let cache = Arc::new(BalanceCache::new(16, std::time::Duration::from_secs(60)));
        let poster = Arc::new(LedgerPoster::new(db.clone(), cache));
        let reconciler = DepositReconciler::new(db.clone(), poster, &EngineConfig::default());
        (db, reconciler, wallet.address, dir)
    }

    fn event(hash: &str, to: &str, amount: u128, block: u64) -> TransferEvent {
        TransferEvent {
            tx_hash: hash.to_string(),
            from: "0xexternal".to_string(),
            to: to.to_string(),
            amount,
            currency: "AVAX".to_string(),
            block_number: block,
        }
    }

    #[tokio::test]
    async fn confirmed_deposit_credits_owner_exactly_once() {
        let (db, reconciler, deposit_addr, _dir) = setup();
        let rpc = MockRpc::new(12);
        *rpc.head.lock().unwrap() = 120;
        rpc.receipts.lock().unwrap().insert(
            "0xd1".to_string(),
            TxConfirmation {
                block_number: 100,
                confirmations: 21,
                success: true,
            },
        );

        let fact = event("0xd1", &deposit_addr, 50, 100);
        reconciler
            .record_candidate(&fact, "fuji", TxDirection::Inbound)
            .unwrap();
        // Scanner re-reads the same range after a crash.
        let outcome = reconciler
            .record_candidate(&fact, "fuji", TxDirection::Inbound)
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Duplicate);

        let posted = reconciler.confirm_pending(&rpc, 120).await.unwrap();
        assert_eq!(posted, 1);
        assert_eq!(db.get_user_balance("user-1", "fuji").unwrap(), 50);

        // Second pass finds nothing pending to post.
        let posted = reconciler.confirm_pending(&rpc, 130).await.unwrap();
        assert_eq!(posted, 0);
        assert_eq!(db.get_user_balance("user-1", "fuji").unwrap(), 50);

        let ledgers = db.list_ledgers_for_reference("0xd1").unwrap();
        assert_eq!(ledgers.len(), 1);
    }

    #[tokio::test]
    async fn shallow_deposit_stays_pending() {
        let (db, reconciler, deposit_addr, _dir) = setup();
        let rpc = MockRpc::new(12);
        *rpc.head.lock().unwrap() = 104;
        rpc.receipts.lock().unwrap().insert(
            "0xd2".to_string(),
            TxConfirmation {
                block_number: 100,
                confirmations: 5,
                success: true,
            },
        );

        reconciler
            .record_candidate(&event("0xd2", &deposit_addr, 50, 100), "fuji", TxDirection::Inbound)
            .unwrap();

        let posted = reconciler.confirm_pending(&rpc, 104).await.unwrap();
        assert_eq!(posted, 0);
        assert_eq!(db.get_user_balance("user-1", "fuji").unwrap(), 0);
        assert_eq!(
            db.get_chain_tx("0xd2").unwrap().unwrap().status,
            ChainTxStatus::Pending
        );
    }

    #[tokio::test]
    async fn vanished_deep_tx_is_requeued_for_redetection() {
        let (db, reconciler, deposit_addr, _dir) = setup();
        let rpc = MockRpc::new(12);
        *rpc.head.lock().unwrap() = 150;
        // No receipt for 0xd3: its block was superseded.

        reconciler
            .record_candidate(&event("0xd3", &deposit_addr, 50, 100), "fuji", TxDirection::Inbound)
            .unwrap();

        reconciler.confirm_pending(&rpc, 150).await.unwrap();
        assert_eq!(
            db.get_chain_tx("0xd3").unwrap().unwrap().status,
            ChainTxStatus::Failed
        );

        // Re-detection at the new block revives it.
        let outcome = reconciler
            .record_candidate(&event("0xd3", &deposit_addr, 50, 140), "fuji", TxDirection::Inbound)
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Revived);
        assert_eq!(
            db.get_chain_tx("0xd3").unwrap().unwrap().status,
            ChainTxStatus::Pending
        );
    }

    #[tokio::test]
    async fn inbound_to_unknown_address_posts_nothing() {
        let (db, reconciler, _addr, _dir) = setup();
        let rpc = MockRpc::new(12);
        *rpc.head.lock().unwrap() = 200;
        rpc.receipts.lock().unwrap().insert(
            "0xd4".to_string(),
            TxConfirmation {
                block_number: 100,
                confirmations: 101,
                success: true,
            },
        );

        reconciler
            .record_candidate(
                &event("0xd4", "0xsomebody-else", 50, 100),
                "fuji",
                TxDirection::Inbound,
            )
            .unwrap();

        let posted = reconciler.confirm_pending(&rpc, 200).await.unwrap();
        assert_eq!(posted, 0);
        assert_eq!(db.ledger_count().unwrap(), 0);
    }
}
