// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Observed chain transactions, keyed by on-chain hash.
//!
//! `tx_hash` is the primary key, so an on-chain event is recorded at most
//! once no matter how many times the scanner re-reads its block range.

use redb::{ReadableDatabase, ReadableTable};

use super::db::{key2, prefix_end, LedgerDb, StoreError, StoreResult, CHAIN_TXS, CHAIN_TX_BY_CHAIN};
use crate::models::{ChainTransaction, ChainTxStatus};

/// Outcome of recording a scanner candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First sighting; row created.
    Inserted,
    /// Hash already recorded; nothing changed.
    Duplicate,
    /// Previously reorged-out row revived at a new block.
    Revived,
}

impl LedgerDb {
    /// Record a candidate transfer, idempotent by `tx_hash`.
    ///
    /// A row that was marked Failed by reorg handling and never posted is
    /// revived with the new block number; anything else already present is
    /// left untouched.
    pub fn upsert_chain_tx(&self, candidate: &ChainTransaction) -> StoreResult<UpsertOutcome> {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut txs = write_txn.open_table(CHAIN_TXS)?;
            let mut by_chain = write_txn.open_table(CHAIN_TX_BY_CHAIN)?;

            let existing = txs
                .get(candidate.tx_hash.as_str())?
                .map(|v| v.value().to_vec());

            match existing {
                None => {
                    let json = serde_json::to_vec(candidate)?;
                    txs.insert(candidate.tx_hash.as_str(), json.as_slice())?;
                    let index_key = key2(&candidate.chain, &candidate.tx_hash);
                    by_chain.insert(index_key.as_str(), ())?;
                    UpsertOutcome::Inserted
                }
                Some(bytes) => {
                    let mut current: ChainTransaction = serde_json::from_slice(&bytes)?;
                    if current.status == ChainTxStatus::Failed && !current.posted {
                        current.status = ChainTxStatus::Pending;
                        current.block_number = candidate.block_number;
                        current.confirmations = 0;
                        current.updated_at = chrono::Utc::now();
                        let json = serde_json::to_vec(&current)?;
                        txs.insert(candidate.tx_hash.as_str(), json.as_slice())?;
                        UpsertOutcome::Revived
                    } else {
                        UpsertOutcome::Duplicate
                    }
                }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    pub fn get_chain_tx(&self, tx_hash: &str) -> StoreResult<Option<ChainTransaction>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CHAIN_TXS)?;
        match table.get(tx_hash)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// All transactions on a chain with the given status.
    pub fn list_chain_txs_by_status(
        &self,
        chain: &str,
        status: ChainTxStatus,
    ) -> StoreResult<Vec<ChainTransaction>> {
        let read_txn = self.db.begin_read()?;
        let by_chain = read_txn.open_table(CHAIN_TX_BY_CHAIN)?;
        let txs = read_txn.open_table(CHAIN_TXS)?;

        let start = format!("{chain}|");
        let end = prefix_end(chain);
        let mut result = Vec::new();

        for entry in by_chain.range(start.as_str()..end.as_str())? {
            let entry = entry?;
            let key = entry.0.value().to_string();
            let Some(tx_hash) = key.split('|').nth(1) else {
                continue;
            };
            if let Some(value) = txs.get(tx_hash)? {
                let tx: ChainTransaction = serde_json::from_slice(value.value())?;
                if tx.status == status {
                    result.push(tx);
                }
            }
        }
        Ok(result)
    }

    /// Advance a transaction's confirmation count, flipping it to Confirmed
    /// at the chain's threshold.
    pub fn record_chain_tx_confirmations(
        &self,
        tx_hash: &str,
        confirmations: u64,
        threshold: u64,
    ) -> StoreResult<ChainTransaction> {
        self.mutate_chain_tx(tx_hash, |tx| {
            tx.confirmations = confirmations;
            if confirmations >= threshold
                && matches!(tx.status, ChainTxStatus::Pending | ChainTxStatus::Broadcasted)
            {
                tx.status = ChainTxStatus::Confirmed;
            }
            tx.updated_at = chrono::Utc::now();
        })
    }

    /// Mark a transaction failed (reorged out or reverted on-chain).
    pub fn fail_chain_tx(&self, tx_hash: &str) -> StoreResult<ChainTransaction> {
        self.mutate_chain_tx(tx_hash, |tx| tx.mark_failed())
    }

    fn mutate_chain_tx(
        &self,
        tx_hash: &str,
        mutate: impl FnOnce(&mut ChainTransaction),
    ) -> StoreResult<ChainTransaction> {
        let write_txn = self.db.begin_write()?;
        let tx = {
            let mut table = write_txn.open_table(CHAIN_TXS)?;
            let existing = {
                let value = table
                    .get(tx_hash)?
                    .ok_or_else(|| StoreError::NotFound(format!("transaction {tx_hash}")))?;
                value.value().to_vec()
            };
            let mut tx: ChainTransaction = serde_json::from_slice(&existing)?;
            mutate(&mut tx);
            let json = serde_json::to_vec(&tx)?;
            table.insert(tx_hash, json.as_slice())?;
            tx
        };
        write_txn.commit()?;
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::super::db::test_util::temp_db;
    use super::*;
    use crate::models::TxDirection;

    fn candidate(hash: &str, block: u64) -> ChainTransaction {
        ChainTransaction::new_observed(
            hash.to_string(),
            "fuji".to_string(),
            TxDirection::Inbound,
            "0xsender".to_string(),
            "0xdeposit".to_string(),
            50,
            "AVAX".to_string(),
            block,
        )
    }

    #[test]
    fn same_hash_recorded_once() {
        let (db, _dir) = temp_db();
        assert_eq!(
            db.upsert_chain_tx(&candidate("0xaaa", 100)).unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            db.upsert_chain_tx(&candidate("0xaaa", 100)).unwrap(),
            UpsertOutcome::Duplicate
        );

        let pending = db
            .list_chain_txs_by_status("fuji", ChainTxStatus::Pending)
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn reorged_row_is_revived_at_new_block() {
        let (db, _dir) = temp_db();
        db.upsert_chain_tx(&candidate("0xbbb", 100)).unwrap();
        db.fail_chain_tx("0xbbb").unwrap();

        let outcome = db.upsert_chain_tx(&candidate("0xbbb", 105)).unwrap();
        assert_eq!(outcome, UpsertOutcome::Revived);

        let tx = db.get_chain_tx("0xbbb").unwrap().unwrap();
        assert_eq!(tx.status, ChainTxStatus::Pending);
        assert_eq!(tx.block_number, Some(105));
        assert_eq!(tx.confirmations, 0);
    }

    #[test]
    fn confirmations_flip_status_at_threshold() {
        let (db, _dir) = temp_db();
        db.upsert_chain_tx(&candidate("0xccc", 100)).unwrap();

        let tx = db.record_chain_tx_confirmations("0xccc", 5, 12).unwrap();
        assert_eq!(tx.status, ChainTxStatus::Pending);

        let tx = db.record_chain_tx_confirmations("0xccc", 12, 12).unwrap();
        assert_eq!(tx.status, ChainTxStatus::Confirmed);

        let confirmed = db
            .list_chain_txs_by_status("fuji", ChainTxStatus::Confirmed)
            .unwrap();
        assert_eq!(confirmed.len(), 1);
    }
}
