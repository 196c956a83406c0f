// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded ledger database backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `users`: user_id → User
//! - `user_wallets`: address → UserWallet
//! - `wallet_by_user`: user_id|chain → address
//! - `wallet_by_index`: chain|index → address
//! - `chain_txs`: tx_hash → ChainTransaction
//! - `chain_tx_by_chain`: chain|tx_hash → ()
//! - `accounts`: account_id → TreasuryAccount
//! - `account_by_code`: code → account_id
//! - `account_balances`: account_id|currency → SignedAmount
//! - `ledgers`: ledger_id → TreasuryLedger
//! - `ledger_entries`: ledger_id|entry_id → TreasuryEntry
//! - `entries_by_account`: account_id|seq → TreasuryEntry
//! - `ledger_by_reference`: reference_id|ledger_id → ()
//! - `legacy_entries`: user_id|chain|seq → LedgerEntry
//! - `user_balances`: user_id|chain → UserBalance
//! - `snapshots`: created|snapshot_id → BalanceSnapshot
//! - `treasury_state`: chain → TreasuryState
//! - `scan_state`: chain → ChainScanState
//! - `withdrawals`: withdrawal_id → Withdrawal
//! - `withdrawal_by_user`: user_id|withdrawal_id → ()
//! - `sweeps`: sweep_id → Sweep
//! - `sweep_by_hash`: tx_hash → sweep_id
//! - `meta`: key → value bytes (sequence counters, derivation cursors)
//!
//! Values are JSON bytes; composite keys use `|` separators with
//! zero-padded numeric segments so lexicographic order matches numeric
//! order. All cross-entity invariants are enforced inside a single write
//! transaction; redb's single-writer model serializes them.

use std::path::Path;

use redb::{Database, ReadableDatabase, ReadableTableMetadata, TableDefinition};

use crate::models::{Amount, SignedAmount};

// =============================================================================
// Table Definitions
// =============================================================================

pub(crate) const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");
pub(crate) const USER_WALLETS: TableDefinition<&str, &[u8]> = TableDefinition::new("user_wallets");
pub(crate) const WALLET_BY_USER: TableDefinition<&str, &str> =
    TableDefinition::new("wallet_by_user");
pub(crate) const WALLET_BY_INDEX: TableDefinition<&str, &str> =
    TableDefinition::new("wallet_by_index");
pub(crate) const CHAIN_TXS: TableDefinition<&str, &[u8]> = TableDefinition::new("chain_txs");
pub(crate) const CHAIN_TX_BY_CHAIN: TableDefinition<&str, ()> =
    TableDefinition::new("chain_tx_by_chain");
pub(crate) const ACCOUNTS: TableDefinition<&str, &[u8]> = TableDefinition::new("accounts");
pub(crate) const ACCOUNT_BY_CODE: TableDefinition<&str, &str> =
    TableDefinition::new("account_by_code");
pub(crate) const ACCOUNT_BALANCES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("account_balances");
pub(crate) const LEDGERS: TableDefinition<&str, &[u8]> = TableDefinition::new("ledgers");
pub(crate) const LEDGER_ENTRIES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("ledger_entries");
pub(crate) const ENTRIES_BY_ACCOUNT: TableDefinition<&str, &[u8]> =
    TableDefinition::new("entries_by_account");
pub(crate) const LEDGER_BY_REFERENCE: TableDefinition<&str, ()> =
    TableDefinition::new("ledger_by_reference");
pub(crate) const LEGACY_ENTRIES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("legacy_entries");
pub(crate) const USER_BALANCES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("user_balances");
pub(crate) const SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");
pub(crate) const TREASURY_STATE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("treasury_state");
pub(crate) const SCAN_STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("scan_state");
pub(crate) const WITHDRAWALS: TableDefinition<&str, &[u8]> = TableDefinition::new("withdrawals");
pub(crate) const WITHDRAWAL_BY_USER: TableDefinition<&str, ()> =
    TableDefinition::new("withdrawal_by_user");
pub(crate) const SWEEPS: TableDefinition<&str, &[u8]> = TableDefinition::new("sweeps");
pub(crate) const SWEEP_BY_HASH: TableDefinition<&str, &str> = TableDefinition::new("sweep_by_hash");
pub(crate) const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Posting lines do not balance for one (currency, chain) group.
    #[error("unbalanced posting for {currency}/{chain}: debits {debits} != credits {credits}")]
    Unbalanced {
        currency: String,
        chain: String,
        debits: Amount,
        credits: Amount,
    },

    #[error("account {0} is not active")]
    InactiveAccount(String),

    /// A balance guard failed inside the posting transaction.
    #[error("insufficient balance for user {user_id} on {chain}: have {available}, need {required}")]
    InsufficientBalance {
        user_id: String,
        chain: String,
        available: SignedAmount,
        required: Amount,
    },

    /// Chain transaction already settled by an earlier posting.
    #[error("transaction {0} already posted")]
    AlreadyPosted(String),

    #[error("ledger {0} is locked")]
    LedgerLocked(String),

    /// Attempt to move a scan cursor backwards.
    #[error("scan cursor for {chain} would regress: have {have}, got {got}")]
    CursorRegression { chain: String, have: u64, got: u64 },

    /// Advisory treasury lock is held and not stale.
    #[error("treasury lock for {chain} held by {holder}")]
    LockHeld { chain: String, holder: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// LedgerDb
// =============================================================================

/// Embedded ACID ledger database.
///
/// Entity accessors are implemented in sibling modules as additional
/// `impl LedgerDb` blocks; everything shares this handle and its tables.
pub struct LedgerDb {
    pub(crate) db: Database,
}

impl LedgerDb {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(USERS)?;
            let _ = write_txn.open_table(USER_WALLETS)?;
            let _ = write_txn.open_table(WALLET_BY_USER)?;
            let _ = write_txn.open_table(WALLET_BY_INDEX)?;
            let _ = write_txn.open_table(CHAIN_TXS)?;
            let _ = write_txn.open_table(CHAIN_TX_BY_CHAIN)?;
            let _ = write_txn.open_table(ACCOUNTS)?;
            let _ = write_txn.open_table(ACCOUNT_BY_CODE)?;
            let _ = write_txn.open_table(ACCOUNT_BALANCES)?;
            let _ = write_txn.open_table(LEDGERS)?;
            let _ = write_txn.open_table(LEDGER_ENTRIES)?;
            let _ = write_txn.open_table(ENTRIES_BY_ACCOUNT)?;
            let _ = write_txn.open_table(LEDGER_BY_REFERENCE)?;
            let _ = write_txn.open_table(LEGACY_ENTRIES)?;
            let _ = write_txn.open_table(USER_BALANCES)?;
            let _ = write_txn.open_table(SNAPSHOTS)?;
            let _ = write_txn.open_table(TREASURY_STATE)?;
            let _ = write_txn.open_table(SCAN_STATE)?;
            let _ = write_txn.open_table(WITHDRAWALS)?;
            let _ = write_txn.open_table(WITHDRAWAL_BY_USER)?;
            let _ = write_txn.open_table(SWEEPS)?;
            let _ = write_txn.open_table(SWEEP_BY_HASH)?;
            let _ = write_txn.open_table(META)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Number of rows in the ledgers table. Diagnostics only.
    pub fn ledger_count(&self) -> StoreResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LEDGERS)?;
        Ok(table.len()?)
    }
}

// =============================================================================
// Key helpers
// =============================================================================

/// Composite key from two segments.
pub(crate) fn key2(a: &str, b: &str) -> String {
    format!("{a}|{b}")
}

/// Composite key ending in a zero-padded sequence number so lexicographic
/// order matches numeric order.
pub(crate) fn seq_key(prefix: &str, seq: u64) -> String {
    format!("{prefix}|{seq:020}")
}

/// Upper bound for a `prefix|...` range scan.
pub(crate) fn prefix_end(prefix: &str) -> String {
    format!("{prefix}|\u{10FFFF}")
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    pub fn temp_db() -> (LedgerDb, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = LedgerDb::open(&dir.path().join("test.redb")).unwrap();
        (db, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_all_tables() {
        let (db, _dir) = test_util::temp_db();
        assert_eq!(db.ledger_count().unwrap(), 0);
    }

    #[test]
    fn seq_keys_sort_numerically() {
        let a = seq_key("acct", 9);
        let b = seq_key("acct", 10);
        let c = seq_key("acct", 100);
        assert!(a < b && b < c);
        assert!(c < prefix_end("acct"));
    }
}
