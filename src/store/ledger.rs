// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! The double-entry posting path and its projections.
//!
//! `commit_posting` is the only code that writes TreasuryLedger or
//! TreasuryEntry rows. Everything it touches — the balanced entries, the
//! per-account running balances, the per-user balance projection, the legacy
//! ledger lines, the posted flag on a settled chain transaction — is written
//! in one redb transaction. A failed validation aborts the transaction with
//! nothing partial on disk.

use std::collections::HashMap;

use redb::{ReadableDatabase, ReadableTable};

use super::db::{
    key2, prefix_end, seq_key, LedgerDb, StoreError, StoreResult, ACCOUNTS, ACCOUNT_BALANCES,
    CHAIN_TXS, ENTRIES_BY_ACCOUNT, LEDGERS, LEDGER_BY_REFERENCE, LEDGER_ENTRIES, LEGACY_ENTRIES,
    META, USERS, USER_BALANCES,
};
use super::accounts::user_liability_code;
use crate::models::{
    Amount, ChainTransaction, LedgerEntry, LedgerReferenceType, LedgerType, SignedAmount,
    TreasuryAccount, TreasuryEntry, TreasuryLedger, User, UserBalance,
};

/// Spendable-balance guard evaluated inside the posting transaction.
#[derive(Debug, Clone)]
pub struct BalanceGuard {
    pub user_id: String,
    pub chain: String,
    /// The posting fails unless the user's current balance covers this.
    pub required: Amount,
}

/// Everything one economic event posts, atomically.
#[derive(Debug, Clone)]
pub struct PostingDraft {
    pub reference_type: LedgerReferenceType,
    pub reference_id: String,
    pub description: String,
    pub entries: Vec<TreasuryEntry>,
    /// Category stamped on the legacy per-user lines this posting produces.
    pub legacy_type: LedgerType,
    pub guard: Option<BalanceGuard>,
    /// Chain transaction this posting settles; its posted flag is checked
    /// and set here so a hash settles at most once.
    pub settle_tx_hash: Option<String>,
}

/// `meta` key for the posting sequence counter.
const POSTING_SEQ: &str = "posting_seq";

impl LedgerDb {
    /// Post one balanced ledger. See module docs.
    pub fn commit_posting(&self, draft: &PostingDraft) -> StoreResult<TreasuryLedger> {
        if draft.entries.is_empty() {
            return Err(StoreError::NotFound("posting has no entries".to_string()));
        }

        // Balance check per (currency, chain) group, before touching the db.
        let mut groups: HashMap<(String, String), (Amount, Amount)> = HashMap::new();
        for entry in &draft.entries {
            let group = groups
                .entry((entry.currency.clone(), entry.chain.clone()))
                .or_insert((0, 0));
            group.0 += entry.debit_amount;
            group.1 += entry.credit_amount;
        }
        for ((currency, chain), (debits, credits)) in &groups {
            if debits != credits {
                return Err(StoreError::Unbalanced {
                    currency: currency.clone(),
                    chain: chain.clone(),
                    debits: *debits,
                    credits: *credits,
                });
            }
        }

        let ledger = TreasuryLedger {
            ledger_id: uuid::Uuid::new_v4().to_string(),
            reference_type: draft.reference_type,
            reference_id: draft.reference_id.clone(),
            description: draft.description.clone(),
            locked: true,
            created_at: chrono::Utc::now(),
        };

        let write_txn = self.db.begin_write()?;
        {
            let accounts_table = write_txn.open_table(ACCOUNTS)?;

            // Resolve and vet every referenced account.
            let mut accounts: HashMap<String, TreasuryAccount> = HashMap::new();
            for entry in &draft.entries {
                if accounts.contains_key(&entry.account_id) {
                    continue;
                }
                let account: TreasuryAccount = {
                    let value = accounts_table.get(entry.account_id.as_str())?.ok_or_else(
                        || StoreError::NotFound(format!("account {}", entry.account_id)),
                    )?;
                    serde_json::from_slice(value.value())?
                };
                if !account.active {
                    return Err(StoreError::InactiveAccount(account.code));
                }
                accounts.insert(entry.account_id.clone(), account);
            }
            drop(accounts_table);

            // Per-user projection deltas from user-linked accounts.
            let mut user_deltas: HashMap<(String, String), SignedAmount> = HashMap::new();
            for entry in &draft.entries {
                let account = &accounts[&entry.account_id];
                if let Some(owner) = &account.owner_user_id {
                    *user_deltas
                        .entry((owner.clone(), account.chain.clone()))
                        .or_insert(0) += entry.signed_effect(account.account_type);
                }
            }

            let mut balances = write_txn.open_table(USER_BALANCES)?;

            // Spendable-balance guard, under the same transaction that debits.
            if let Some(guard) = &draft.guard {
                let key = key2(&guard.user_id, &guard.chain);
                let available: SignedAmount = match balances.get(key.as_str())? {
                    Some(value) => {
                        let row: UserBalance = serde_json::from_slice(value.value())?;
                        row.balance
                    }
                    None => 0,
                };
                if available < guard.required as SignedAmount {
                    return Err(StoreError::InsufficientBalance {
                        user_id: guard.user_id.clone(),
                        chain: guard.chain.clone(),
                        available,
                        required: guard.required,
                    });
                }
            }

            // Settle the originating chain transaction at most once.
            if let Some(tx_hash) = &draft.settle_tx_hash {
                let mut txs = write_txn.open_table(CHAIN_TXS)?;
                let existing = {
                    let value = txs
                        .get(tx_hash.as_str())?
                        .ok_or_else(|| StoreError::NotFound(format!("transaction {tx_hash}")))?;
                    value.value().to_vec()
                };
                let mut tx: ChainTransaction = serde_json::from_slice(&existing)?;
                if tx.posted {
                    return Err(StoreError::AlreadyPosted(tx_hash.clone()));
                }
                tx.posted = true;
                tx.updated_at = chrono::Utc::now();
                let json = serde_json::to_vec(&tx)?;
                txs.insert(tx_hash.as_str(), json.as_slice())?;
            }

            // Sequence numbers for ordered entry history.
            let mut meta = write_txn.open_table(META)?;
            let mut seq = match meta.get(POSTING_SEQ)? {
                Some(v) => {
                    let bytes = v.value();
                    if bytes.len() >= 8 {
                        u64::from_be_bytes(bytes[..8].try_into().unwrap())
                    } else {
                        0
                    }
                }
                None => 0,
            };

            // Ledger row, entry rows, per-account history and balances.
            let mut ledgers = write_txn.open_table(LEDGERS)?;
            let ledger_json = serde_json::to_vec(&ledger)?;
            ledgers.insert(ledger.ledger_id.as_str(), ledger_json.as_slice())?;

            let mut by_reference = write_txn.open_table(LEDGER_BY_REFERENCE)?;
            by_reference.insert(
                key2(&draft.reference_id, &ledger.ledger_id).as_str(),
                (),
            )?;

            let mut entries_table = write_txn.open_table(LEDGER_ENTRIES)?;
            let mut by_account = write_txn.open_table(ENTRIES_BY_ACCOUNT)?;
            let mut account_balances = write_txn.open_table(ACCOUNT_BALANCES)?;

            for entry in &draft.entries {
                let mut row = entry.clone();
                row.ledger_id = ledger.ledger_id.clone();

                let json = serde_json::to_vec(&row)?;
                entries_table.insert(
                    key2(&ledger.ledger_id, &row.entry_id).as_str(),
                    json.as_slice(),
                )?;
                by_account.insert(
                    seq_key(&key2(&row.account_id, &row.currency), seq).as_str(),
                    json.as_slice(),
                )?;
                seq += 1;

                let account = &accounts[&row.account_id];
                let balance_key = key2(&row.account_id, &row.currency);
                let current: SignedAmount = match account_balances.get(balance_key.as_str())? {
                    Some(value) => serde_json::from_slice(value.value())?,
                    None => 0,
                };
                let updated = current + row.signed_effect(account.account_type);
                let json = serde_json::to_vec(&updated)?;
                account_balances.insert(balance_key.as_str(), json.as_slice())?;
            }

            // Per-user projection + legacy lines + cached aggregate.
            let mut legacy = write_txn.open_table(LEGACY_ENTRIES)?;
            let mut users = write_txn.open_table(USERS)?;
            for ((user_id, chain), delta) in &user_deltas {
                let key = key2(user_id, chain);
                let current: SignedAmount = match balances.get(key.as_str())? {
                    Some(value) => {
                        let row: UserBalance = serde_json::from_slice(value.value())?;
                        row.balance
                    }
                    None => 0,
                };
                let updated = UserBalance {
                    user_id: user_id.clone(),
                    chain: chain.clone(),
                    balance: current + delta,
                    updated_at: chrono::Utc::now(),
                };
                let json = serde_json::to_vec(&updated)?;
                balances.insert(key.as_str(), json.as_slice())?;

                let line = LedgerEntry {
                    entry_id: uuid::Uuid::new_v4().to_string(),
                    user_id: user_id.clone(),
                    chain: chain.clone(),
                    ledger_type: draft.legacy_type,
                    delta: *delta,
                    balance_after: updated.balance,
                    treasury_ledger_id: ledger.ledger_id.clone(),
                    created_at: chrono::Utc::now(),
                };
                let json = serde_json::to_vec(&line)?;
                legacy.insert(seq_key(&key, seq).as_str(), json.as_slice())?;
                seq += 1;

                // Legacy aggregate on the user row, if the user exists.
                let existing = users.get(user_id.as_str())?.map(|v| v.value().to_vec());
                if let Some(bytes) = existing {
                    let mut user: User = serde_json::from_slice(&bytes)?;
                    user.cached_balance += delta;
                    user.updated_at = chrono::Utc::now();
                    let json = serde_json::to_vec(&user)?;
                    users.insert(user_id.as_str(), json.as_slice())?;
                }
            }

            meta.insert(POSTING_SEQ, seq.to_be_bytes().as_slice())?;
        }
        write_txn.commit()?;
        Ok(ledger)
    }

    pub fn get_treasury_ledger(&self, ledger_id: &str) -> StoreResult<Option<TreasuryLedger>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LEDGERS)?;
        match table.get(ledger_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Entries of one ledger.
    pub fn list_ledger_entries(&self, ledger_id: &str) -> StoreResult<Vec<TreasuryEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LEDGER_ENTRIES)?;
        let start = format!("{ledger_id}|");
        let end = prefix_end(ledger_id);
        let mut entries = Vec::new();
        for entry in table.range(start.as_str()..end.as_str())? {
            let entry = entry?;
            entries.push(serde_json::from_slice(entry.1.value())?);
        }
        Ok(entries)
    }

    /// Ledgers posted for one domain reference (tx hash, withdrawal id, ...).
    pub fn list_ledgers_for_reference(
        &self,
        reference_id: &str,
    ) -> StoreResult<Vec<TreasuryLedger>> {
        let read_txn = self.db.begin_read()?;
        let by_reference = read_txn.open_table(LEDGER_BY_REFERENCE)?;
        let ledgers = read_txn.open_table(LEDGERS)?;

        let start = format!("{reference_id}|");
        let end = prefix_end(reference_id);
        let mut result = Vec::new();
        for entry in by_reference.range(start.as_str()..end.as_str())? {
            let entry = entry?;
            let key = entry.0.value().to_string();
            let Some(ledger_id) = key.rsplit('|').next() else {
                continue;
            };
            if let Some(value) = ledgers.get(ledger_id)? {
                result.push(serde_json::from_slice(value.value())?);
            }
        }
        Ok(result)
    }

    /// Cached balance projection for (user, chain).
    pub fn get_user_balance(&self, user_id: &str, chain: &str) -> StoreResult<SignedAmount> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USER_BALANCES)?;
        let key = key2(user_id, chain);
        match table.get(key.as_str())? {
            Some(value) => {
                let row: UserBalance = serde_json::from_slice(value.value())?;
                Ok(row.balance)
            }
            None => Ok(0),
        }
    }

    /// Overwrite the cached projection row. Only the projector's self-heal
    /// path may call this.
    pub(crate) fn put_user_balance(&self, row: &UserBalance) -> StoreResult<()> {
        let json = serde_json::to_vec(row)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(USER_BALANCES)?;
            table.insert(key2(&row.user_id, &row.chain).as_str(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Replay the user's authoritative entry history for one chain from
    /// genesis. Ground truth for the cached projection.
    pub fn replay_user_balance(
        &self,
        user_id: &str,
        chain: &str,
    ) -> StoreResult<SignedAmount> {
        let Some(account) = self.get_account_by_code(&user_liability_code(user_id, chain))? else {
            return Ok(0);
        };

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTRIES_BY_ACCOUNT)?;
        let start = format!("{}|", account.account_id);
        let end = prefix_end(&account.account_id);

        let mut balance: SignedAmount = 0;
        for entry in table.range(start.as_str()..end.as_str())? {
            let entry = entry?;
            let row: TreasuryEntry = serde_json::from_slice(entry.1.value())?;
            balance += row.signed_effect(account.account_type);
        }
        Ok(balance)
    }

    /// Legacy ledger lines for (user, chain), oldest first.
    pub fn list_legacy_entries(
        &self,
        user_id: &str,
        chain: &str,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LEGACY_ENTRIES)?;
        let prefix = key2(user_id, chain);
        let start = format!("{prefix}|");
        let end = prefix_end(&prefix);
        let mut lines = Vec::new();
        for entry in table.range(start.as_str()..end.as_str())? {
            let entry = entry?;
            lines.push(serde_json::from_slice(entry.1.value())?);
        }
        Ok(lines)
    }
}
