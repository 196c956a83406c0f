// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Chart of accounts.
//!
//! Accounts form an arena: hierarchy is parent ids, traversal is repeated
//! lookup. Each chain gets a standard chart at bootstrap; per-user liability
//! accounts are created lazily under the chain's users parent.

use redb::{ReadableDatabase, ReadableTable};

use super::db::{
    key2, seq_key, LedgerDb, StoreError, StoreResult, ACCOUNTS, ACCOUNT_BALANCES, ACCOUNT_BY_CODE,
    SNAPSHOTS,
};
use crate::models::{
    BalanceSnapshot, SignedAmount, TreasuryAccount, TreasuryAccountType,
};

// Standard chart codes, one set per chain.

/// Funds sitting on user deposit addresses.
pub fn deposits_code(chain: &str) -> String {
    format!("asset:deposits:{chain}")
}

/// Funds on the custody wallet.
pub fn custody_code(chain: &str) -> String {
    format!("asset:custody:{chain}")
}

/// Parent of all per-user liability accounts.
pub fn users_parent_code(chain: &str) -> String {
    format!("liability:users:{chain}")
}

/// What the platform owes one user on one chain.
pub fn user_liability_code(user_id: &str, chain: &str) -> String {
    format!("liability:user:{user_id}:{chain}")
}

/// Approved-but-unsettled withdrawal reservations.
pub fn payouts_code(chain: &str) -> String {
    format!("liability:payouts:{chain}")
}

/// Treasury equity (adjustments, earnings).
pub fn equity_code(chain: &str) -> String {
    format!("equity:treasury:{chain}")
}

impl LedgerDb {
    /// Create an account. Fails if the code is taken or the parent is missing.
    pub fn create_treasury_account(&self, account: &TreasuryAccount) -> StoreResult<()> {
        let json = serde_json::to_vec(account)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut accounts = write_txn.open_table(ACCOUNTS)?;
            let mut by_code = write_txn.open_table(ACCOUNT_BY_CODE)?;

            if by_code.get(account.code.as_str())?.is_some() {
                return Err(StoreError::AlreadyExists(format!(
                    "account code {}",
                    account.code
                )));
            }
            if let Some(parent_id) = &account.parent_id {
                if accounts.get(parent_id.as_str())?.is_none() {
                    return Err(StoreError::NotFound(format!("parent account {parent_id}")));
                }
            }

            accounts.insert(account.account_id.as_str(), json.as_slice())?;
            by_code.insert(account.code.as_str(), account.account_id.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_treasury_account(&self, account_id: &str) -> StoreResult<Option<TreasuryAccount>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ACCOUNTS)?;
        match table.get(account_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn get_account_by_code(&self, code: &str) -> StoreResult<Option<TreasuryAccount>> {
        let read_txn = self.db.begin_read()?;
        let by_code = read_txn.open_table(ACCOUNT_BY_CODE)?;
        let Some(id) = by_code.get(code)?.map(|v| v.value().to_string()) else {
            return Ok(None);
        };
        let accounts = read_txn.open_table(ACCOUNTS)?;
        match accounts.get(id.as_str())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Direct children of an account. Traversal by repeated lookup.
    pub fn list_child_accounts(&self, parent_id: &str) -> StoreResult<Vec<TreasuryAccount>> {
        let read_txn = self.db.begin_read()?;
        let accounts = read_txn.open_table(ACCOUNTS)?;
        let mut children = Vec::new();
        for entry in accounts.iter()? {
            let entry = entry?;
            let account: TreasuryAccount = serde_json::from_slice(entry.1.value())?;
            if account.parent_id.as_deref() == Some(parent_id) {
                children.push(account);
            }
        }
        Ok(children)
    }

    pub fn set_account_active(&self, account_id: &str, active: bool) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ACCOUNTS)?;
            let existing = {
                let value = table
                    .get(account_id)?
                    .ok_or_else(|| StoreError::NotFound(format!("account {account_id}")))?;
                value.value().to_vec()
            };
            let mut account: TreasuryAccount = serde_json::from_slice(&existing)?;
            account.active = active;
            let json = serde_json::to_vec(&account)?;
            table.insert(account_id, json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Running balance of an account in one currency, oriented by the
    /// account's normal side.
    pub fn account_balance(&self, account_id: &str, currency: &str) -> StoreResult<SignedAmount> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ACCOUNT_BALANCES)?;
        let key = key2(account_id, currency);
        match table.get(key.as_str())? {
            Some(value) => Ok(serde_json::from_slice(value.value())?),
            None => Ok(0),
        }
    }

    /// Create the standard chart for a chain. Idempotent.
    pub fn bootstrap_chain_accounts(
        &self,
        chain: &str,
        custody_address: &str,
    ) -> StoreResult<()> {
        if self.get_account_by_code(&deposits_code(chain))?.is_some() {
            return Ok(());
        }

        let mk = |code: String,
                  name: &str,
                  account_type: TreasuryAccountType,
                  parent_id: Option<String>,
                  wallet_address: Option<String>| TreasuryAccount {
            account_id: uuid::Uuid::new_v4().to_string(),
            code,
            name: name.to_string(),
            account_type,
            parent_id,
            wallet_address,
            owner_user_id: None,
            chain: chain.to_string(),
            active: true,
            created_at: chrono::Utc::now(),
        };

        let deposits = mk(
            deposits_code(chain),
            "User deposit addresses",
            TreasuryAccountType::Asset,
            None,
            None,
        );
        let custody = mk(
            custody_code(chain),
            "Custody wallet",
            TreasuryAccountType::Asset,
            None,
            Some(custody_address.to_lowercase()),
        );
        let users_parent = mk(
            users_parent_code(chain),
            "User liabilities",
            TreasuryAccountType::Liability,
            None,
            None,
        );
        let payouts = mk(
            payouts_code(chain),
            "Pending payouts",
            TreasuryAccountType::Liability,
            None,
            None,
        );
        let equity = mk(
            equity_code(chain),
            "Treasury equity",
            TreasuryAccountType::Equity,
            None,
            None,
        );

        for account in [&deposits, &custody, &users_parent, &payouts, &equity] {
            self.create_treasury_account(account)?;
        }
        Ok(())
    }

    /// The user's liability account on a chain, created under the chain's
    /// users parent on first use.
    pub fn ensure_user_liability_account(
        &self,
        user_id: &str,
        chain: &str,
    ) -> StoreResult<TreasuryAccount> {
        let code = user_liability_code(user_id, chain);
        if let Some(existing) = self.get_account_by_code(&code)? {
            return Ok(existing);
        }

        let parent = self
            .get_account_by_code(&users_parent_code(chain))?
            .ok_or_else(|| StoreError::NotFound(format!("chart for chain {chain}")))?;

        let account = TreasuryAccount {
            account_id: uuid::Uuid::new_v4().to_string(),
            code,
            name: format!("User {user_id} liability"),
            account_type: TreasuryAccountType::Liability,
            parent_id: Some(parent.account_id),
            wallet_address: None,
            owner_user_id: Some(user_id.to_string()),
            chain: chain.to_string(),
            active: true,
            created_at: chrono::Utc::now(),
        };
        self.create_treasury_account(&account)?;
        Ok(account)
    }

    /// Materialize a trial balance for (currency, chain) and append it to the
    /// snapshots table.
    pub fn take_balance_snapshot(
        &self,
        currency: &str,
        chain: &str,
    ) -> StoreResult<BalanceSnapshot> {
        let read_txn = self.db.begin_read()?;
        let balances = read_txn.open_table(ACCOUNT_BALANCES)?;
        let accounts = read_txn.open_table(ACCOUNTS)?;

        let mut assets: SignedAmount = 0;
        let mut liabilities: SignedAmount = 0;
        let mut equity: SignedAmount = 0;

        for entry in balances.iter()? {
            let entry = entry?;
            let key = entry.0.value().to_string();
            let Some((account_id, key_currency)) = key.split_once('|') else {
                continue;
            };
            if key_currency != currency {
                continue;
            }
            let Some(value) = accounts.get(account_id)? else {
                continue;
            };
            let account: TreasuryAccount = serde_json::from_slice(value.value())?;
            if account.chain != chain {
                continue;
            }
            let balance: SignedAmount = serde_json::from_slice(entry.1.value())?;
            match account.account_type {
                TreasuryAccountType::Asset => assets += balance,
                TreasuryAccountType::Liability => liabilities += balance,
                TreasuryAccountType::Equity => equity += balance,
            }
        }
        drop(read_txn);

        let now = chrono::Utc::now();
        let snapshot = BalanceSnapshot {
            snapshot_id: uuid::Uuid::new_v4().to_string(),
            currency: currency.to_string(),
            chain: chain.to_string(),
            assets_total: assets,
            liabilities_total: liabilities,
            equity_total: equity,
            drift: assets != liabilities + equity,
            created_at: now,
        };

        let json = serde_json::to_vec(&snapshot)?;
        let key = seq_key(
            &key2(chain, currency),
            now.timestamp_millis().max(0) as u64,
        );
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SNAPSHOTS)?;
            table.insert(format!("{key}|{}", snapshot.snapshot_id).as_str(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(snapshot)
    }

    /// Snapshots for (currency, chain), oldest first.
    pub fn list_balance_snapshots(
        &self,
        currency: &str,
        chain: &str,
    ) -> StoreResult<Vec<BalanceSnapshot>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SNAPSHOTS)?;
        let prefix = format!("{}|", key2(chain, currency));
        let end = super::db::prefix_end(&key2(chain, currency));
        let mut snapshots = Vec::new();
        for entry in table.range(prefix.as_str()..end.as_str())? {
            let entry = entry?;
            snapshots.push(serde_json::from_slice(entry.1.value())?);
        }
        Ok(snapshots)
    }
}
