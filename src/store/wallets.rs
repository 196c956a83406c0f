// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Deposit wallet rows and derivation-index allocation.
//!
//! Both uniqueness constraints — one wallet per (user, chain) and one owner
//! per (chain, derivation_index) — are enforced inside the transaction that
//! inserts the wallet, against indexes maintained in the same transaction.
//! Derivation indexes come from a per-chain counter in `meta`, so an index
//! is never handed out twice even across crashes.

use redb::{ReadableDatabase, ReadableTable};

use super::db::{
    key2, prefix_end, LedgerDb, StoreError, StoreResult, META, USER_WALLETS, WALLET_BY_INDEX,
    WALLET_BY_USER,
};
use crate::chain::WalletDeriver;
use crate::models::{Amount, UserWallet};

/// `meta` key for a chain's next derivation index.
fn derivation_key(chain: &str) -> String {
    format!("derivation_index_{chain}")
}

impl LedgerDb {
    /// Create the deposit wallet for (user, chain), deriving its address at
    /// the next free derivation index.
    ///
    /// Returns the existing wallet unchanged if the user already has one on
    /// this chain.
    pub fn create_wallet_for_user(
        &self,
        user_id: &str,
        chain: &str,
        deriver: &dyn WalletDeriver,
    ) -> StoreResult<UserWallet> {
        let write_txn = self.db.begin_write()?;
        let wallet = {
            let mut by_user = write_txn.open_table(WALLET_BY_USER)?;
            let mut by_index = write_txn.open_table(WALLET_BY_INDEX)?;
            let mut wallets = write_txn.open_table(USER_WALLETS)?;
            let mut meta = write_txn.open_table(META)?;

            let user_key = key2(user_id, chain);
            if let Some(existing) = by_user.get(user_key.as_str())? {
                let address = existing.value().to_string();
                drop(existing);
                let value = wallets
                    .get(address.as_str())?
                    .ok_or_else(|| StoreError::NotFound(format!("wallet {address}")))?;
                return Ok(serde_json::from_slice(value.value())?);
            }

            // Allocate the next derivation index for this chain.
            let counter_key = derivation_key(chain);
            let next_index = match meta.get(counter_key.as_str())? {
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
            // Stored value is the index after this allocation.
            let bumped = (next_index + 1).to_be_bytes();
            meta.insert(counter_key.as_str(), bumped.as_slice())?;

            let address = deriver
                .derive_address(chain, next_index)
                .map_err(|e| StoreError::NotFound(format!("derivation failed: {e}")))?
                .to_lowercase();

            let index_key = key2(chain, &format!("{next_index:020}"));
            if by_index.get(index_key.as_str())?.is_some() {
                return Err(StoreError::AlreadyExists(format!(
                    "derivation index {next_index} on {chain}"
                )));
            }
            if wallets.get(address.as_str())?.is_some() {
                return Err(StoreError::AlreadyExists(format!("address {address}")));
            }

            let wallet = UserWallet {
                user_id: user_id.to_string(),
                chain: chain.to_string(),
                derivation_index: next_index,
                address: address.clone(),
                last_known_balance: 0,
                created_at: chrono::Utc::now(),
            };

            let json = serde_json::to_vec(&wallet)?;
            wallets.insert(address.as_str(), json.as_slice())?;
            by_user.insert(user_key.as_str(), address.as_str())?;
            by_index.insert(index_key.as_str(), address.as_str())?;
            wallet
        };
        write_txn.commit()?;
        Ok(wallet)
    }

    /// Look up a wallet by its on-chain address (lowercased).
    pub fn get_wallet_by_address(&self, address: &str) -> StoreResult<Option<UserWallet>> {
        let addr = address.to_lowercase();
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USER_WALLETS)?;
        match table.get(addr.as_str())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// The user's deposit wallet on a chain, if created.
    pub fn get_wallet_for_user(&self, user_id: &str, chain: &str) -> StoreResult<Option<UserWallet>> {
        let read_txn = self.db.begin_read()?;
        let by_user = read_txn.open_table(WALLET_BY_USER)?;
        let key = key2(user_id, chain);
        let Some(address) = by_user.get(key.as_str())?.map(|v| v.value().to_string()) else {
            return Ok(None);
        };
        let wallets = read_txn.open_table(USER_WALLETS)?;
        match wallets.get(address.as_str())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// All deposit addresses on a chain, lowercased. The scanner's watch set.
    pub fn list_wallet_addresses(&self, chain: &str) -> StoreResult<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let by_index = read_txn.open_table(WALLET_BY_INDEX)?;
        let start = format!("{chain}|");
        let end = prefix_end(chain);
        let mut addresses = Vec::new();
        for entry in by_index.range(start.as_str()..end.as_str())? {
            let entry = entry?;
            addresses.push(entry.1.value().to_string());
        }
        Ok(addresses)
    }

    /// Refresh the scanner-maintained balance cache for a wallet.
    pub fn set_wallet_last_known_balance(
        &self,
        address: &str,
        balance: Amount,
    ) -> StoreResult<()> {
        let addr = address.to_lowercase();
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(USER_WALLETS)?;
            let existing = {
                let value = table
                    .get(addr.as_str())?
                    .ok_or_else(|| StoreError::NotFound(format!("wallet {addr}")))?;
                value.value().to_vec()
            };
            let mut wallet: UserWallet = serde_json::from_slice(&existing)?;
            wallet.last_known_balance = balance;
            let json = serde_json::to_vec(&wallet)?;
            table.insert(addr.as_str(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
