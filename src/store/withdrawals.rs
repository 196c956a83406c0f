// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Withdrawal request rows. Transition legality lives in the processor;
//! this layer persists and lists.

use redb::{ReadableDatabase, ReadableTable};

use super::db::{key2, prefix_end, LedgerDb, StoreError, StoreResult, WITHDRAWALS, WITHDRAWAL_BY_USER};
use crate::models::Withdrawal;

impl LedgerDb {
    pub fn create_withdrawal(&self, withdrawal: &Withdrawal) -> StoreResult<()> {
        let json = serde_json::to_vec(withdrawal)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(WITHDRAWALS)?;
            if table.get(withdrawal.withdrawal_id.as_str())?.is_some() {
                return Err(StoreError::AlreadyExists(format!(
                    "withdrawal {}",
                    withdrawal.withdrawal_id
                )));
            }
            table.insert(withdrawal.withdrawal_id.as_str(), json.as_slice())?;

            let mut by_user = write_txn.open_table(WITHDRAWAL_BY_USER)?;
            by_user.insert(
                key2(&withdrawal.user_id, &withdrawal.withdrawal_id).as_str(),
                (),
            )?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_withdrawal(&self, withdrawal_id: &str) -> StoreResult<Option<Withdrawal>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(WITHDRAWALS)?;
        match table.get(withdrawal_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn update_withdrawal(&self, withdrawal: &Withdrawal) -> StoreResult<()> {
        let json = serde_json::to_vec(withdrawal)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(WITHDRAWALS)?;
            if table.get(withdrawal.withdrawal_id.as_str())?.is_none() {
                return Err(StoreError::NotFound(format!(
                    "withdrawal {}",
                    withdrawal.withdrawal_id
                )));
            }
            table.insert(withdrawal.withdrawal_id.as_str(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn list_withdrawals_by_user(&self, user_id: &str) -> StoreResult<Vec<Withdrawal>> {
        let read_txn = self.db.begin_read()?;
        let by_user = read_txn.open_table(WITHDRAWAL_BY_USER)?;
        let table = read_txn.open_table(WITHDRAWALS)?;

        let start = format!("{user_id}|");
        let end = prefix_end(user_id);
        let mut result = Vec::new();
        for entry in by_user.range(start.as_str()..end.as_str())? {
            let entry = entry?;
            let key = entry.0.value().to_string();
            let Some(withdrawal_id) = key.rsplit('|').next() else {
                continue;
            };
            if let Some(value) = table.get(withdrawal_id)? {
                result.push(serde_json::from_slice(value.value())?);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::super::db::test_util::temp_db;
    use crate::models::{TxStatus, Withdrawal};

    #[test]
    fn create_get_update_roundtrip() {
        let (db, _dir) = temp_db();
        let mut wd = Withdrawal::new_pending(
            "user-1".to_string(),
            "fuji".to_string(),
            "AVAX".to_string(),
            60,
            "0xdest".to_string(),
        );
        db.create_withdrawal(&wd).unwrap();

        wd.status = TxStatus::Approved;
        db.update_withdrawal(&wd).unwrap();

        let loaded = db.get_withdrawal(&wd.withdrawal_id).unwrap().unwrap();
        assert_eq!(loaded.status, TxStatus::Approved);
        assert_eq!(loaded.amount, 60);
    }

    #[test]
    fn listing_is_per_user() {
        let (db, _dir) = temp_db();
        for user in ["user-1", "user-1", "user-2"] {
            let wd = Withdrawal::new_pending(
                user.to_string(),
                "fuji".to_string(),
                "AVAX".to_string(),
                10,
                "0xdest".to_string(),
            );
            db.create_withdrawal(&wd).unwrap();
        }
        assert_eq!(db.list_withdrawals_by_user("user-1").unwrap().len(), 2);
        assert_eq!(db.list_withdrawals_by_user("user-2").unwrap().len(), 1);
        assert!(db.list_withdrawals_by_user("user-3").unwrap().is_empty());
    }
}
