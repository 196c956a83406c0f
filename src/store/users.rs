// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! User rows.

use redb::{ReadableDatabase, ReadableTable};

use super::db::{LedgerDb, StoreError, StoreResult, USERS};
use crate::models::{Status, User};

impl LedgerDb {
    /// Create a new user. Fails if the id is taken.
    pub fn create_user(&self, user: &User) -> StoreResult<()> {
        let json = serde_json::to_vec(user)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(USERS)?;
            if table.get(user.user_id.as_str())?.is_some() {
                return Err(StoreError::AlreadyExists(format!(
                    "user {}",
                    user.user_id
                )));
            }
            table.insert(user.user_id.as_str(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_user(&self, user_id: &str) -> StoreResult<Option<User>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS)?;
        match table.get(user_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Users are never deleted; suspension flips the status.
    pub fn set_user_status(&self, user_id: &str, status: Status) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(USERS)?;
            let existing = {
                let value = table
                    .get(user_id)?
                    .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
                value.value().to_vec()
            };
            let mut user: User = serde_json::from_slice(&existing)?;
            user.status = status;
            user.updated_at = chrono::Utc::now();
            let json = serde_json::to_vec(&user)?;
            table.insert(user_id, json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
