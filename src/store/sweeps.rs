// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Sweep rows. A sweep's broadcast hash is unique across the platform.

use redb::{ReadableDatabase, ReadableTable};

use super::db::{LedgerDb, StoreError, StoreResult, SWEEPS, SWEEP_BY_HASH};
use crate::models::{Sweep, SweepStatus};

impl LedgerDb {
    pub fn create_sweep(&self, sweep: &Sweep) -> StoreResult<()> {
        let json = serde_json::to_vec(sweep)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SWEEPS)?;
            if table.get(sweep.sweep_id.as_str())?.is_some() {
                return Err(StoreError::AlreadyExists(format!(
                    "sweep {}",
                    sweep.sweep_id
                )));
            }
            table.insert(sweep.sweep_id.as_str(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_sweep(&self, sweep_id: &str) -> StoreResult<Option<Sweep>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SWEEPS)?;
        match table.get(sweep_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Record the broadcast hash and flip to Broadcasting. The hash must be
    /// globally unused.
    pub fn mark_sweep_broadcasting(&self, sweep_id: &str, tx_hash: &str) -> StoreResult<Sweep> {
        let write_txn = self.db.begin_write()?;
        let sweep = {
            let mut by_hash = write_txn.open_table(SWEEP_BY_HASH)?;
            if by_hash.get(tx_hash)?.is_some() {
                return Err(StoreError::AlreadyExists(format!("sweep hash {tx_hash}")));
            }
            by_hash.insert(tx_hash, sweep_id)?;

            let mut table = write_txn.open_table(SWEEPS)?;
            let existing = {
                let value = table
                    .get(sweep_id)?
                    .ok_or_else(|| StoreError::NotFound(format!("sweep {sweep_id}")))?;
                value.value().to_vec()
            };
            let mut sweep: Sweep = serde_json::from_slice(&existing)?;
            sweep.tx_hash = Some(tx_hash.to_string());
            sweep.status = SweepStatus::Broadcasting;
            sweep.updated_at = chrono::Utc::now();
            let json = serde_json::to_vec(&sweep)?;
            table.insert(sweep_id, json.as_slice())?;
            sweep
        };
        write_txn.commit()?;
        Ok(sweep)
    }

    pub fn set_sweep_status(
        &self,
        sweep_id: &str,
        status: SweepStatus,
        error: Option<String>,
    ) -> StoreResult<Sweep> {
        let write_txn = self.db.begin_write()?;
        let sweep = {
            let mut table = write_txn.open_table(SWEEPS)?;
            let existing = {
                let value = table
                    .get(sweep_id)?
                    .ok_or_else(|| StoreError::NotFound(format!("sweep {sweep_id}")))?;
                value.value().to_vec()
            };
            let mut sweep: Sweep = serde_json::from_slice(&existing)?;
            sweep.status = status;
            sweep.error = error;
            sweep.updated_at = chrono::Utc::now();
            let json = serde_json::to_vec(&sweep)?;
            table.insert(sweep_id, json.as_slice())?;
            sweep
        };
        write_txn.commit()?;
        Ok(sweep)
    }
}
