// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-chain operational state: scan cursors and the treasury advisory lock.
//!
//! The lock is compare-and-set over durable state, not an in-process mutex:
//! redb's single-writer transactions make the read-check-write atomic, and
//! multiple service instances sharing the store see the same lock row. A
//! crashed holder is reclaimed after the staleness window.

use std::time::Duration;

use chrono::Utc;
use redb::{ReadableDatabase, ReadableTable};

use super::db::{LedgerDb, StoreError, StoreResult, SCAN_STATE, TREASURY_STATE};
use crate::models::{Amount, ChainScanState, SignedAmount, TreasuryState};

impl LedgerDb {
    // =========================================================================
    // Scan cursor
    // =========================================================================

    /// Last block fully recorded for a chain; 0 when never scanned.
    pub fn get_scan_state(&self, chain: &str) -> StoreResult<ChainScanState> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SCAN_STATE)?;
        match table.get(chain)? {
            Some(value) => Ok(serde_json::from_slice(value.value())?),
            None => Ok(ChainScanState {
                chain: chain.to_string(),
                last_scanned_block: 0,
                updated_at: Utc::now(),
            }),
        }
    }

    /// Advance the scan cursor. Called only after the batch covering the
    /// range is durably recorded; refuses to move backwards.
    pub fn advance_scan_cursor(&self, chain: &str, block: u64) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SCAN_STATE)?;
            let current = match table.get(chain)? {
                Some(value) => {
                    let state: ChainScanState = serde_json::from_slice(value.value())?;
                    state.last_scanned_block
                }
                None => 0,
            };
            if block < current {
                return Err(StoreError::CursorRegression {
                    chain: chain.to_string(),
                    have: current,
                    got: block,
                });
            }
            let state = ChainScanState {
                chain: chain.to_string(),
                last_scanned_block: block,
                updated_at: Utc::now(),
            };
            let json = serde_json::to_vec(&state)?;
            table.insert(chain, json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // =========================================================================
    // Treasury state & advisory lock
    // =========================================================================

    pub fn get_treasury_state(&self, chain: &str) -> StoreResult<TreasuryState> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TREASURY_STATE)?;
        match table.get(chain)? {
            Some(value) => Ok(serde_json::from_slice(value.value())?),
            None => Ok(TreasuryState::new(chain.to_string())),
        }
    }

    /// Refresh the aggregate custody totals after a chain sync.
    pub fn update_treasury_totals(
        &self,
        chain: &str,
        onchain_total: Amount,
        user_liabilities: SignedAmount,
        sweepable_balance: Amount,
    ) -> StoreResult<TreasuryState> {
        self.mutate_treasury_state(chain, |state| {
            state.onchain_total = onchain_total;
            state.user_liabilities = user_liabilities;
            state.sweepable_balance = sweepable_balance;
            state.last_synced_at = Some(Utc::now());
        })
    }

    /// Acquire the per-chain advisory lock.
    ///
    /// Fails fast with [`StoreError::LockHeld`] when another owner holds it
    /// and the hold is younger than `staleness`. A stale hold is taken over.
    pub fn try_lock_treasury(
        &self,
        chain: &str,
        owner: &str,
        staleness: Duration,
    ) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TREASURY_STATE)?;
            let mut state = match table.get(chain)? {
                Some(value) => serde_json::from_slice(value.value())?,
                None => TreasuryState::new(chain.to_string()),
            };

            if state.locked {
                let stale = state
                    .locked_at
                    .map(|at| {
                        let held_for = Utc::now().signed_duration_since(at).num_seconds().max(0);
                        held_for as u64 >= staleness.as_secs()
                    })
                    .unwrap_or(true);
                if !stale {
                    return Err(StoreError::LockHeld {
                        chain: chain.to_string(),
                        holder: state.locked_by.unwrap_or_else(|| "unknown".to_string()),
                    });
                }
                tracing::warn!(
                    chain = %chain,
                    previous = state.locked_by.as_deref().unwrap_or("unknown"),
                    "reclaiming stale treasury lock"
                );
            }

            state.locked = true;
            state.locked_at = Some(Utc::now());
            state.locked_by = Some(owner.to_string());
            let json = serde_json::to_vec(&state)?;
            table.insert(chain, json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Release the lock. Only the current owner's release clears it.
    pub fn unlock_treasury(&self, chain: &str, owner: &str) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TREASURY_STATE)?;
            let mut state: TreasuryState = match table.get(chain)? {
                Some(value) => serde_json::from_slice(value.value())?,
                None => return Err(StoreError::NotFound(format!("treasury state {chain}"))),
            };
            if !state.locked {
                return Ok(());
            }
            if state.locked_by.as_deref() != Some(owner) {
                return Err(StoreError::LockHeld {
                    chain: chain.to_string(),
                    holder: state.locked_by.unwrap_or_else(|| "unknown".to_string()),
                });
            }
            state.locked = false;
            state.locked_at = None;
            state.locked_by = None;
            let json = serde_json::to_vec(&state)?;
            table.insert(chain, json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn mutate_treasury_state(
        &self,
        chain: &str,
        mutate: impl FnOnce(&mut TreasuryState),
    ) -> StoreResult<TreasuryState> {
        let write_txn = self.db.begin_write()?;
        let state = {
            let mut table = write_txn.open_table(TREASURY_STATE)?;
            let mut state = match table.get(chain)? {
                Some(value) => serde_json::from_slice(value.value())?,
                None => TreasuryState::new(chain.to_string()),
            };
            mutate(&mut state);
            let json = serde_json::to_vec(&state)?;
            table.insert(chain, json.as_slice())?;
            state
        };
        write_txn.commit()?;
        Ok(state)
    }
}
