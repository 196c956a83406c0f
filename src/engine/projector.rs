// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Balance projector: the read side of the ledger.
//!
//! Balances are mutated only by the posting path; this component serves
//! reads through the LRU cache and audits the cached rows against a full
//! replay of the authoritative entry history. It never originates economic
//! effect.

use std::sync::Arc;

use crate::error::EngineError;
use crate::models::{SignedAmount, UserBalance};
use crate::store::{BalanceCache, LedgerDb};

/// Outcome of auditing one (user, chain) projection.
#[derive(Debug, Clone, Copy)]
pub struct RebuildReport {
    pub cached: SignedAmount,
    pub replayed: SignedAmount,
}

impl RebuildReport {
    /// True when the cache disagrees with the replay.
    pub fn drifted(&self) -> bool {
        self.cached != self.replayed
    }
}

pub struct BalanceProjector {
    db: Arc<LedgerDb>,
    cache: Arc<BalanceCache>,
}

impl BalanceProjector {
    pub fn new(db: Arc<LedgerDb>, cache: Arc<BalanceCache>) -> Self {
        Self { db, cache }
    }

    /// The user's projected balance on a chain, served from cache when warm.
    pub fn balance(&self, user_id: &str, chain: &str) -> Result<SignedAmount, EngineError> {
        if let Some(cached) = self.cache.get(user_id, chain) {
            return Ok(cached);
        }
        let balance = self.db.get_user_balance(user_id, chain)?;
        self.cache.put(user_id, chain, balance);
        Ok(balance)
    }

    /// Recompute the balance by folding the full ordered entry history and
    /// compare it with the cached row.
    pub fn rebuild(&self, user_id: &str, chain: &str) -> Result<RebuildReport, EngineError> {
        let cached = self.db.get_user_balance(user_id, chain)?;
        let replayed = self.db.replay_user_balance(user_id, chain)?;
        let report = RebuildReport { cached, replayed };
        if report.drifted() {
            tracing::error!(
                user_id = %user_id,
                chain = %chain,
                cached = %cached,
                replayed = %replayed,
                "balance projection drift detected"
            );
        }
        Ok(report)
    }

    /// Rewrite a drifted projection row from the replayed value.
    pub fn heal(&self, user_id: &str, chain: &str) -> Result<RebuildReport, EngineError> {
        let report = self.rebuild(user_id, chain)?;
        if report.drifted() {
            self.db.put_user_balance(&UserBalance {
                user_id: user_id.to_string(),
                chain: chain.to_string(),
                balance: report.replayed,
                updated_at: chrono::Utc::now(),
            })?;
            self.cache.invalidate(user_id, chain);
            tracing::info!(user_id = %user_id, chain = %chain, "healed balance projection");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::poster::LedgerPoster;
    use crate::models::{ChainTransaction, TxDirection, User};
    use crate::store::db::test_util::temp_db;
    use std::time::Duration;

    fn setup() -> (Arc<LedgerDb>, LedgerPoster, BalanceProjector, tempfile::TempDir) {
        let (db, dir) = temp_db();
        let db = Arc::new(db);
        db.bootstrap_chain_accounts("fuji", "0xcustody").unwrap();
        db.create_user(&User::new("user-1".to_string())).unwrap();
        let cache = Arc::new(BalanceCache::new(16, Duration::from_secs(60)));
        let poster = LedgerPoster::new(db.clone(), cache.clone());
        let projector = BalanceProjector::new(db.clone(), cache);
        (db, poster, projector, dir)
    }

    fn credit(db: &LedgerDb, poster: &LedgerPoster, hash: &str, amount: u128) {
        let tx = ChainTransaction::new_observed(
            hash.to_string(),
            "fuji".to_string(),
            TxDirection::Inbound,
            "0xext".to_string(),
            "0xdep".to_string(),
            amount,
            "AVAX".to_string(),
            5,
        );
        db.upsert_chain_tx(&tx).unwrap();
        poster
            .post_deposit_credit("user-1", "fuji", "AVAX", amount, hash)
            .unwrap();
    }

    #[test]
    fn projection_equals_replay_after_activity() {
        let (db, poster, projector, _dir) = setup();
        credit(&db, &poster, "0xa", 100);
        poster
            .post_withdrawal_reserve("wd-1", "user-1", "fuji", "AVAX", 60)
            .unwrap();
        poster
            .post_withdrawal_reversal("wd-1", "user-1", "fuji", "AVAX", 60)
            .unwrap();

        assert_eq!(projector.balance("user-1", "fuji").unwrap(), 100);

        let report = projector.rebuild("user-1", "fuji").unwrap();
        assert!(!report.drifted());
        assert_eq!(report.replayed, 100);
    }

    #[test]
    fn cache_is_invalidated_by_postings() {
        let (db, poster, projector, _dir) = setup();
        credit(&db, &poster, "0xa", 100);

        // Warm the cache, then post again; the next read must see the credit.
        assert_eq!(projector.balance("user-1", "fuji").unwrap(), 100);
        credit(&db, &poster, "0xb", 50);
        assert_eq!(projector.balance("user-1", "fuji").unwrap(), 150);
    }

    #[test]
    fn heal_rewrites_a_corrupted_row() {
        let (db, poster, projector, _dir) = setup();
        credit(&db, &poster, "0xa", 100);

        // Corrupt the cached row behind the projector's back.
        db.put_user_balance(&UserBalance {
            user_id: "user-1".to_string(),
            chain: "fuji".to_string(),
            balance: 7,
            updated_at: chrono::Utc::now(),
        })
        .unwrap();

        let report = projector.heal("user-1", "fuji").unwrap();
        assert!(report.drifted());
        assert_eq!(db.get_user_balance("user-1", "fuji").unwrap(), 100);

        let after = projector.rebuild("user-1", "fuji").unwrap();
        assert!(!after.drifted());
    }
}
