// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! The ledger poster: the only component that creates treasury ledgers.
//!
//! Deposit credits, withdrawal reservations and executions, reversals,
//! sweeps, and adjustments are all expressed as semantic methods here, each
//! compiling down to one balanced [`PostingDraft`] committed atomically by
//! the store. Callers never assemble raw entries themselves, which is what
//! keeps the global books balanced by construction.

use std::sync::Arc;

use crate::error::EngineError;
use crate::models::{
    Amount, LedgerReferenceType, LedgerType, TreasuryEntry, TreasuryLedger,
};
use crate::store::{
    custody_code, deposits_code, equity_code, payouts_code, BalanceCache, BalanceGuard, LedgerDb,
    PostingDraft, StoreError,
};

pub struct LedgerPoster {
    db: Arc<LedgerDb>,
    cache: Arc<BalanceCache>,
}

impl LedgerPoster {
    pub fn new(db: Arc<LedgerDb>, cache: Arc<BalanceCache>) -> Self {
        Self { db, cache }
    }

    /// Post an arbitrary balanced draft. Validation and the projection all
    /// happen inside the store's single write transaction.
    pub fn post(&self, draft: PostingDraft) -> Result<TreasuryLedger, EngineError> {
        let touched = self.touched_users(&draft)?;
        let ledger = self.db.commit_posting(&draft).map_err(map_posting_error)?;

        for (user_id, chain) in &touched {
            self.cache.invalidate(user_id, chain);
        }

        tracing::info!(
            ledger_id = %ledger.ledger_id,
            reference = %ledger.reference_id,
            entries = draft.entries.len(),
            "posted treasury ledger"
        );
        Ok(ledger)
    }

    /// Credit a confirmed inbound deposit to its owning user.
    ///
    /// `tx_hash` is settled in the same transaction, so a hash credits at
    /// most once no matter how often the reconciler retries.
    pub fn post_deposit_credit(
        &self,
        user_id: &str,
        chain: &str,
        currency: &str,
        amount: Amount,
        tx_hash: &str,
    ) -> Result<TreasuryLedger, EngineError> {
        let deposits = self.account_id(&deposits_code(chain))?;
        let user_account = self.db.ensure_user_liability_account(user_id, chain)?;

        self.post(PostingDraft {
            reference_type: LedgerReferenceType::Deposit,
            reference_id: tx_hash.to_string(),
            description: format!("deposit {tx_hash} for user {user_id}"),
            entries: vec![
                TreasuryEntry::debit(&deposits, amount, currency, chain),
                TreasuryEntry::credit(&user_account.account_id, amount, currency, chain),
            ],
            legacy_type: LedgerType::Deposit,
            guard: None,
            settle_tx_hash: Some(tx_hash.to_string()),
        })
    }

    /// Reserve an approved withdrawal: move the amount from the user's
    /// liability into pending payouts, re-checking the balance under the
    /// same transaction.
    pub fn post_withdrawal_reserve(
        &self,
        withdrawal_id: &str,
        user_id: &str,
        chain: &str,
        currency: &str,
        amount: Amount,
    ) -> Result<TreasuryLedger, EngineError> {
        let payouts = self.account_id(&payouts_code(chain))?;
        let user_account = self.db.ensure_user_liability_account(user_id, chain)?;

        self.post(PostingDraft {
            reference_type: LedgerReferenceType::WithdrawalRequest,
            reference_id: withdrawal_id.to_string(),
            description: format!("reserve withdrawal {withdrawal_id}"),
            entries: vec![
                TreasuryEntry::debit(&user_account.account_id, amount, currency, chain),
                TreasuryEntry::credit(&payouts, amount, currency, chain),
            ],
            legacy_type: LedgerType::Withdrawal,
            guard: Some(BalanceGuard {
                user_id: user_id.to_string(),
                chain: chain.to_string(),
                required: amount,
            }),
            settle_tx_hash: None,
        })
    }

    /// Settle an executed withdrawal: release the reservation and let the
    /// funds leave custody.
    pub fn post_withdrawal_executed(
        &self,
        withdrawal_id: &str,
        chain: &str,
        currency: &str,
        amount: Amount,
        tx_hash: &str,
    ) -> Result<TreasuryLedger, EngineError> {
        let payouts = self.account_id(&payouts_code(chain))?;
        let custody = self.account_id(&custody_code(chain))?;

        self.post(PostingDraft {
            reference_type: LedgerReferenceType::WithdrawalExecuted,
            reference_id: withdrawal_id.to_string(),
            description: format!("settle withdrawal {withdrawal_id} via {tx_hash}"),
            entries: vec![
                TreasuryEntry::debit(&payouts, amount, currency, chain),
                TreasuryEntry::credit(&custody, amount, currency, chain),
            ],
            legacy_type: LedgerType::Withdrawal,
            guard: None,
            settle_tx_hash: Some(tx_hash.to_string()),
        })
    }

    /// Reverse a failed withdrawal, restoring the user's balance.
    pub fn post_withdrawal_reversal(
        &self,
        withdrawal_id: &str,
        user_id: &str,
        chain: &str,
        currency: &str,
        amount: Amount,
    ) -> Result<TreasuryLedger, EngineError> {
        let payouts = self.account_id(&payouts_code(chain))?;
        let user_account = self.db.ensure_user_liability_account(user_id, chain)?;

        self.post(PostingDraft {
            reference_type: LedgerReferenceType::Adjustment,
            reference_id: withdrawal_id.to_string(),
            description: format!("reverse failed withdrawal {withdrawal_id}"),
            entries: vec![
                TreasuryEntry::debit(&payouts, amount, currency, chain),
                TreasuryEntry::credit(&user_account.account_id, amount, currency, chain),
            ],
            legacy_type: LedgerType::Adjustment,
            guard: None,
            settle_tx_hash: None,
        })
    }

    /// Settle a confirmed sweep: deposit-address funds became custody funds.
    pub fn post_sweep_settlement(
        &self,
        sweep_id: &str,
        chain: &str,
        currency: &str,
        amount: Amount,
        tx_hash: &str,
    ) -> Result<TreasuryLedger, EngineError> {
        let deposits = self.account_id(&deposits_code(chain))?;
        let custody = self.account_id(&custody_code(chain))?;

        self.post(PostingDraft {
            reference_type: LedgerReferenceType::Sweep,
            reference_id: sweep_id.to_string(),
            description: format!("sweep {sweep_id} via {tx_hash}"),
            entries: vec![
                TreasuryEntry::debit(&custody, amount, currency, chain),
                TreasuryEntry::credit(&deposits, amount, currency, chain),
            ],
            legacy_type: LedgerType::Transfer,
            guard: None,
            settle_tx_hash: Some(tx_hash.to_string()),
        })
    }

    /// Manual adjustment between treasury equity and a user's liability.
    /// Positive `amount` grants, the ledger stays balanced either way.
    pub fn post_adjustment(
        &self,
        reference_id: &str,
        user_id: &str,
        chain: &str,
        currency: &str,
        amount: Amount,
        grant: bool,
    ) -> Result<TreasuryLedger, EngineError> {
        let equity = self.account_id(&equity_code(chain))?;
        let user_account = self.db.ensure_user_liability_account(user_id, chain)?;

        let entries = if grant {
            vec![
                TreasuryEntry::debit(&equity, amount, currency, chain),
                TreasuryEntry::credit(&user_account.account_id, amount, currency, chain),
            ]
        } else {
            vec![
                TreasuryEntry::debit(&user_account.account_id, amount, currency, chain),
                TreasuryEntry::credit(&equity, amount, currency, chain),
            ]
        };

        self.post(PostingDraft {
            reference_type: LedgerReferenceType::Adjustment,
            reference_id: reference_id.to_string(),
            description: format!("adjustment {reference_id} for user {user_id}"),
            entries,
            legacy_type: LedgerType::Adjustment,
            guard: if grant {
                None
            } else {
                Some(BalanceGuard {
                    user_id: user_id.to_string(),
                    chain: chain.to_string(),
                    required: amount,
                })
            },
            settle_tx_hash: None,
        })
    }

    fn account_id(&self, code: &str) -> Result<String, EngineError> {
        self.db
            .get_account_by_code(code)?
            .map(|a| a.account_id)
            .ok_or_else(|| EngineError::InactiveAccount(code.to_string()))
    }

    /// Users whose projections this draft will move, for cache invalidation.
    fn touched_users(&self, draft: &PostingDraft) -> Result<Vec<(String, String)>, EngineError> {
        let mut touched = Vec::new();
        for entry in &draft.entries {
            if let Some(account) = self.db.get_treasury_account(&entry.account_id)? {
                if let Some(owner) = account.owner_user_id {
                    let pair = (owner, account.chain);
                    if !touched.contains(&pair) {
                        touched.push(pair);
                    }
                }
            }
        }
        Ok(touched)
    }
}

/// Lift store-level posting failures into the engine taxonomy.
fn map_posting_error(err: StoreError) -> EngineError {
    match err {
        StoreError::Unbalanced {
            currency,
            chain,
            debits,
            credits,
        } => EngineError::Unbalanced {
            currency,
            chain,
            debits,
            credits,
        },
        StoreError::InactiveAccount(code) => EngineError::InactiveAccount(code),
        StoreError::InsufficientBalance {
            user_id,
            chain,
            available,
            required,
        } => EngineError::InsufficientBalance {
            user_id,
            chain,
            available,
            required,
        },
        other => EngineError::Store(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;
    use crate::store::db::test_util::temp_db;
    use std::time::Duration;

    fn setup() -> (Arc<LedgerDb>, LedgerPoster, tempfile::TempDir) {
        let (db, dir) = temp_db();
        let db = Arc::new(db);
        db.bootstrap_chain_accounts("fuji", "0xcustody").unwrap();
        db.create_user(&User::new("user-1".to_string())).unwrap();
        let cache = Arc::new(BalanceCache::new(16, Duration::from_secs(60)));
        let poster = LedgerPoster::new(db.clone(), cache);
        (db, poster, dir)
    }

    fn seed_deposit_tx(db: &LedgerDb, hash: &str, amount: u128) {
        let tx = crate::models::ChainTransaction::new_observed(
            hash.to_string(),
            "fuji".to_string(),
            crate::models::TxDirection::Inbound,
            "0xext".to_string(),
            "0xdep".to_string(),
            amount,
            "AVAX".to_string(),
            5,
        );
        db.upsert_chain_tx(&tx).unwrap();
    }

    #[test]
    fn deposit_credit_is_idempotent_per_hash() {
        let (db, poster, _dir) = setup();
        seed_deposit_tx(&db, "0xdep1", 50);

        poster
            .post_deposit_credit("user-1", "fuji", "AVAX", 50, "0xdep1")
            .unwrap();
        assert_eq!(db.get_user_balance("user-1", "fuji").unwrap(), 50);

        let err = poster
            .post_deposit_credit("user-1", "fuji", "AVAX", 50, "0xdep1")
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Store(StoreError::AlreadyPosted(_))
        ));
        assert_eq!(db.get_user_balance("user-1", "fuji").unwrap(), 50);
    }

    #[test]
    fn reserve_then_reversal_restores_balance() {
        let (db, poster, _dir) = setup();
        seed_deposit_tx(&db, "0xdep2", 100);
        poster
            .post_deposit_credit("user-1", "fuji", "AVAX", 100, "0xdep2")
            .unwrap();

        poster
            .post_withdrawal_reserve("wd-1", "user-1", "fuji", "AVAX", 60)
            .unwrap();
        assert_eq!(db.get_user_balance("user-1", "fuji").unwrap(), 40);

        poster
            .post_withdrawal_reversal("wd-1", "user-1", "fuji", "AVAX", 60)
            .unwrap();
        assert_eq!(db.get_user_balance("user-1", "fuji").unwrap(), 100);

        // Both ledgers reference the withdrawal.
        let ledgers = db.list_ledgers_for_reference("wd-1").unwrap();
        assert_eq!(ledgers.len(), 2);
    }

    #[test]
    fn reserve_rejects_overdraw() {
        let (db, poster, _dir) = setup();
        seed_deposit_tx(&db, "0xdep3", 50);
        poster
            .post_deposit_credit("user-1", "fuji", "AVAX", 50, "0xdep3")
            .unwrap();

        let err = poster
            .post_withdrawal_reserve("wd-1", "user-1", "fuji", "AVAX", 60)
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientBalance { .. }));
        assert_eq!(db.get_user_balance("user-1", "fuji").unwrap(), 50);
    }

    #[test]
    fn adjustment_grant_and_clawback() {
        let (db, poster, _dir) = setup();
        poster
            .post_adjustment("adj-1", "user-1", "fuji", "AVAX", 30, true)
            .unwrap();
        assert_eq!(db.get_user_balance("user-1", "fuji").unwrap(), 30);

        poster
            .post_adjustment("adj-2", "user-1", "fuji", "AVAX", 10, false)
            .unwrap();
        assert_eq!(db.get_user_balance("user-1", "fuji").unwrap(), 20);
    }
}
