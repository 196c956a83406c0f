// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Withdrawal processor.
//!
//! State machine: Pending → Approved → Completed, Pending → Rejected,
//! Approved → Failed (broadcast or execution failure, reversed).
//!
//! The double-spend guard lives in the approval posting: the user's balance
//! is re-checked inside the same store transaction that debits it, so two
//! concurrent approvals can never both pass against the same funds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::chain::{with_retries, ChainRpc};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::{
    Amount, ChainTransaction, ChainTxStatus, Status, TxStatus, Withdrawal,
};
use crate::store::LedgerDb;

use super::poster::LedgerPoster;

pub struct WithdrawalProcessor {
    db: Arc<LedgerDb>,
    poster: Arc<LedgerPoster>,
    rpcs: HashMap<String, Arc<dyn ChainRpc>>,
    rpc_max_retries: u32,
    rpc_retry_base: Duration,
}

impl WithdrawalProcessor {
    pub fn new(
        db: Arc<LedgerDb>,
        poster: Arc<LedgerPoster>,
        rpcs: HashMap<String, Arc<dyn ChainRpc>>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            db,
            poster,
            rpcs,
            rpc_max_retries: config.rpc_max_retries,
            rpc_retry_base: config.rpc_retry_base,
        }
    }

    /// File a withdrawal request. Validates synchronously and reserves
    /// nothing; funds are only committed at approval.
    pub fn request(
        &self,
        user_id: &str,
        chain: &str,
        currency: &str,
        amount: Amount,
        to_address: &str,
    ) -> Result<Withdrawal, EngineError> {
        if amount == 0 {
            return Err(EngineError::Rejected("withdrawal amount is zero".into()));
        }
        let user = self
            .db
            .get_user(user_id)?
            .ok_or_else(|| EngineError::not_found("user", user_id))?;
        if user.status != Status::Active {
            return Err(EngineError::Rejected(format!(
                "user {user_id} is not active"
            )));
        }

        let available = self.db.get_user_balance(user_id, chain)?;
        if available < amount as i128 {
            return Err(EngineError::InsufficientBalance {
                user_id: user_id.to_string(),
                chain: chain.to_string(),
                available,
                required: amount,
            });
        }

        let withdrawal = Withdrawal::new_pending(
            user_id.to_string(),
            chain.to_string(),
            currency.to_string(),
            amount,
            to_address.to_string(),
        );
        self.db.create_withdrawal(&withdrawal)?;
        tracing::info!(
            withdrawal_id = %withdrawal.withdrawal_id,
            user_id = %user_id,
            amount = %amount,
            "withdrawal requested"
        );
        Ok(withdrawal)
    }

    /// Owner cancellation, allowed only before approval.
    pub fn cancel(&self, withdrawal_id: &str, user_id: &str) -> Result<Withdrawal, EngineError> {
        let withdrawal = self.load(withdrawal_id)?;
        if withdrawal.user_id != user_id {
            return Err(EngineError::not_found("withdrawal", withdrawal_id));
        }
        self.expect_status(&withdrawal, TxStatus::Pending, "cancel")?;
        self.finish(withdrawal, TxStatus::Rejected, Some("cancelled by owner".into()))
    }

    /// Administrative rejection of a pending request.
    pub fn reject(&self, withdrawal_id: &str, reason: &str) -> Result<Withdrawal, EngineError> {
        let withdrawal = self.load(withdrawal_id)?;
        self.expect_status(&withdrawal, TxStatus::Pending, "reject")?;
        self.finish(withdrawal, TxStatus::Rejected, Some(reason.to_string()))
    }

    /// Approve a pending withdrawal: the reserve posting re-checks the
    /// balance under the debiting transaction. Insufficient funds reject
    /// the request synchronously.
    pub fn approve(&self, withdrawal_id: &str) -> Result<Withdrawal, EngineError> {
        let withdrawal = self.load(withdrawal_id)?;
        self.expect_status(&withdrawal, TxStatus::Pending, "approve")?;

        match self.poster.post_withdrawal_reserve(
            &withdrawal.withdrawal_id,
            &withdrawal.user_id,
            &withdrawal.chain,
            &withdrawal.currency,
            withdrawal.amount,
        ) {
            Ok(_) => self.finish(withdrawal, TxStatus::Approved, None),
            Err(err @ EngineError::InsufficientBalance { .. }) => {
                self.finish(withdrawal, TxStatus::Rejected, Some(err.to_string()))?;
                Err(err)
            }
            Err(e) => Err(e),
        }
    }

    /// Broadcast an approved withdrawal. Broadcast failure reverses the
    /// reservation and fails the withdrawal; success records the outbound
    /// transaction and settles once it confirms.
    pub async fn execute(&self, withdrawal_id: &str) -> Result<Withdrawal, EngineError> {
        let withdrawal = self.load(withdrawal_id)?;
        self.expect_status(&withdrawal, TxStatus::Approved, "execute")?;
        if withdrawal.tx_hash.is_some() {
            // Already broadcast; just try to settle.
            return self.settle_execution(withdrawal_id).await;
        }

        let rpc = self.rpc_for(&withdrawal.chain)?;
        let send = with_retries(self.rpc_max_retries, self.rpc_retry_base, || {
            rpc.broadcast_transfer(&withdrawal.to_address, withdrawal.amount, &withdrawal.currency)
        })
        .await;

        let send = match send {
            Ok(send) => send,
            Err(e) => {
                tracing::warn!(
                    withdrawal_id = %withdrawal_id,
                    error = %e,
                    "withdrawal broadcast failed, reversing reservation"
                );
                self.poster.post_withdrawal_reversal(
                    &withdrawal.withdrawal_id,
                    &withdrawal.user_id,
                    &withdrawal.chain,
                    &withdrawal.currency,
                    withdrawal.amount,
                )?;
                return self.finish(withdrawal, TxStatus::Failed, Some(e.to_string()));
            }
        };

        let custody = rpc.config().custody_address.clone();
        self.db.upsert_chain_tx(&ChainTransaction::new_broadcasted(
            send.tx_hash.clone(),
            withdrawal.chain.clone(),
            custody,
            withdrawal.to_address.clone(),
            withdrawal.amount,
            withdrawal.currency.clone(),
        ))?;

        let mut updated = withdrawal;
        updated.tx_hash = Some(send.tx_hash.clone());
        updated.updated_at = chrono::Utc::now();
        self.db.update_withdrawal(&updated)?;
        tracing::info!(
            withdrawal_id = %withdrawal_id,
            tx_hash = %send.tx_hash,
            "withdrawal broadcast"
        );

        self.settle_execution(withdrawal_id).await
    }

    /// Drive a broadcast withdrawal to its terminal state from the receipt.
    /// Safe to call repeatedly; unmined transactions leave it Approved.
    pub async fn settle_execution(&self, withdrawal_id: &str) -> Result<Withdrawal, EngineError> {
        let withdrawal = self.load(withdrawal_id)?;
        self.expect_status(&withdrawal, TxStatus::Approved, "settle")?;
        let Some(tx_hash) = withdrawal.tx_hash.clone() else {
            return Err(EngineError::InvalidTransition {
                entity: "withdrawal",
                id: withdrawal_id.to_string(),
                detail: "not broadcast yet".to_string(),
            });
        };

        let rpc = self.rpc_for(&withdrawal.chain)?;
        let receipt = with_retries(self.rpc_max_retries, self.rpc_retry_base, || {
            rpc.confirmations(&tx_hash)
        })
        .await?;

        match receipt {
            Some(receipt) if !receipt.success => {
                self.db.fail_chain_tx(&tx_hash)?;
                self.poster.post_withdrawal_reversal(
                    &withdrawal.withdrawal_id,
                    &withdrawal.user_id,
                    &withdrawal.chain,
                    &withdrawal.currency,
                    withdrawal.amount,
                )?;
                self.finish(
                    withdrawal,
                    TxStatus::Failed,
                    Some("on-chain execution reverted".to_string()),
                )
            }
            Some(receipt)
                if receipt.confirmations >= rpc.config().confirmation_depth =>
            {
                let tx = self.db.record_chain_tx_confirmations(
                    &tx_hash,
                    receipt.confirmations,
                    rpc.config().confirmation_depth,
                )?;
                debug_assert_eq!(tx.status, ChainTxStatus::Confirmed);
                self.poster.post_withdrawal_executed(
                    &withdrawal.withdrawal_id,
                    &withdrawal.chain,
                    &withdrawal.currency,
                    withdrawal.amount,
                    &tx_hash,
                )?;
                tracing::info!(withdrawal_id = %withdrawal_id, "withdrawal completed");
                self.finish(withdrawal, TxStatus::Completed, None)
            }
            _ => Ok(withdrawal),
        }
    }

    fn rpc_for(&self, chain: &str) -> Result<&Arc<dyn ChainRpc>, EngineError> {
        self.rpcs
            .get(chain)
            .ok_or_else(|| EngineError::Rejected(format!("unsupported chain {chain}")))
    }

    fn load(&self, withdrawal_id: &str) -> Result<Withdrawal, EngineError> {
        self.db
            .get_withdrawal(withdrawal_id)?
            .ok_or_else(|| EngineError::not_found("withdrawal", withdrawal_id))
    }

    fn expect_status(
        &self,
        withdrawal: &Withdrawal,
        expected: TxStatus,
        action: &str,
    ) -> Result<(), EngineError> {
        if withdrawal.status != expected {
            return Err(EngineError::InvalidTransition {
                entity: "withdrawal",
                id: withdrawal.withdrawal_id.clone(),
                detail: format!("cannot {action} from {:?}", withdrawal.status),
            });
        }
        Ok(())
    }

    fn finish(
        &self,
        mut withdrawal: Withdrawal,
        status: TxStatus,
        error: Option<String>,
    ) -> Result<Withdrawal, EngineError> {
        withdrawal.status = status;
        withdrawal.error = error;
        withdrawal.updated_at = chrono::Utc::now();
        self.db.update_withdrawal(&withdrawal)?;
        Ok(withdrawal)
    }
}
