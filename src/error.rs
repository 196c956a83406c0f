// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Engine-level error taxonomy.
//!
//! Transient chain-RPC failures are retried internally before surfacing.
//! Invariant violations abort the whole posting transaction. Lock contention
//! and business rejections are surfaced synchronously and never retried
//! inside the engine.

use crate::models::{Amount, SignedAmount};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Chain RPC failure that exhausted its retry budget.
    #[error("chain rpc error: {0}")]
    Rpc(#[from] crate::chain::ChainRpcError),

    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// Ledger lines do not balance for a (currency, chain) group.
    #[error("unbalanced ledger for {currency}/{chain}: debits {debits} != credits {credits}")]
    Unbalanced {
        currency: String,
        chain: String,
        debits: Amount,
        credits: Amount,
    },

    /// Attempt to mutate a ledger that has been posted and locked.
    #[error("ledger {0} is locked")]
    LedgerLocked(String),

    /// Posting references an account that is inactive or missing.
    #[error("account {0} is not active")]
    InactiveAccount(String),

    /// Balance guard failed: the debit would overdraw the user.
    #[error("insufficient balance for user {user_id} on {chain}: have {available}, need {required}")]
    InsufficientBalance {
        user_id: String,
        chain: String,
        available: SignedAmount,
        required: Amount,
    },

    /// The per-chain advisory lock is held by another worker.
    #[error("treasury lock for {chain} held by {holder}")]
    LockBusy { chain: String, holder: String },

    /// Requested state transition is not legal from the current status.
    #[error("invalid transition for {entity} {id}: {detail}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        detail: String,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Business rejection, reported to the caller with nothing mutated.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let err = EngineError::InsufficientBalance {
            user_id: "u1".into(),
            chain: "fuji".into(),
            available: 40,
            required: 60,
        };
        let msg = err.to_string();
        assert!(msg.contains("u1"));
        assert!(msg.contains("40"));
        assert!(msg.contains("60"));

        let busy = EngineError::LockBusy {
            chain: "fuji".into(),
            holder: "sweeper-1".into(),
        };
        assert!(busy.to_string().contains("sweeper-1"));
    }
}
