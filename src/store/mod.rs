// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Ledger Store
//!
//! Durable state for the settlement engine, backed by a single redb
//! database. Entity accessors are grouped per module as `impl LedgerDb`
//! blocks sharing the table definitions in [`db`]:
//!
//! - [`users`] / [`wallets`] — identities and derived deposit addresses
//! - [`chain_txs`] — observed on-chain transfers, unique by hash
//! - [`accounts`] — chart of accounts and running account balances
//! - [`ledger`] — the atomic double-entry posting path and projections
//! - [`state`] — scan cursors and the per-chain advisory lock
//! - [`withdrawals`] / [`sweeps`] — request and consolidation rows
//! - [`balance_cache`] — in-process LRU over the balance projection
//!
//! Every invariant that spans entities is enforced inside one write
//! transaction; redb's single-writer model is what serializes concurrent
//! withdrawal approvals and lock acquisitions.

pub mod accounts;
pub mod balance_cache;
pub mod chain_txs;
pub mod db;
pub mod ledger;
pub mod state;
pub mod sweeps;
pub mod users;
pub mod wallets;
pub mod withdrawals;

pub use accounts::{
    custody_code, deposits_code, equity_code, payouts_code, user_liability_code, users_parent_code,
};
pub use balance_cache::BalanceCache;
pub use chain_txs::UpsertOutcome;
pub use db::{LedgerDb, StoreError, StoreResult};
pub use ledger::{BalanceGuard, PostingDraft};
