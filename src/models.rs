// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Persisted domain entities and enumerations.
//!
//! All monetary amounts are integer minor units (`Amount`/`SignedAmount`).
//! Enum wire names are part of the storage contract and must not change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unsigned amount in minor units (wei, satoshi, cents).
pub type Amount = u128;

/// Signed amount in minor units, used for deltas and running balances.
pub type SignedAmount = i128;

// =============================================================================
// Enumerations (stable storage contract)
// =============================================================================

/// Platform role of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    User,
    Admin,
}

/// Account standing of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Active,
    Banned,
}

/// Economic direction of a legacy ledger line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxType {
    Deposit,
    Withdrawal,
}

/// Withdrawal request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    Pending,
    Approved,
    Completed,
    Failed,
    Rejected,
}

impl Default for TxStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// Lifecycle of an observed on-chain transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainTxStatus {
    Pending,
    Broadcasted,
    Confirmed,
    Failed,
}

impl Default for ChainTxStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// Whether a transfer moves value into or out of custody.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxDirection {
    Inbound,
    Outbound,
}

/// Category of a legacy ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerType {
    Deposit,
    Withdrawal,
    Adjustment,
    Transfer,
    Earning,
}

/// Position of an account in the accounting equation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TreasuryAccountType {
    Asset,
    Liability,
    Equity,
}

impl TreasuryAccountType {
    /// Asset accounts grow with debits; liability and equity with credits.
    pub fn is_debit_normal(self) -> bool {
        matches!(self, Self::Asset)
    }
}

/// Domain object a treasury ledger settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerReferenceType {
    Deposit,
    WithdrawalRequest,
    WithdrawalExecuted,
    Sweep,
    TreasuryMove,
    Adjustment,
}

/// Sweep lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SweepStatus {
    Pending,
    Broadcasting,
    Confirmed,
    Failed,
}

// =============================================================================
// Users & Wallets
// =============================================================================

/// Platform user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique user identifier (UUID)
    pub user_id: String,
    pub role: Role,
    pub status: Status,
    /// Legacy aggregate balance across all chains, maintained by the
    /// posting path alongside the per-chain projections.
    pub cached_balance: SignedAmount,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(user_id: String) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            role: Role::User,
            status: Status::Active,
            cached_balance: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Deposit address derived for one user on one chain.
///
/// Immutable once created. `(chain, derivation_index)` and `(user_id, chain)`
/// are each unique across the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserWallet {
    pub user_id: String,
    pub chain: String,
    pub derivation_index: u64,
    pub address: String,
    /// Scanner-refreshed cache of the on-chain balance. Not authoritative.
    pub last_known_balance: Amount,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Chain transactions
// =============================================================================

/// One observed on-chain transfer touching a known address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainTransaction {
    /// On-chain hash (0x prefixed). Globally unique.
    pub tx_hash: String,
    pub chain: String,
    pub direction: TxDirection,
    pub from: String,
    pub to: String,
    /// Transfer value in minor units.
    pub amount: Amount,
    pub currency: String,
    pub status: ChainTxStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    pub confirmations: u64,
    /// Set once a ledger posting has settled this transaction. Checked inside
    /// the posting transaction, so at most one posting ever succeeds.
    pub posted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChainTransaction {
    /// Record a transfer observed by the scanner.
    #[allow(clippy::too_many_arguments)]
    pub fn new_observed(
        tx_hash: String,
        chain: String,
        direction: TxDirection,
        from: String,
        to: String,
        amount: Amount,
        currency: String,
        block_number: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            tx_hash,
            chain,
            direction,
            from,
            to,
            amount,
            currency,
            status: ChainTxStatus::Pending,
            block_number: Some(block_number),
            confirmations: 0,
            posted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record an outbound transfer this service just broadcast.
    pub fn new_broadcasted(
        tx_hash: String,
        chain: String,
        from: String,
        to: String,
        amount: Amount,
        currency: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            tx_hash,
            chain,
            direction: TxDirection::Outbound,
            from,
            to,
            amount,
            currency,
            status: ChainTxStatus::Broadcasted,
            block_number: None,
            confirmations: 0,
            posted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_confirmed(&mut self, confirmations: u64) {
        self.status = ChainTxStatus::Confirmed;
        self.confirmations = confirmations;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self) {
        self.status = ChainTxStatus::Failed;
        self.updated_at = Utc::now();
    }
}

// =============================================================================
// Legacy simple ledger
// =============================================================================

/// One legacy per-user ledger line. Append-only, written by the posting path
/// in the same transaction as the double-entry rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub user_id: String,
    pub chain: String,
    pub ledger_type: LedgerType,
    /// Signed effect on the user's balance.
    pub delta: SignedAmount,
    /// Running balance for (user, chain) after this line.
    pub balance_after: SignedAmount,
    /// Id of the treasury ledger that produced this line.
    pub treasury_ledger_id: String,
    pub created_at: DateTime<Utc>,
}

/// Read-optimized per-(user, chain) balance projection.
///
/// Mutated only by the posting path; always equal to the replay of the
/// user's ledger entries for that chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBalance {
    pub user_id: String,
    pub chain: String,
    pub balance: SignedAmount,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Treasury ledger
// =============================================================================

/// Node in the chart of accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreasuryAccount {
    pub account_id: String,
    /// Stable human-readable code, e.g. `asset:custody:fuji`. Unique.
    pub code: String,
    pub name: String,
    pub account_type: TreasuryAccountType,
    /// Parent account id; hierarchy is traversed by repeated lookup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// On-chain address this account mirrors, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet_address: Option<String>,
    /// Owning user for user-linked liability accounts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_user_id: Option<String>,
    pub chain: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// One balanced set of entries for a single economic event.
///
/// `locked` is set in the same transaction that writes the entries; a locked
/// ledger is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreasuryLedger {
    pub ledger_id: String,
    pub reference_type: LedgerReferenceType,
    /// Id of the originating domain object (tx hash, withdrawal id, ...).
    pub reference_id: String,
    pub description: String,
    pub locked: bool,
    pub created_at: DateTime<Utc>,
}

/// One debit or credit line against one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreasuryEntry {
    pub entry_id: String,
    pub ledger_id: String,
    pub account_id: String,
    pub debit_amount: Amount,
    pub credit_amount: Amount,
    pub currency: String,
    /// Network the currency settles on. The same currency on two networks is
    /// custodied separately.
    pub chain: String,
}

impl TreasuryEntry {
    pub fn debit(account_id: &str, amount: Amount, currency: &str, chain: &str) -> Self {
        Self {
            entry_id: uuid::Uuid::new_v4().to_string(),
            ledger_id: String::new(),
            account_id: account_id.to_string(),
            debit_amount: amount,
            credit_amount: 0,
            currency: currency.to_string(),
            chain: chain.to_string(),
        }
    }

    pub fn credit(account_id: &str, amount: Amount, currency: &str, chain: &str) -> Self {
        Self {
            entry_id: uuid::Uuid::new_v4().to_string(),
            ledger_id: String::new(),
            account_id: account_id.to_string(),
            debit_amount: 0,
            credit_amount: amount,
            currency: currency.to_string(),
            chain: chain.to_string(),
        }
    }

    /// Effect of this line on its account's running balance, oriented by the
    /// account's normal side.
    pub fn signed_effect(&self, account_type: TreasuryAccountType) -> SignedAmount {
        let debit = self.debit_amount as SignedAmount;
        let credit = self.credit_amount as SignedAmount;
        if account_type.is_debit_normal() {
            debit - credit
        } else {
            credit - debit
        }
    }
}

/// Materialized trial balance for one (currency, chain) pair. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub snapshot_id: String,
    pub currency: String,
    pub chain: String,
    pub assets_total: SignedAmount,
    pub liabilities_total: SignedAmount,
    pub equity_total: SignedAmount,
    /// True when assets != liabilities + equity at snapshot time.
    pub drift: bool,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Per-chain operational state
// =============================================================================

/// Aggregate custody state and advisory lock for one chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreasuryState {
    pub chain: String,
    /// Sum of on-chain balances over deposit and custody addresses.
    pub onchain_total: Amount,
    /// Sum of user liability balances for this chain.
    pub user_liabilities: SignedAmount,
    /// Surplus available for consolidation, computed at last sync.
    pub sweepable_balance: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Advisory lock guarding sweep/settlement. Compare-and-set over the
    /// store, reclaimed after a staleness window.
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
}

impl TreasuryState {
    pub fn new(chain: String) -> Self {
        Self {
            chain,
            onchain_total: 0,
            user_liabilities: 0,
            sweepable_balance: 0,
            last_synced_at: None,
            locked: false,
            locked_at: None,
            locked_by: None,
        }
    }
}

/// Scan cursor for one chain. `last_scanned_block` never decreases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainScanState {
    pub chain: String,
    pub last_scanned_block: u64,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Withdrawals & Sweeps
// =============================================================================

/// A user withdrawal request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Withdrawal {
    pub withdrawal_id: String,
    pub user_id: String,
    pub chain: String,
    pub currency: String,
    pub amount: Amount,
    pub to_address: String,
    pub status: TxStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Withdrawal {
    pub fn new_pending(
        user_id: String,
        chain: String,
        currency: String,
        amount: Amount,
        to_address: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            withdrawal_id: uuid::Uuid::new_v4().to_string(),
            user_id,
            chain,
            currency,
            amount,
            to_address,
            status: TxStatus::Pending,
            tx_hash: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A consolidation moving deposit-address funds into the custody wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sweep {
    pub sweep_id: String,
    pub chain: String,
    pub currency: String,
    pub amount: Amount,
    pub from_address: String,
    pub to_address: String,
    pub status: SweepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sweep {
    pub fn new_pending(
        chain: String,
        currency: String,
        amount: Amount,
        from_address: String,
        to_address: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            sweep_id: uuid::Uuid::new_v4().to_string(),
            chain,
            currency,
            amount,
            from_address,
            to_address,
            status: SweepStatus::Pending,
            tx_hash: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_wire_names_are_stable() {
        assert_eq!(serde_json::to_string(&Role::Admin).unwrap(), "\"ADMIN\"");
        assert_eq!(serde_json::to_string(&Status::Banned).unwrap(), "\"BANNED\"");
        assert_eq!(
            serde_json::to_string(&TxType::Deposit).unwrap(),
            "\"DEPOSIT\""
        );
        assert_eq!(
            serde_json::to_string(&ChainTxStatus::Broadcasted).unwrap(),
            "\"BROADCASTED\""
        );
        assert_eq!(
            serde_json::to_string(&LedgerReferenceType::WithdrawalRequest).unwrap(),
            "\"WITHDRAWAL_REQUEST\""
        );
        assert_eq!(
            serde_json::to_string(&TxStatus::Rejected).unwrap(),
            "\"REJECTED\""
        );
        assert_eq!(
            serde_json::to_string(&SweepStatus::Broadcasting).unwrap(),
            "\"BROADCASTING\""
        );
    }

    #[test]
    fn signed_effect_respects_normal_side() {
        let debit = TreasuryEntry::debit("acct", 100, "AVAX", "fuji");
        assert_eq!(debit.signed_effect(TreasuryAccountType::Asset), 100);
        assert_eq!(debit.signed_effect(TreasuryAccountType::Liability), -100);

        let credit = TreasuryEntry::credit("acct", 40, "AVAX", "fuji");
        assert_eq!(credit.signed_effect(TreasuryAccountType::Asset), -40);
        assert_eq!(credit.signed_effect(TreasuryAccountType::Equity), 40);
    }

    #[test]
    fn chain_tx_transitions() {
        let mut tx = ChainTransaction::new_observed(
            "0xabc".into(),
            "fuji".into(),
            TxDirection::Inbound,
            "0x1".into(),
            "0x2".into(),
            50,
            "AVAX".into(),
            1000,
        );
        assert_eq!(tx.status, ChainTxStatus::Pending);
        assert!(!tx.posted);

        tx.mark_confirmed(12);
        assert_eq!(tx.status, ChainTxStatus::Confirmed);
        assert_eq!(tx.confirmations, 12);
    }
}
