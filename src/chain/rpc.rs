// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Chain RPC capability consumed by the settlement engine.
//!
//! The engine never talks to a node directly; every chain is reached through
//! this trait. Production chains use the alloy-backed [`EvmRpc`]; tests use
//! an in-memory mock.
//!
//! [`EvmRpc`]: super::evm::EvmRpc

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use super::types::{ChainConfig, SendResult, TransferEvent, TxConfirmation};
use crate::models::Amount;

/// Errors from chain RPC operations.
#[derive(Debug, thiserror::Error)]
pub enum ChainRpcError {
    /// Timeout or temporary node unavailability. Retried with backoff.
    #[error("transient rpc error: {0}")]
    Transient(String),

    #[error("invalid RPC URL: {0}")]
    InvalidRpcUrl(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("broadcast failed: {0}")]
    Broadcast(String),
}

impl ChainRpcError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Read/broadcast capability for one chain.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Static configuration of the chain this capability serves.
    fn config(&self) -> &ChainConfig;

    /// Current head block number.
    async fn head_block(&self) -> Result<u64, ChainRpcError>;

    /// Transfers within `[from_block, to_block]` whose destination or source
    /// is one of `watched` (lowercase addresses).
    async fn transfers_in_range(
        &self,
        from_block: u64,
        to_block: u64,
        watched: &HashSet<String>,
    ) -> Result<Vec<TransferEvent>, ChainRpcError>;

    /// Receipt status for a broadcast transaction. `None` while unmined.
    async fn confirmations(&self, tx_hash: &str) -> Result<Option<TxConfirmation>, ChainRpcError>;

    /// Broadcast a signed transfer of `amount` minor units of `currency`.
    async fn broadcast_transfer(
        &self,
        to: &str,
        amount: Amount,
        currency: &str,
    ) -> Result<SendResult, ChainRpcError>;

    /// Current on-chain balance of an address in native minor units.
    async fn address_balance(&self, address: &str) -> Result<Amount, ChainRpcError>;
}

/// Address derivation capability for per-user deposit wallets.
///
/// Key material lives outside this engine; only derived public addresses
/// cross this boundary.
pub trait WalletDeriver: Send + Sync {
    fn derive_address(&self, chain: &str, derivation_index: u64) -> Result<String, ChainRpcError>;
}

/// Hard per-call deadline; an RPC call never blocks unboundedly.
const RPC_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Run `op` under the per-call deadline, retrying transient failures (and
/// timeouts) with doubling backoff up to `max_retries` additional attempts.
/// Non-transient errors surface at once.
pub async fn with_retries<T, F, Fut>(
    max_retries: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, ChainRpcError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChainRpcError>>,
{
    let mut attempt = 0;
    let mut delay = base_delay;
    loop {
        let outcome = match tokio::time::timeout(RPC_CALL_TIMEOUT, op()).await {
            Ok(result) => result,
            Err(_) => Err(ChainRpcError::Transient(format!(
                "rpc call exceeded {}s deadline",
                RPC_CALL_TIMEOUT.as_secs()
            ))),
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_retries => {
                attempt += 1;
                tracing::warn!(error = %e, attempt, "transient rpc error, backing off");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(e) => return Err(e),
        }
    }
}
