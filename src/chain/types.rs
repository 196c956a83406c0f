// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Chain configuration and transfer types.

use serde::{Deserialize, Serialize};

use crate::models::Amount;

/// An ERC-20 token watched and settled on a chain.
#[derive(Debug, Clone)]
pub struct TokenContract {
    pub contract_address: String,
    pub currency: String,
    pub decimals: u8,
}

/// Static configuration for one supported chain.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Short key used in storage and logs (e.g. "fuji").
    pub key: String,
    /// Network name for display
    pub name: String,
    /// Chain ID
    pub chain_id: u64,
    /// RPC endpoint URL
    pub rpc_url: String,
    /// Block explorer URL
    pub explorer_url: String,
    /// Blocks behind head before a transaction is treated as final.
    pub confirmation_depth: u64,
    /// Native currency symbol.
    pub native_currency: String,
    pub native_decimals: u8,
    /// Token contracts watched for deposits on this chain.
    pub token_contracts: Vec<TokenContract>,
    /// Custody wallet address sweeps consolidate into.
    pub custody_address: String,
}

/// Avalanche Fuji testnet configuration.
pub fn avax_fuji(custody_address: impl Into<String>) -> ChainConfig {
    ChainConfig {
        key: "fuji".to_string(),
        name: "Avalanche Fuji Testnet".to_string(),
        chain_id: 43113,
        rpc_url: "https://api.avax-test.network/ext/bc/C/rpc".to_string(),
        explorer_url: "https://testnet.snowtrace.io".to_string(),
        confirmation_depth: 12,
        native_currency: "AVAX".to_string(),
        native_decimals: 18,
        token_contracts: vec![TokenContract {
            // Circle's test USDC on Fuji
            contract_address: "0x5425890298aed601595a70AB815c96711a31Bc65".to_string(),
            currency: "USDC".to_string(),
            decimals: 6,
        }],
        custody_address: custody_address.into(),
    }
}

/// Avalanche C-Chain mainnet configuration.
pub fn avax_mainnet(custody_address: impl Into<String>) -> ChainConfig {
    ChainConfig {
        key: "avax".to_string(),
        name: "Avalanche C-Chain".to_string(),
        chain_id: 43114,
        rpc_url: "https://api.avax.network/ext/bc/C/rpc".to_string(),
        explorer_url: "https://snowtrace.io".to_string(),
        confirmation_depth: 12,
        native_currency: "AVAX".to_string(),
        native_decimals: 18,
        token_contracts: vec![TokenContract {
            contract_address: "0xB97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E".to_string(),
            currency: "USDC".to_string(),
            decimals: 6,
        }],
        custody_address: custody_address.into(),
    }
}

/// A transfer observed on-chain that touches a watched address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferEvent {
    pub tx_hash: String,
    pub from: String,
    pub to: String,
    /// Value in minor units of `currency`.
    pub amount: Amount,
    pub currency: String,
    pub block_number: u64,
}

/// Result of broadcasting a transfer.
#[derive(Debug, Clone)]
pub struct SendResult {
    /// Transaction hash
    pub tx_hash: String,
    /// Explorer URL for the transaction
    pub explorer_url: String,
}

/// Receipt-level confirmation status for a broadcast transaction.
#[derive(Debug, Clone, Copy)]
pub struct TxConfirmation {
    /// Block the transaction was included in.
    pub block_number: u64,
    /// Blocks between inclusion and the current head, inclusive.
    pub confirmations: u64,
    /// Whether the transaction executed successfully.
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fuji_preset_watches_usdc() {
        let cfg = avax_fuji("0xcustody");
        assert_eq!(cfg.key, "fuji");
        assert_eq!(cfg.chain_id, 43113);
        assert_eq!(cfg.token_contracts.len(), 1);
        assert_eq!(cfg.token_contracts[0].currency, "USDC");
        assert_eq!(cfg.custody_address, "0xcustody");
    }
}
