// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Alloy-backed [`ChainRpc`] implementation for EVM chains.
//!
//! Deposit discovery uses two sources per scan window:
//! 1. **ERC-20 transfers**: `eth_getLogs` with the
//!    Transfer(address,address,uint256) topic, filtered to the chain's
//!    configured token contracts.
//! 2. **Native transfers**: full-block traversal over the window, matching
//!    transaction sender/recipient against the watched address set.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use alloy::{
    consensus::Transaction,
    eips::BlockNumberOrTag,
    network::{Ethereum, EthereumWallet, TransactionResponse},
    primitives::{Address, FixedBytes, U256},
    providers::{
        fillers::{BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller},
        Identity, Provider, ProviderBuilder, RootProvider,
    },
    rpc::types::{Filter, TransactionRequest},
    sol,
    sol_types::SolCall,
};

use super::rpc::{ChainRpc, ChainRpcError};
use super::types::{ChainConfig, SendResult, TransferEvent, TxConfirmation};
use crate::models::Amount;

// Minimal ERC-20 surface needed for custody transfers.
sol! {
    interface IERC20 {
        function transfer(address to, uint256 amount) external returns (bool);
    }
}

/// keccak256("Transfer(address,address,uint256)")
const TRANSFER_TOPIC: FixedBytes<32> = FixedBytes::new([
    0xdd, 0xf2, 0x52, 0xad, 0x1b, 0xe2, 0xc8, 0x9b, 0x69, 0xc2, 0xb0, 0x68, 0xfc, 0x37, 0x8d, 0xaa,
    0x95, 0x2b, 0xa7, 0xf1, 0x63, 0xc4, 0xa1, 0x16, 0x28, 0xf5, 0x5a, 0x4d, 0xf5, 0x23, 0xb3, 0xef,
]);

/// HTTP provider type (with all fillers).
type HttpProvider = FillProvider<
    JoinFill<
        Identity,
        JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
    >,
    RootProvider<Ethereum>,
>;

/// HTTP provider type with a signing wallet attached.
type SigningProvider = FillProvider<
    JoinFill<
        JoinFill<
            Identity,
            JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
        >,
        alloy::providers::fillers::WalletFiller<EthereumWallet>,
    >,
    RootProvider<Ethereum>,
>;

/// EVM chain client.
pub struct EvmRpc {
    config: ChainConfig,
    provider: HttpProvider,
    /// Present only when this instance may broadcast.
    signing: Option<SigningProvider>,
}

impl EvmRpc {
    /// Create a read-only client for the given chain.
    pub fn new(config: ChainConfig) -> Result<Self, ChainRpcError> {
        let url: url::Url = config
            .rpc_url
            .parse()
            .map_err(|e: url::ParseError| ChainRpcError::InvalidRpcUrl(e.to_string()))?;

        let provider = ProviderBuilder::new().connect_http(url);

        Ok(Self {
            config,
            provider,
            signing: None,
        })
    }

    /// Create a client that can also broadcast, signing with `wallet`.
    pub fn with_wallet(config: ChainConfig, wallet: EthereumWallet) -> Result<Self, ChainRpcError> {
        let url: url::Url = config
            .rpc_url
            .parse()
            .map_err(|e: url::ParseError| ChainRpcError::InvalidRpcUrl(e.to_string()))?;

        let signing = ProviderBuilder::new()
            .wallet(wallet)
            .connect_http(url.clone());
        let provider = ProviderBuilder::new().connect_http(url);

        Ok(Self {
            config,
            provider,
            signing: Some(signing),
        })
    }

    /// Token metadata by lowercase contract address.
    fn token_by_contract(&self) -> HashMap<String, &super::types::TokenContract> {
        self.config
            .token_contracts
            .iter()
            .map(|t| (t.contract_address.to_lowercase(), t))
            .collect()
    }

    /// ERC-20 Transfer events over the window touching a watched address.
    async fn erc20_transfers(
        &self,
        from_block: u64,
        to_block: u64,
        watched: &HashSet<String>,
    ) -> Result<Vec<TransferEvent>, ChainRpcError> {
        let tokens = self.token_by_contract();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let addresses: Vec<Address> = tokens
            .keys()
            .filter_map(|a| a.parse::<Address>().ok())
            .collect();

        let filter = Filter::new()
            .address(addresses)
            .event_signature(TRANSFER_TOPIC)
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| ChainRpcError::Transient(e.to_string()))?;

        let mut events = Vec::new();
        for log in &logs {
            // Transfer has 3 topics: [event_sig, from, to] and data = value
            if log.topics().len() < 3 {
                continue;
            }

            let from_addr = format!("0x{}", alloy::hex::encode(&log.topics()[1][12..]));
            let to_addr = format!("0x{}", alloy::hex::encode(&log.topics()[2][12..]));

            if !watched.contains(&from_addr) && !watched.contains(&to_addr) {
                continue;
            }

            let value = if log.data().data.len() >= 32 {
                U256::from_be_slice(&log.data().data[..32])
            } else {
                U256::ZERO
            };

            let Some(token) = tokens.get(&log.address().to_string().to_lowercase()) else {
                continue;
            };

            let Some(tx_hash) = log.transaction_hash.map(|h| format!("{h:#x}")) else {
                continue;
            };
            let Some(block_number) = log.block_number else {
                continue;
            };

            events.push(TransferEvent {
                tx_hash,
                from: from_addr,
                to: to_addr,
                amount: to_minor_units(value),
                currency: token.currency.clone(),
                block_number,
            });
        }

        Ok(events)
    }

    /// Native-coin transfers over the window touching a watched address.
    async fn native_transfers(
        &self,
        from_block: u64,
        to_block: u64,
        watched: &HashSet<String>,
    ) -> Result<Vec<TransferEvent>, ChainRpcError> {
        let mut events = Vec::new();

        for number in from_block..=to_block {
            let block = self
                .provider
                .get_block_by_number(BlockNumberOrTag::Number(number))
                .full()
                .await
                .map_err(|e| ChainRpcError::Transient(e.to_string()))?;

            let Some(block) = block else { continue };

            for tx in block.transactions.txns() {
                let value = tx.value();
                if value.is_zero() {
                    continue;
                }
                let Some(to) = tx.to() else { continue };

                let from_addr = format!("{:#x}", tx.from());
                let to_addr = format!("{to:#x}");

                if !watched.contains(&from_addr) && !watched.contains(&to_addr) {
                    continue;
                }

                events.push(TransferEvent {
                    tx_hash: format!("{:#x}", tx.tx_hash()),
                    from: from_addr,
                    to: to_addr,
                    amount: to_minor_units(value),
                    currency: self.config.native_currency.clone(),
                    block_number: number,
                });
            }
        }

        Ok(events)
    }

    fn signing_provider(&self) -> Result<&SigningProvider, ChainRpcError> {
        self.signing
            .as_ref()
            .ok_or_else(|| ChainRpcError::Broadcast("no signing wallet configured".to_string()))
    }
}

#[async_trait::async_trait]
impl ChainRpc for EvmRpc {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    async fn head_block(&self) -> Result<u64, ChainRpcError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| ChainRpcError::Transient(e.to_string()))
    }

    async fn transfers_in_range(
        &self,
        from_block: u64,
        to_block: u64,
        watched: &HashSet<String>,
    ) -> Result<Vec<TransferEvent>, ChainRpcError> {
        let mut events = self.erc20_transfers(from_block, to_block, watched).await?;
        events.extend(self.native_transfers(from_block, to_block, watched).await?);
        Ok(events)
    }

    async fn confirmations(&self, tx_hash: &str) -> Result<Option<TxConfirmation>, ChainRpcError> {
        let hash = tx_hash
            .parse()
            .map_err(|e| ChainRpcError::InvalidAddress(format!("invalid tx hash: {e}")))?;

        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| ChainRpcError::Transient(e.to_string()))?;

        let Some(receipt) = receipt else {
            return Ok(None);
        };
        let Some(block_number) = receipt.block_number else {
            return Ok(None);
        };

        let head = self.head_block().await?;

        Ok(Some(TxConfirmation {
            block_number,
            confirmations: head.saturating_sub(block_number) + 1,
            success: receipt.status(),
        }))
    }

    async fn broadcast_transfer(
        &self,
        to: &str,
        amount: Amount,
        currency: &str,
    ) -> Result<SendResult, ChainRpcError> {
        let provider = self.signing_provider()?;

        let to_addr = Address::from_str(to)
            .map_err(|e| ChainRpcError::InvalidAddress(format!("invalid to address: {e}")))?;

        let tx = if currency == self.config.native_currency {
            TransactionRequest::default()
                .to(to_addr)
                .value(U256::from(amount))
        } else {
            let token = self
                .config
                .token_contracts
                .iter()
                .find(|t| t.currency == currency)
                .ok_or_else(|| {
                    ChainRpcError::Broadcast(format!(
                        "no token contract for {currency} on {}",
                        self.config.key
                    ))
                })?;
            let token_addr = Address::from_str(&token.contract_address)
                .map_err(|e| ChainRpcError::InvalidAddress(format!("invalid token address: {e}")))?;

            let call = IERC20::transferCall {
                to: to_addr,
                amount: U256::from(amount),
            };
            TransactionRequest::default()
                .to(token_addr)
                .input(call.abi_encode().into())
        };

        let pending = provider
            .send_transaction(tx)
            .await
            .map_err(|e| ChainRpcError::Broadcast(e.to_string()))?;

        let tx_hash = format!("{:#x}", pending.tx_hash());
        let explorer_url = format!("{}/tx/{}", self.config.explorer_url, tx_hash);

        Ok(SendResult {
            tx_hash,
            explorer_url,
        })
    }

    async fn address_balance(&self, address: &str) -> Result<Amount, ChainRpcError> {
        let addr = Address::from_str(address)
            .map_err(|e| ChainRpcError::InvalidAddress(e.to_string()))?;

        let balance = self
            .provider
            .get_balance(addr)
            .await
            .map_err(|e| ChainRpcError::Transient(e.to_string()))?;

        Ok(to_minor_units(balance))
    }
}

/// Clamp a U256 value into the engine's u128 minor-unit type.
fn to_minor_units(value: U256) -> Amount {
    u128::try_from(value).unwrap_or(u128::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_topic_is_correct() {
        // keccak256("Transfer(address,address,uint256)")
        let expected = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
        let actual = format!("0x{}", alloy::hex::encode(TRANSFER_TOPIC.as_slice()));
        assert_eq!(actual, expected);
    }

    #[test]
    fn minor_units_clamps_overflow() {
        assert_eq!(to_minor_units(U256::from(42u64)), 42);
        assert_eq!(to_minor_units(U256::MAX), u128::MAX);
    }

    #[test]
    fn read_only_client_refuses_broadcast() {
        let rpc = EvmRpc::new(super::super::types::avax_fuji("0xcustody")).unwrap();
        assert!(rpc.signing_provider().is_err());
    }
}
