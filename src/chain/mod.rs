// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Chain integration: the RPC capability trait and its EVM implementation.

pub mod evm;
pub mod rpc;
pub mod types;

pub use evm::EvmRpc;
pub use rpc::{with_retries, ChainRpc, ChainRpcError, WalletDeriver};
pub use types::{
    avax_fuji, avax_mainnet, ChainConfig, SendResult, TokenContract, TransferEvent, TxConfirmation,
};
