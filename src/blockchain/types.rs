// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Chain and token registry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::storage::TokenRef;

/// EVM network configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    /// Short name used in claims (`base`, `ethereum`, ...).
    pub name: &'static str,
    pub chain_id: u64,
    /// Default public RPC endpoint.
    pub rpc_url: &'static str,
    pub explorer_url: &'static str,
    pub native_symbol: &'static str,
    /// Circle USDC contract, when deployed on the chain.
    pub usdc_address: Option<&'static str>,
}

pub const ETHEREUM: ChainConfig = ChainConfig {
    name: "ethereum",
    chain_id: 1,
    rpc_url: "https://eth.llamarpc.com",
    explorer_url: "https://etherscan.io",
    native_symbol: "ETH",
    usdc_address: Some("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
};

pub const BASE: ChainConfig = ChainConfig {
    name: "base",
    chain_id: 8453,
    rpc_url: "https://mainnet.base.org",
    explorer_url: "https://basescan.org",
    native_symbol: "ETH",
    usdc_address: Some("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
};

pub const ARBITRUM: ChainConfig = ChainConfig {
    name: "arbitrum",
    chain_id: 42161,
    rpc_url: "https://arb1.arbitrum.io/rpc",
    explorer_url: "https://arbiscan.io",
    native_symbol: "ETH",
    usdc_address: Some("0xaf88d065e77c8cC2239327C5EDb3A432268e5831"),
};

pub const AVALANCHE: ChainConfig = ChainConfig {
    name: "avalanche",
    chain_id: 43114,
    rpc_url: "https://api.avax.network/ext/bc/C/rpc",
    explorer_url: "https://snowtrace.io",
    native_symbol: "AVAX",
    usdc_address: Some("0xB97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E"),
};

pub const FUJI: ChainConfig = ChainConfig {
    name: "fuji",
    chain_id: 43113,
    rpc_url: "https://api.avax-test.network/ext/bc/C/rpc",
    explorer_url: "https://testnet.snowtrace.io",
    native_symbol: "AVAX",
    usdc_address: Some("0x5425890298aed601595a70AB815c96711a31Bc65"),
};

pub const SUPPORTED_CHAINS: [ChainConfig; 5] = [ETHEREUM, BASE, ARBITRUM, AVALANCHE, FUJI];

pub const NATIVE_DECIMALS: u8 = 18;
pub const USDC_DECIMALS: u8 = 6;

pub fn chain_by_id(chain_id: u64) -> Option<&'static ChainConfig> {
    SUPPORTED_CHAINS.iter().find(|c| c.chain_id == chain_id)
}

pub fn chain_by_name(name: &str) -> Option<&'static ChainConfig> {
    let name = name.trim();
    SUPPORTED_CHAINS
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(name))
}

/// Resolve a token symbol on a chain to a [`TokenRef`].
///
/// Only the native token and USDC are known; other symbols must be given
/// with an explicit contract address by the caller.
pub fn resolve_token(chain: &ChainConfig, symbol: &str) -> Option<TokenRef> {
    if symbol.eq_ignore_ascii_case(chain.native_symbol) {
        return Some(TokenRef {
            symbol: chain.native_symbol.to_string(),
            address: None,
            decimals: NATIVE_DECIMALS,
        });
    }
    if symbol.eq_ignore_ascii_case("USDC") {
        return chain.usdc_address.map(|address| TokenRef {
            symbol: "USDC".to_string(),
            address: Some(address.to_string()),
            decimals: USDC_DECIMALS,
        });
    }
    None
}

/// RPC endpoints with per-chain overrides from `RPC_URL_<CHAIN_ID>`.
#[derive(Debug, Clone, Default)]
pub struct ChainRegistry {
    overrides: HashMap<u64, String>,
}

impl ChainRegistry {
    pub fn new(overrides: HashMap<u64, String>) -> Self {
        Self { overrides }
    }

    pub fn chain(&self, chain_id: u64) -> Option<&'static ChainConfig> {
        chain_by_id(chain_id)
    }

    pub fn rpc_url(&self, chain_id: u64) -> Option<String> {
        self.overrides
            .get(&chain_id)
            .cloned()
            .or_else(|| chain_by_id(chain_id).map(|c| c.rpc_url.to_string()))
    }
}

/// Unsigned transaction prepared by the swap provider for the ephemeral signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PreparedTransaction {
    pub to: String,
    /// Hex calldata (`0x`-prefixed).
    #[serde(default)]
    pub data: String,
    /// Native value in wei, base-10.
    #[serde(default = "zero_value")]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<u64>,
}

fn zero_value() -> String {
    "0".to_string()
}
