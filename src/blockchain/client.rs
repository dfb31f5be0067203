// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Read-only EVM client for balance lookups.

use std::str::FromStr;

use alloy::{
    network::Ethereum,
    primitives::{Address, U256},
    providers::{
        fillers::{BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller},
        Identity, Provider, ProviderBuilder, RootProvider,
    },
};

use super::erc20::Erc20Contract;
use super::types::ChainConfig;
use crate::error::SettlementError;

/// HTTP provider type (with the recommended fillers).
pub(crate) type HttpProvider = FillProvider<
    JoinFill<
        Identity,
        JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
    >,
    RootProvider<Ethereum>,
>;

/// Balance reader for one chain.
pub struct ChainClient {
    chain: &'static ChainConfig,
    provider: HttpProvider,
}

impl ChainClient {
    pub fn new(chain: &'static ChainConfig, rpc_url: &str) -> Result<Self, ChainError> {
        let url: url::Url = rpc_url
            .parse()
            .map_err(|e: url::ParseError| ChainError::InvalidRpcUrl(e.to_string()))?;

        let provider = ProviderBuilder::new().connect_http(url);

        Ok(Self { chain, provider })
    }

    /// Native balance in wei.
    pub async fn get_native_balance(&self, address: &str) -> Result<U256, ChainError> {
        let addr = parse_address(address)?;
        self.provider
            .get_balance(addr)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }

    /// ERC-20 balance in the token's smallest unit.
    pub async fn get_token_balance(
        &self,
        wallet_address: &str,
        token_address: &str,
    ) -> Result<U256, ChainError> {
        let contract = Erc20Contract::new(&self.provider, token_address)?;
        contract.balance_of(wallet_address).await
    }

    pub(crate) fn provider(&self) -> &HttpProvider {
        &self.provider
    }

    pub fn chain(&self) -> &'static ChainConfig {
        self.chain
    }
}

pub(crate) fn parse_address(address: &str) -> Result<Address, ChainError> {
    Address::from_str(address.trim()).map_err(|e| ChainError::InvalidAddress(format!("{address}: {e}")))
}

/// Errors that can occur during chain operations.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("Invalid RPC URL: {0}")]
    InvalidRpcUrl(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Unsupported chain: {0}")]
    UnsupportedChain(u64),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Contract error: {0}")]
    Contract(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),
}

impl From<ChainError> for SettlementError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Rpc(_) => SettlementError::Transient(err.to_string()),
            ChainError::InvalidAddress(_) | ChainError::UnsupportedChain(_) => {
                SettlementError::Validation(err.to_string())
            }
            _ => SettlementError::ExecutionFailed(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::types::BASE;
    use crate::error::ErrorKind;

    #[test]
    fn rejects_malformed_rpc_url() {
        assert!(matches!(
            ChainClient::new(&BASE, "not a url"),
            Err(ChainError::InvalidRpcUrl(_))
        ));
        assert_eq!(
            ChainClient::new(&BASE, BASE.rpc_url).unwrap().chain().chain_id,
            8453
        );
    }

    #[test]
    fn parse_address_trims_and_validates() {
        assert!(parse_address(" 0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913 ").is_ok());
        assert!(matches!(
            parse_address("0x123"),
            Err(ChainError::InvalidAddress(_))
        ));
    }

    #[test]
    fn rpc_failures_are_transient() {
        let err: SettlementError = ChainError::Rpc("timeout".into()).into();
        assert_eq!(err.kind(), ErrorKind::Transient);
        let err: SettlementError = ChainError::TransactionFailed("reverted".into()).into();
        assert_eq!(err.kind(), ErrorKind::ExecutionFailed);
    }
}
