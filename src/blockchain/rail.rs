// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Chain access used by the companion wallet manager.

use alloy::primitives::{Bytes, U256};
use async_trait::async_trait;

use super::client::{ChainClient, ChainError};
use super::signing::EphemeralKey;
use super::transactions::TxBuilder;
use super::types::{ChainConfig, ChainRegistry, PreparedTransaction};
use crate::storage::TokenRef;

/// Result of draining an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Swept {
    /// Nothing worth moving was left.
    Empty,
    Sent { tx_hash: String, amount: U256 },
}

/// Balance reads and signed sends on supported chains.
#[async_trait]
pub trait ChainRail: Send + Sync {
    /// Balance of `owner` in `token`'s smallest unit.
    async fn balance(&self, chain_id: u64, token: &TokenRef, owner: &str)
        -> Result<U256, ChainError>;

    /// Transfer `amount` of `token` from the key's address. Returns the tx hash.
    async fn transfer(
        &self,
        chain_id: u64,
        key: &EphemeralKey,
        token: &TokenRef,
        to: &str,
        amount: U256,
    ) -> Result<String, ChainError>;

    /// Sign and broadcast a provider-prepared transaction. Returns the tx hash.
    async fn send_prepared(
        &self,
        chain_id: u64,
        key: &EphemeralKey,
        tx: &PreparedTransaction,
    ) -> Result<String, ChainError>;

    /// Move the key's whole `token` balance to `to`. A native sweep keeps back
    /// the fee of the sweep itself.
    async fn sweep(
        &self,
        chain_id: u64,
        key: &EphemeralKey,
        token: &TokenRef,
        to: &str,
    ) -> Result<Swept, ChainError>;
}

/// JSON-RPC rail over the chain registry.
pub struct EvmRail {
    registry: ChainRegistry,
}

impl EvmRail {
    pub fn new(registry: ChainRegistry) -> Self {
        Self { registry }
    }

    fn endpoint(&self, chain_id: u64) -> Result<(&'static ChainConfig, String), ChainError> {
        let chain = self
            .registry
            .chain(chain_id)
            .ok_or(ChainError::UnsupportedChain(chain_id))?;
        let rpc_url = self
            .registry
            .rpc_url(chain_id)
            .ok_or(ChainError::UnsupportedChain(chain_id))?;
        Ok((chain, rpc_url))
    }

    fn tx_builder(&self, chain_id: u64, key: &EphemeralKey) -> Result<TxBuilder, ChainError> {
        let (chain, rpc_url) = self.endpoint(chain_id)?;
        TxBuilder::new(chain, &rpc_url, key.wallet())
    }
}

#[async_trait]
impl ChainRail for EvmRail {
    async fn balance(
        &self,
        chain_id: u64,
        token: &TokenRef,
        owner: &str,
    ) -> Result<U256, ChainError> {
        let (chain, rpc_url) = self.endpoint(chain_id)?;
        let client = ChainClient::new(chain, &rpc_url)?;
        match &token.address {
            None => client.get_native_balance(owner).await,
            Some(contract) => client.get_token_balance(owner, contract).await,
        }
    }

    async fn transfer(
        &self,
        chain_id: u64,
        key: &EphemeralKey,
        token: &TokenRef,
        to: &str,
        amount: U256,
    ) -> Result<String, ChainError> {
        let builder = self.tx_builder(chain_id, key)?;
        let result = match &token.address {
            None => builder.send_native(to, amount).await?,
            Some(contract) => builder.send_token(to, contract, amount).await?,
        };
        tracing::info!(
            chain_id,
            token = %token.symbol,
            tx_hash = %result.tx_hash,
            explorer_url = %result.explorer_url,
            "Transfer confirmed"
        );
        Ok(result.tx_hash)
    }

    async fn send_prepared(
        &self,
        chain_id: u64,
        key: &EphemeralKey,
        tx: &PreparedTransaction,
    ) -> Result<String, ChainError> {
        let data = decode_calldata(&tx.data)?;
        let value: U256 = tx
            .value
            .parse()
            .map_err(|e| ChainError::TransactionFailed(format!("Invalid value {}: {e}", tx.value)))?;

        let builder = self.tx_builder(chain_id, key)?;
        let result = builder.send_call(&tx.to, data, value, tx.gas_limit).await?;
        tracing::info!(
            chain_id,
            tx_hash = %result.tx_hash,
            block_number = result.block_number,
            "Prepared transaction confirmed"
        );
        Ok(result.tx_hash)
    }

    async fn sweep(
        &self,
        chain_id: u64,
        key: &EphemeralKey,
        token: &TokenRef,
        to: &str,
    ) -> Result<Swept, ChainError> {
        let owner = key.address_string();
        let builder = self.tx_builder(chain_id, key)?;
        let sent = match &token.address {
            None => builder.sweep_native(&owner, to).await?,
            Some(contract) => {
                let balance = self.balance(chain_id, token, &owner).await?;
                if balance.is_zero() {
                    None
                } else {
                    Some((builder.send_token(to, contract, balance).await?, balance))
                }
            }
        };
        let Some((result, amount)) = sent else {
            return Ok(Swept::Empty);
        };
        tracing::info!(
            chain_id,
            token = %token.symbol,
            amount = %amount,
            tx_hash = %result.tx_hash,
            "Residual balance swept"
        );
        Ok(Swept::Sent {
            tx_hash: result.tx_hash,
            amount,
        })
    }
}

fn decode_calldata(data: &str) -> Result<Bytes, ChainError> {
    if data.is_empty() {
        return Ok(Bytes::new());
    }
    alloy::hex::decode(data)
        .map(Bytes::from)
        .map_err(|e| ChainError::TransactionFailed(format!("Invalid calldata: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calldata_accepts_prefixed_and_empty() {
        assert_eq!(decode_calldata("0x1234").unwrap().as_ref(), &[0x12, 0x34]);
        assert!(decode_calldata("").unwrap().is_empty());
        assert!(decode_calldata("0xzz").is_err());
    }

    #[tokio::test]
    async fn unknown_chain_is_rejected_before_any_rpc() {
        let rail = EvmRail::new(ChainRegistry::default());
        let token = TokenRef {
            symbol: "ETH".to_string(),
            address: None,
            decimals: 18,
        };
        let result = rail
            .balance(999, &token, "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913")
            .await;
        assert!(matches!(result, Err(ChainError::UnsupportedChain(999))));
    }
}
