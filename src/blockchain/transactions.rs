// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Transaction building and broadcasting.
//!
//! EIP-1559 transactions for native transfers, ERC-20 transfers and
//! arbitrary contract calls (provider-prepared swaps, attestation records),
//! signed by a local wallet.

use alloy::{
    network::EthereumWallet,
    primitives::{Bytes, U256},
    providers::{Provider, ProviderBuilder},
    rpc::types::TransactionRequest,
    sol_types::SolCall,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::client::{parse_address, ChainError};
use super::erc20::IERC20;
use super::types::ChainConfig;

/// Fallback base fee when the latest block carries none.
const DEFAULT_BASE_FEE_WEI: u128 = 1_000_000_000;
/// Priority fee (tip) applied to every transaction.
const DEFAULT_PRIORITY_FEE_WEI: u128 = 1_500_000_000;
/// Gas used by a plain native transfer.
pub const NATIVE_TRANSFER_GAS: u64 = 21_000;

/// Confirmed transaction.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub tx_hash: String,
    pub explorer_url: String,
    pub block_number: u64,
}

type SigningProvider = alloy::providers::fillers::FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::fillers::JoinFill<
            alloy::providers::Identity,
            alloy::providers::fillers::JoinFill<
                alloy::providers::fillers::GasFiller,
                alloy::providers::fillers::JoinFill<
                    alloy::providers::fillers::BlobGasFiller,
                    alloy::providers::fillers::JoinFill<
                        alloy::providers::fillers::NonceFiller,
                        alloy::providers::fillers::ChainIdFiller,
                    >,
                >,
            >,
        >,
        alloy::providers::fillers::WalletFiller<EthereumWallet>,
    >,
    alloy::providers::RootProvider<alloy::network::Ethereum>,
>;

/// Transaction builder with signing capabilities.
pub struct TxBuilder {
    chain: &'static ChainConfig,
    provider: SigningProvider,
}

impl TxBuilder {
    pub fn new(
        chain: &'static ChainConfig,
        rpc_url: &str,
        wallet: EthereumWallet,
    ) -> Result<Self, ChainError> {
        let url: url::Url = rpc_url
            .parse()
            .map_err(|e: url::ParseError| ChainError::InvalidRpcUrl(e.to_string()))?;

        let provider = ProviderBuilder::new().wallet(wallet).connect_http(url);

        Ok(Self { chain, provider })
    }

    /// Current (max fee, priority fee) from the latest block.
    async fn get_gas_prices(&self) -> Result<(u128, u128), ChainError> {
        let block = self
            .provider
            .get_block_by_number(alloy::eips::BlockNumberOrTag::Latest)
            .await
            .map_err(|e| ChainError::Rpc(format!("Failed to get block: {e}")))?
            .ok_or_else(|| ChainError::Rpc("No latest block".to_string()))?;

        let base_fee: u128 = block
            .header
            .base_fee_per_gas
            .map(u128::from)
            .unwrap_or(DEFAULT_BASE_FEE_WEI);

        // Max fee = 2 * base_fee + priority_fee (allows for base fee increase)
        let max_fee = base_fee
            .saturating_mul(2)
            .saturating_add(DEFAULT_PRIORITY_FEE_WEI);

        Ok((max_fee, DEFAULT_PRIORITY_FEE_WEI))
    }

    /// Send native currency.
    pub async fn send_native(&self, to: &str, amount_wei: U256) -> Result<SendResult, ChainError> {
        let tx = TransactionRequest::default()
            .to(parse_address(to)?)
            .value(amount_wei);
        self.send_transaction(tx).await
    }

    /// Send an ERC-20 transfer.
    pub async fn send_token(
        &self,
        to: &str,
        token_address: &str,
        amount: U256,
    ) -> Result<SendResult, ChainError> {
        let call = IERC20::transferCall {
            to: parse_address(to)?,
            amount,
        };
        let tx = TransactionRequest::default()
            .to(parse_address(token_address)?)
            .input(call.abi_encode().into());
        self.send_transaction(tx).await
    }

    /// Send an arbitrary contract call.
    pub async fn send_call(
        &self,
        to: &str,
        data: Bytes,
        value: U256,
        gas_limit: Option<u64>,
    ) -> Result<SendResult, ChainError> {
        let mut tx = TransactionRequest::default()
            .to(parse_address(to)?)
            .input(data.into())
            .value(value);
        if let Some(limit) = gas_limit {
            tx = tx.gas_limit(limit);
        }
        self.send_transaction(tx).await
    }

    /// Send the whole native balance of `from` to `to`, keeping back the
    /// worst-case fee of this transfer.
    ///
    /// Returns the result and the amount sent, or `None` when the balance does
    /// not cover that fee.
    pub async fn sweep_native(
        &self,
        from: &str,
        to: &str,
    ) -> Result<Option<(SendResult, U256)>, ChainError> {
        let balance = self
            .provider
            .get_balance(parse_address(from)?)
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        let (max_fee_per_gas, priority_fee) = self.get_gas_prices().await?;
        let fee = U256::from(NATIVE_TRANSFER_GAS) * U256::from(max_fee_per_gas);
        if balance <= fee {
            return Ok(None);
        }

        let amount = balance - fee;
        let tx = TransactionRequest::default()
            .to(parse_address(to)?)
            .value(amount)
            .gas_limit(NATIVE_TRANSFER_GAS)
            .max_fee_per_gas(max_fee_per_gas)
            .max_priority_fee_per_gas(priority_fee);
        let result = self.broadcast(tx).await?;
        Ok(Some((result, amount)))
    }

    /// Price, sign, broadcast and wait for the receipt.
    async fn send_transaction(&self, tx: TransactionRequest) -> Result<SendResult, ChainError> {
        let (max_fee_per_gas, priority_fee) = self.get_gas_prices().await?;
        let tx = tx
            .max_fee_per_gas(max_fee_per_gas)
            .max_priority_fee_per_gas(priority_fee);
        self.broadcast(tx).await
    }

    /// Broadcast a priced transaction. A reverted transaction is an error.
    async fn broadcast(&self, tx: TransactionRequest) -> Result<SendResult, ChainError> {
        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(|e| ChainError::TransactionFailed(format!("Failed to send: {e}")))?;

        let tx_hash = format!("{:?}", pending.tx_hash());
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| ChainError::Rpc(format!("Failed to get receipt for {tx_hash}: {e}")))?;

        if !receipt.status() {
            return Err(ChainError::TransactionFailed(format!(
                "Transaction {tx_hash} reverted"
            )));
        }

        Ok(SendResult {
            explorer_url: format!("{}/tx/{}", self.chain.explorer_url, tx_hash),
            block_number: receipt.block_number.unwrap_or(0),
            tx_hash,
        })
    }
}

/// Convert a decimal token amount into smallest units, rounding up.
pub fn to_base_units(amount: Decimal, decimals: u8) -> Result<U256, ChainError> {
    if amount.is_sign_negative() {
        return Err(ChainError::TransactionFailed(format!(
            "Negative amount {amount}"
        )));
    }
    let scale = 10u64
        .checked_pow(u32::from(decimals))
        .map(Decimal::from)
        .ok_or_else(|| ChainError::TransactionFailed(format!("Unsupported decimals {decimals}")))?;
    let units = amount
        .checked_mul(scale)
        .map(|v| v.ceil())
        .and_then(|v| v.to_u128())
        .ok_or_else(|| ChainError::TransactionFailed(format!("Amount overflow: {amount}")))?;
    Ok(U256::from(units))
}

/// Format smallest units as a human-readable amount.
pub fn format_amount(amount: U256, decimals: u8) -> String {
    if amount.is_zero() {
        return "0".to_string();
    }

    let divisor = U256::from(10u64).pow(U256::from(decimals));
    let whole = amount / divisor;
    let remainder = amount % divisor;

    if remainder.is_zero() {
        whole.to_string()
    } else {
        let decimal_str = format!("{:0>width$}", remainder, width = decimals as usize);
        let trimmed = decimal_str.trim_end_matches('0');
        if trimmed.is_empty() {
            whole.to_string()
        } else {
            format!("{whole}.{trimmed}")
        }
    }
}
