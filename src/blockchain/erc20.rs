// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! ERC-20 token contract interactions.

use alloy::{
    primitives::{Address, U256},
    providers::Provider,
    sol,
};

use super::client::{parse_address, ChainError};

sol! {
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);
    }
}

/// ERC-20 contract wrapper.
pub struct Erc20Contract<P> {
    contract: IERC20::IERC20Instance<P>,
}

impl<P: Provider + Clone> Erc20Contract<P> {
    pub fn new(provider: &P, contract_address: &str) -> Result<Self, ChainError> {
        let address: Address = parse_address(contract_address)?;
        let contract = IERC20::new(address, provider.clone());
        Ok(Self { contract })
    }

    /// Raw balance of an address.
    pub async fn balance_of(&self, wallet_address: &str) -> Result<U256, ChainError> {
        let addr = parse_address(wallet_address)?;
        self.contract
            .balanceOf(addr)
            .call()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }
}
