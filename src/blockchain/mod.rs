// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! EVM chain integration.
//!
//! This module provides functionality for:
//! - Native and ERC-20 balance reads on the supported chains
//! - EIP-1559 transaction signing and broadcasting
//! - Ephemeral companion-wallet keys
//! - The [`ChainRail`] seam used by the settlement engine

pub mod client;
pub mod erc20;
pub mod rail;
pub mod signing;
pub mod transactions;
pub mod types;

pub use client::{ChainClient, ChainError};
pub use rail::{ChainRail, EvmRail, Swept};
pub use signing::EphemeralKey;
pub use transactions::{format_amount, to_base_units, SendResult, TxBuilder, NATIVE_TRANSFER_GAS};
pub use types::*;
