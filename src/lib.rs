// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Claim Settlement Server - payment-claim settlement orchestrator
//!
//! Drives payment claims from deposit detection through optional
//! companion-wallet conversion to final transfer, then records a
//! privacy-preserving commitment on an attestation ledger.
//!
//! ## Modules
//!
//! - `api` - HTTP operator surface (Axum)
//! - `attestation` - Commitments, ledger binding, recorder and run receipts
//! - `blockchain` - EVM chain access (balances, transfers, ephemeral keys)
//! - `engine` - Claim state machine, companion wallets, orchestration loops
//! - `lock` - TTL-bounded distributed lock
//! - `providers` - Quote/swap provider, status normalization, USD prices
//! - `storage` - JSON document store, work index and audit log

pub mod api;
pub mod attestation;
pub mod blockchain;
pub mod config;
pub mod engine;
pub mod error;
pub mod lock;
pub mod providers;
pub mod state;
pub mod storage;
