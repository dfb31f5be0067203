// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Settlement engine: claim lifecycle, companion wallets and the loops that
//! drive them.

pub mod companion;
pub mod machine;
pub mod orchestrator;
pub mod poller;

pub use companion::{CompanionManager, CreateSessionRequest, SessionAction, SessionCreated};
pub use machine::{ClaimMachine, CreateIntentRequest, IntentAction, NewClaim, SessionOutcome};
pub use orchestrator::{ItemResult, Orchestrator, ProcessReport};
pub use poller::{AttestationSweeper, SettlementPoller};
