// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Privacy-preserving payment attestation.
//!
//! Only a SHA-256 commitment, the claim id and the execution reference are
//! ever written to the ledger.

pub mod commitment;
pub mod ledger;
pub mod receipts;
pub mod recorder;

pub use commitment::{generate_nonce, is_valid_nonce, CommitmentInput, NONCE_LEN};
pub use ledger::{
    AttestationLedger, EvmAttestationLedger, InMemoryLedger, LedgerError, PaymentRecord,
    ReceiptRecord,
};
pub use receipts::{ReceiptLogger, RunReceipt, RunReceiptRequest, RunStatus};
pub use recorder::{AttestOutcome, AttestationRecorder, SweepReport, VerificationReport};
