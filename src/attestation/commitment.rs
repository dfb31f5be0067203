// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Hash commitment over a paid claim.
//!
//! The preimage is the newline-joined sequence
//!
//! ```text
//! claim_id \n execution_ref \n amount \n token_symbol \n token_chain \n recipient \n nonce_hex
//! ```
//!
//! with an empty line when there is no recipient. Anyone holding the claim
//! fields and the nonce can recompute the SHA-256 digest and compare it with
//! the value recorded on-chain.

use alloy::primitives::B256;
use k256::elliptic_curve::rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::storage::StoredClaim;

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 32;

/// Off-chain claim fields bound by a commitment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentInput<'a> {
    pub claim_id: &'a str,
    pub execution_ref: &'a str,
    pub amount: &'a str,
    pub token_symbol: &'a str,
    pub token_chain: &'a str,
    pub recipient: Option<&'a str>,
}

impl<'a> CommitmentInput<'a> {
    pub fn from_claim(claim: &'a StoredClaim, execution_ref: &'a str) -> Self {
        Self {
            claim_id: &claim.id,
            execution_ref,
            amount: &claim.amount,
            token_symbol: &claim.token_symbol,
            token_chain: &claim.token_chain,
            recipient: Some(claim.recipient_address.as_str()).filter(|r| !r.is_empty()),
        }
    }

    pub fn preimage(&self, nonce_hex: &str) -> String {
        [
            self.claim_id,
            self.execution_ref,
            self.amount,
            self.token_symbol,
            self.token_chain,
            self.recipient.unwrap_or(""),
            nonce_hex,
        ]
        .join("\n")
    }

    pub fn commit(&self, nonce_hex: &str) -> B256 {
        let digest = Sha256::digest(self.preimage(nonce_hex).as_bytes());
        B256::from_slice(&digest)
    }

    /// True iff `commitment` is the digest of this input and nonce.
    pub fn verify(&self, nonce_hex: &str, commitment: &B256) -> bool {
        self.commit(nonce_hex) == *commitment
    }
}

/// Fresh random nonce, lowercase hex without prefix.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut bytes);
    alloy::hex::encode(bytes)
}

/// Whether `nonce_hex` looks like a nonce produced by [`generate_nonce`].
pub fn is_valid_nonce(nonce_hex: &str) -> bool {
    nonce_hex.len() == NONCE_LEN * 2
        && alloy::hex::decode(nonce_hex).is_ok_and(|bytes| bytes.len() == NONCE_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(recipient: Option<&'static str>) -> CommitmentInput<'static> {
        CommitmentInput {
            claim_id: "claim-1",
            execution_ref: "0xexec",
            amount: "100",
            token_symbol: "USDC",
            token_chain: "base",
            recipient,
        }
    }

    fn nonce() -> String {
        "ab".repeat(32)
    }

    #[test]
    fn digest_matches_reference_vector() {
        let commitment = input(Some("0x1111111111111111111111111111111111111111")).commit(&nonce());
        assert_eq!(
            alloy::hex::encode(commitment),
            "cc850c0f48639ae4a7f0aace0843e889d31dcba774bb4d27d710dd0e7af020c4"
        );
    }

    #[test]
    fn missing_recipient_is_an_empty_line() {
        let input = input(None);
        assert_eq!(
            input.preimage("n"),
            "claim-1\n0xexec\n100\nUSDC\nbase\n\nn"
        );
        assert_eq!(
            alloy::hex::encode(input.commit(&nonce())),
            "3e7f0ab86b452d11cdf20a02647018db8673728f32bac03b133ed4a59fbdee5a"
        );
    }

    #[test]
    fn verify_accepts_only_the_matching_digest() {
        let input = input(Some("0xabc"));
        let nonce = nonce();
        let commitment = input.commit(&nonce);
        assert!(input.verify(&nonce, &commitment));

        let mut tampered = input.clone();
        tampered.amount = "101";
        assert!(!tampered.verify(&nonce, &commitment));
        assert!(!input.verify(&"cd".repeat(32), &commitment));
    }

    #[test]
    fn nonces_are_fresh_and_well_formed() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_ne!(a, b);
        assert!(is_valid_nonce(&a));
        assert!(!is_valid_nonce("abc"));
        assert!(!is_valid_nonce(&"zz".repeat(32)));
    }

    #[test]
    fn from_claim_uses_recipient_address() {
        let claim = StoredClaim::new_open(
            "c-9".to_string(),
            "100.00".to_string(),
            "USDC".to_string(),
            "base".to_string(),
            "0xrecipient".to_string(),
            false,
        );
        let input = CommitmentInput::from_claim(&claim, "0xtx");
        assert_eq!(input.recipient, Some("0xrecipient"));
        assert_eq!(input.amount, "100.00");
    }
}
