// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Ephemeral signing keys for companion wallets.
//!
//! Keys are secp256k1, persisted as PKCS#8 PEM. The wrapper never prints key
//! material: `Debug` shows only the derived address, and the inner
//! `SigningKey` zeroizes its scalar when dropped.

use std::fmt;

use alloy::{network::EthereumWallet, primitives::Address, signers::local::PrivateKeySigner};
use k256::ecdsa::SigningKey;
use k256::elliptic_curve::rand_core::OsRng;
use k256::elliptic_curve::zeroize::Zeroizing;
use k256::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use k256::SecretKey;

use super::client::ChainError;

/// Secret secp256k1 key owned by a single companion session.
pub struct EphemeralKey {
    key: SigningKey,
    address: Address,
}

impl EphemeralKey {
    /// Fresh random key.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    fn from_signing_key(key: SigningKey) -> Self {
        let address = PrivateKeySigner::from_signing_key(key.clone()).address();
        Self { key, address }
    }

    /// Parse a PKCS#8 (or SEC1) PEM key.
    pub fn from_pem(pem_bytes: &[u8]) -> Result<Self, ChainError> {
        let pem_str = std::str::from_utf8(pem_bytes)
            .map_err(|e| ChainError::InvalidPrivateKey(format!("Invalid UTF-8: {e}")))?;
        let pem = pem::parse(pem_str)
            .map_err(|e| ChainError::InvalidPrivateKey(format!("Invalid PEM: {e}")))?;

        let key = SigningKey::from_pkcs8_der(pem.contents())
            .or_else(|_| SecretKey::from_sec1_der(pem.contents()).map(SigningKey::from))
            .map_err(|e| ChainError::InvalidPrivateKey(format!("Invalid key format: {e}")))?;

        Ok(Self::from_signing_key(key))
    }

    /// PKCS#8 PEM encoding; the buffer is wiped on drop.
    pub fn to_pem(&self) -> Result<Zeroizing<String>, ChainError> {
        self.key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| ChainError::InvalidPrivateKey(format!("Failed to encode key: {e}")))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// EIP-55 checksummed address.
    pub fn address_string(&self) -> String {
        self.address.to_checksum(None)
    }

    pub fn signer(&self) -> PrivateKeySigner {
        PrivateKeySigner::from_signing_key(self.key.clone())
    }

    pub fn wallet(&self) -> EthereumWallet {
        EthereumWallet::from(self.signer())
    }
}

impl fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKey")
            .field("address", &self.address)
            .field("key", &"<redacted>")
            .finish()
    }
}
