//! Cryptographic primitives: keccak hashing and EIP-191 personal-message
//! signing with secp256k1 recoverable signatures.

use crate::types::{Address, Hash256, SignatureBytes};
use ethers::signers::{LocalWallet, Signer as _};
use ethers::types::{Signature, H256};
use std::fmt;
use thiserror::Error;

/// Errors raised by key handling, signing and recovery.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("No private key configured for {0}")]
    Missing(&'static str),

    #[error("Invalid private key: {0}")]
    Invalid(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Malformed signature: {0}")]
    MalformedSignature(String),
}

/// Compute keccak-256 hash of data.
pub fn keccak256(data: &[u8]) -> Hash256 {
    ethers::utils::keccak256(data)
}

/// Hash application content into a task's `hashBeforeSign`.
pub fn content_hash(content: &str) -> Hash256 {
    keccak256(content.as_bytes())
}

/// EIP-191 personal-message digest:
/// `keccak256("\x19Ethereum Signed Message:\n" ‖ len(message) ‖ message)`.
pub fn personal_message_hash(message: &[u8]) -> Hash256 {
    ethers::utils::hash_message(message).0
}

/// Recover the address that signed `message` with the personal-message scheme.
pub fn recover_address(message: &[u8], signature: &[u8]) -> Result<Address, KeyError> {
    let signature = Signature::try_from(signature)
        .map_err(|e| KeyError::MalformedSignature(e.to_string()))?;
    let digest = H256(personal_message_hash(message));

    signature
        .recover(digest)
        .map_err(|e| KeyError::MalformedSignature(e.to_string()))
}

/// A signer holding one secp256k1 private key.
#[derive(Clone)]
pub struct Signer {
    wallet: LocalWallet,
}

impl Signer {
    /// Create a new signer from a wallet.
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }

    /// Parse a hex-encoded private key (with or without `0x`).
    pub fn from_hex(key: &str) -> Result<Self, KeyError> {
        let key = key.trim();
        let key = key.strip_prefix("0x").unwrap_or(key);
        let wallet = key
            .parse::<LocalWallet>()
            .map_err(|e| KeyError::Invalid(e.to_string()))?;
        Ok(Self { wallet })
    }

    /// Build a signer for `role` from optional key material.
    pub fn from_optional_key(role: &'static str, key: Option<&str>) -> Result<Self, KeyError> {
        match key {
            Some(key) if !key.trim().is_empty() => Self::from_hex(key),
            _ => Err(KeyError::Missing(role)),
        }
    }

    /// Generate a new random key.
    pub fn random() -> Self {
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        Self { wallet }
    }

    /// Sign `message` with the personal-message scheme.
    pub fn sign(&self, message: &[u8]) -> Result<SignatureBytes, KeyError> {
        let digest = H256(personal_message_hash(message));
        let signature = self
            .wallet
            .sign_hash(digest)
            .map_err(|e| KeyError::Signing(e.to_string()))?;
        Ok(SignatureBytes(signature.to_vec()))
    }

    /// Address derived from the public key.
    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Get the wallet (use with caution).
    pub fn wallet(&self) -> &LocalWallet {
        &self.wallet
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}
