//! Verification of AI signatures on tasks.

use crate::crypto::recover_address;
use crate::ledger::{Ledger, LedgerError};
use crate::types::{Address, Hash256, Task};
use std::sync::Arc;

/// Check that `signature` over `hash_before_sign` was produced by `expected`.
///
/// Recovery uses the personal-message scheme and compares the 20 address
/// bytes. A signature that cannot be recovered is a mismatch, not an error.
pub fn verify(hash_before_sign: &Hash256, signature: &[u8], expected: Address) -> bool {
    match recover_address(hash_before_sign, signature) {
        Ok(recovered) => {
            tracing::debug!(?recovered, ?expected, "Recovered task signer");
            recovered == expected
        }
        Err(e) => {
            tracing::debug!("Signature recovery failed: {}", e);
            false
        }
    }
}

/// Verifies tasks against the AI identity published by the ledger.
pub struct Verifier {
    ledger: Arc<dyn Ledger>,
}

impl Verifier {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    /// Verify `task` against `aiPublicKey()`.
    ///
    /// The expected address is fetched from the ledger on every call; the
    /// registry is the only authority on which address is the AI identity.
    pub async fn verify_task(&self, task: &Task) -> Result<bool, LedgerError> {
        let expected = self.ledger.ai_public_key().await?;
        Ok(verify(&task.hash_before_sign, task.signature.as_slice(), expected))
    }
}
