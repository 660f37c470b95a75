//! Operator attestations over task verdicts.
//!
//! An attestation binds one operator identity to one boolean verdict for one
//! task hash. The signed message is
//! `keccak256(abi.encode(bool isVerified, bytes32 hashBeforeSign))`, signed
//! with the personal-message scheme.

use crate::crypto::{keccak256, recover_address, KeyError, Signer};
use crate::types::{Address, Hash256, SignatureBytes, Task, TaskIndex, Verdict};
use ethers::abi::Token;
use serde::{Deserialize, Serialize};

/// Build the attestation message for a verdict on `hash_before_sign`.
pub fn attestation_message(is_verified: bool, hash_before_sign: &Hash256) -> Hash256 {
    let encoded = ethers::abi::encode(&[
        Token::Bool(is_verified),
        Token::FixedBytes(hash_before_sign.to_vec()),
    ]);
    keccak256(&encoded)
}

/// A signed response to a task, ready for `respondToTask`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResponse {
    /// Index of the task being answered
    pub task_index: TaskIndex,

    /// The exact `(hashBeforeSign, signature)` tuple from the ledger
    pub task: Task,

    /// Operator verdict
    pub verdict: Verdict,

    /// Operator signature over the attestation message
    pub operator_signature: SignatureBytes,
}

impl TaskResponse {
    /// Sign a verdict on `task` with the operator key.
    pub fn sign(
        task: Task,
        task_index: TaskIndex,
        is_verified: bool,
        operator: &Signer,
    ) -> Result<Self, KeyError> {
        let message = attestation_message(is_verified, &task.hash_before_sign);
        let operator_signature = operator.sign(&message)?;

        Ok(Self {
            task_index,
            task,
            verdict: Verdict::from(is_verified),
            operator_signature,
        })
    }

    pub fn is_verified(&self) -> bool {
        self.verdict.is_verified()
    }

    /// The free-text response string sent on-chain.
    pub fn response_text(&self) -> String {
        self.verdict.to_string()
    }

    /// The message the operator signature covers.
    pub fn message(&self) -> Hash256 {
        attestation_message(self.is_verified(), &self.task.hash_before_sign)
    }

    /// Address that produced the attestation signature.
    pub fn operator(&self) -> Result<Address, KeyError> {
        recover_address(&self.message(), self.operator_signature.as_slice())
    }

    /// Check that `operator` produced the attestation signature.
    pub fn verify_operator(&self, operator: Address) -> bool {
        self.operator()
            .map(|recovered| recovered == operator)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::content_hash;

    fn create_test_task(ai: &Signer) -> Task {
        let hash = content_hash("hello");
        Task::new(hash, ai.sign(&hash).unwrap())
    }

    #[test]
    fn test_attestation_message_encoding() {
        let hash = [7u8; 32];

        let mut expected = vec![0u8; 64];
        expected[31] = 1;
        expected[32..].copy_from_slice(&hash);

        assert_eq!(attestation_message(true, &hash), keccak256(&expected));
        assert_ne!(attestation_message(true, &hash), attestation_message(false, &hash));
    }

    #[test]
    fn test_response_signature_verification() {
        let ai = Signer::random();
        let operator = Signer::random();
        let task = create_test_task(&ai);

        let response = TaskResponse::sign(task.clone(), 4, true, &operator).unwrap();

        assert_eq!(response.task, task);
        assert_eq!(response.task_index, 4);
        assert_eq!(response.response_text(), "Verified");
        assert!(response.verify_operator(operator.address()));
        assert!(!response.verify_operator(ai.address()));
        assert_eq!(response.operator().unwrap(), operator.address());
    }

    #[test]
    fn test_verdict_is_bound_to_signature() {
        let operator = Signer::random();
        let task = create_test_task(&Signer::random());

        let mut response = TaskResponse::sign(task, 0, false, &operator).unwrap();
        assert_eq!(response.response_text(), "Not Verified");
        assert!(response.verify_operator(operator.address()));

        // Flipping the verdict invalidates the attestation
        response.verdict = Verdict::Verified;
        assert!(!response.verify_operator(operator.address()));
    }
}
