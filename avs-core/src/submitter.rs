//! Task submission on behalf of the AI identity.

use crate::crypto::{content_hash, Signer};
use crate::error::AvsError;
use crate::ledger::{Ledger, LedgerError};
use crate::types::{Hash256, SignatureBytes, Task, TaskIndex, TxHash};
use std::sync::Arc;
use std::time::Duration;

/// Default wait for `createNewTask` inclusion.
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(120);

/// A task accepted by the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTask {
    pub hash_before_sign: Hash256,
    pub signature: SignatureBytes,
    pub tx_hash: TxHash,
    /// Index assigned by the ledger, when the receipt carried it
    pub task_index: Option<TaskIndex>,
}

/// Hashes content, signs it with the AI key and submits `createNewTask`.
pub struct TaskSubmitter {
    ledger: Arc<dyn Ledger>,
    signer: Signer,
    confirmation_timeout: Duration,
}

impl TaskSubmitter {
    pub fn new(ledger: Arc<dyn Ledger>, signer: Signer) -> Self {
        Self {
            ledger,
            signer,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
        }
    }

    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    /// Build the signed task for `content` without submitting it.
    pub fn prepare(&self, content: &str) -> Result<Task, AvsError> {
        let hash_before_sign = content_hash(content);
        let signature = self.signer.sign(&hash_before_sign)?;
        Ok(Task::new(hash_before_sign, signature))
    }

    /// Submit a task for `content` and wait for inclusion.
    ///
    /// Failures are surfaced, never retried.
    pub async fn submit_task(&self, content: &str) -> Result<SubmittedTask, AvsError> {
        let task = self.prepare(content)?;

        tracing::info!(
            hash = %hex::encode(task.hash_before_sign),
            signer = ?self.signer.address(),
            "Submitting task to {} ledger",
            self.ledger.name()
        );

        let receipt = tokio::time::timeout(self.confirmation_timeout, self.ledger.create_new_task(&task))
            .await
            .map_err(|_| LedgerError::Timeout(self.confirmation_timeout))
            .and_then(|result| result)
            .map_err(|e| {
                tracing::error!(
                    hash = %hex::encode(task.hash_before_sign),
                    signature = %task.signature,
                    "Task submission failed: {}",
                    e
                );
                AvsError::Submission(e)
            })?;

        tracing::info!(
            tx = ?receipt.tx_hash,
            task_index = ?receipt.task_index,
            block = ?receipt.block_number,
            "Task created"
        );

        Ok(SubmittedTask {
            hash_before_sign: task.hash_before_sign,
            signature: task.signature,
            tx_hash: receipt.tx_hash,
            task_index: receipt.task_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::verifier::verify;

    #[tokio::test]
    async fn test_submit_task() {
        let ai = Signer::random();
        let ledger = Arc::new(MemoryLedger::new(ai.address()));
        let submitter = TaskSubmitter::new(ledger.clone(), ai.clone());

        let submitted = submitter.submit_task("hello").await.unwrap();

        assert_eq!(submitted.hash_before_sign, content_hash("hello"));
        assert_eq!(submitted.task_index, Some(0));
        assert!(verify(
            &submitted.hash_before_sign,
            submitted.signature.as_slice(),
            ai.address()
        ));

        let stored = ledger.task(0).unwrap();
        assert_eq!(stored.hash_before_sign, submitted.hash_before_sign);
        assert_eq!(stored.signature, submitted.signature);
    }

    #[tokio::test]
    async fn test_reverted_submission() {
        let ai = Signer::random();
        let ledger = Arc::new(MemoryLedger::new(ai.address()));
        ledger.set_reverting(true);

        let submitter = TaskSubmitter::new(ledger.clone(), ai);
        let result = submitter.submit_task("hello").await;

        assert!(matches!(
            result,
            Err(AvsError::Submission(LedgerError::Reverted(_)))
        ));
        assert_eq!(ledger.task_count(), 0);
    }

    #[test]
    fn test_prepare_is_deterministic_in_hash() {
        let ai = Signer::random();
        let ledger = Arc::new(MemoryLedger::new(ai.address()));
        let submitter = TaskSubmitter::new(ledger, ai);

        let a = submitter.prepare("same content").unwrap();
        let b = submitter.prepare("same content").unwrap();
        assert_eq!(a.hash_before_sign, b.hash_before_sign);
    }
}
