//! Operator responses: attest, sign and submit `respondToTask` with retries.

use crate::attestation::TaskResponse;
use crate::crypto::Signer;
use crate::error::AvsError;
use crate::ledger::{Ledger, LedgerError};
use crate::submitter::DEFAULT_CONFIRMATION_TIMEOUT;
use crate::types::{Address, Task, TaskIndex, TxHash};
use std::sync::Arc;
use std::time::Duration;

/// Retry policy for response submission.
///
/// Defaults: 3 attempts, 1 s apart, no backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub delay: Duration,
    /// Multiplier applied to the delay after each failed attempt (1.0 = fixed)
    pub backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
            backoff: 1.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.backoff.max(1.0).powi(attempt.saturating_sub(1) as i32);
        self.delay.mul_f64(factor)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Submits signed task responses for one operator.
pub struct ResponseSubmitter {
    ledger: Arc<dyn Ledger>,
    policy: RetryPolicy,
    confirmation_timeout: Duration,
}

impl ResponseSubmitter {
    pub fn new(ledger: Arc<dyn Ledger>, policy: RetryPolicy) -> Self {
        Self {
            ledger,
            policy,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
        }
    }

    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Attest `is_verified` for `task` and submit it.
    ///
    /// Returns the hash of the first successful transaction. After
    /// `max_attempts` failures the last error is returned as
    /// [`AvsError::ResponseSubmission`]. `task_block` is the block the task
    /// was created in, when known.
    pub async fn respond(
        &self,
        task: &Task,
        task_index: TaskIndex,
        is_verified: bool,
        operator: &Signer,
        task_block: Option<u64>,
    ) -> Result<TxHash, AvsError> {
        let response = TaskResponse::sign(task.clone(), task_index, is_verified, operator)?;
        self.submit(&response, task_block).await
    }

    /// Submit an already signed response.
    ///
    /// An attempt that timed out may still be included later, so every retry
    /// first looks for the operator's response on the ledger and returns its
    /// transaction instead of sending a second one.
    pub async fn submit(
        &self,
        response: &TaskResponse,
        task_block: Option<u64>,
    ) -> Result<TxHash, AvsError> {
        let operator = response.operator()?;
        let attempts = self.policy.attempts();
        let mut last_error = LedgerError::Closed;

        for attempt in 1..=attempts {
            let result = if attempt == 1 {
                self.send(response, attempt).await
            } else {
                match self.included_response(response, operator, task_block).await {
                    Ok(Some(tx_hash)) => {
                        tracing::info!(
                            task_index = response.task_index,
                            tx = ?tx_hash,
                            attempt,
                            "Earlier attempt was included; not resubmitting"
                        );
                        return Ok(tx_hash);
                    }
                    Ok(None) => self.send(response, attempt).await,
                    Err(e) => Err(e),
                }
            };

            match result {
                Ok(tx_hash) => {
                    tracing::info!(
                        task_index = response.task_index,
                        tx = ?tx_hash,
                        attempt,
                        "Responded \"{}\"",
                        response.verdict
                    );
                    return Ok(tx_hash);
                }
                Err(e) => {
                    tracing::warn!(
                        task_index = response.task_index,
                        attempt,
                        max_attempts = attempts,
                        "Response submission failed: {}",
                        e
                    );
                    last_error = e;
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.policy.delay_after(attempt)).await;
            }
        }

        tracing::error!(
            task_index = response.task_index,
            hash = %hex::encode(response.task.hash_before_sign),
            operator_signature = %response.operator_signature,
            "Giving up on response after {} attempts: {}",
            attempts,
            last_error
        );

        Err(AvsError::ResponseSubmission {
            attempts,
            source: last_error,
        })
    }

    async fn send(&self, response: &TaskResponse, attempt: u32) -> Result<TxHash, LedgerError> {
        tracing::debug!(
            task_index = response.task_index,
            attempt,
            "Submitting response \"{}\"",
            response.verdict
        );

        tokio::time::timeout(
            self.confirmation_timeout,
            self.ledger.respond_to_task(response),
        )
        .await
        .map_err(|_| LedgerError::Timeout(self.confirmation_timeout))?
    }

    async fn included_response(
        &self,
        response: &TaskResponse,
        operator: Address,
        task_block: Option<u64>,
    ) -> Result<Option<TxHash>, LedgerError> {
        tokio::time::timeout(
            self.confirmation_timeout,
            self.ledger.find_response(response.task_index, operator, task_block),
        )
        .await
        .map_err(|_| LedgerError::Timeout(self.confirmation_timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::content_hash;
    use crate::ledger::{MemoryLedger, TaskReceipt};
    use crate::types::NewTaskEvent;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    /// Includes every response but takes `stall` to report it.
    struct SlowConfirmations {
        inner: Arc<MemoryLedger>,
        stall: Duration,
    }

    #[async_trait]
    impl Ledger for SlowConfirmations {
        fn name(&self) -> &str {
            "slow"
        }

        async fn create_new_task(&self, task: &Task) -> Result<TaskReceipt, LedgerError> {
            self.inner.create_new_task(task).await
        }

        async fn respond_to_task(&self, response: &TaskResponse) -> Result<TxHash, LedgerError> {
            let tx_hash = self.inner.respond_to_task(response).await?;
            tokio::time::sleep(self.stall).await;
            Ok(tx_hash)
        }

        async fn operator_registered(&self, operator: Address) -> Result<bool, LedgerError> {
            self.inner.operator_registered(operator).await
        }

        async fn ai_public_key(&self) -> Result<Address, LedgerError> {
            self.inner.ai_public_key().await
        }

        async fn current_block(&self) -> Result<u64, LedgerError> {
            self.inner.current_block().await
        }

        async fn find_response(
            &self,
            task_index: TaskIndex,
            operator: Address,
            from_block: Option<u64>,
        ) -> Result<Option<TxHash>, LedgerError> {
            self.inner.find_response(task_index, operator, from_block).await
        }

        async fn stream_new_tasks(
            &self,
            from_block: Option<u64>,
            sink: mpsc::Sender<NewTaskEvent>,
        ) -> Result<(), LedgerError> {
            self.inner.stream_new_tasks(from_block, sink).await
        }
    }

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        operator: Signer,
        task: Task,
    }

    async fn fixture() -> Fixture {
        let ai = Signer::random();
        let operator = Signer::random();
        let ledger = Arc::new(MemoryLedger::new(ai.address()));
        ledger.register_operator(operator.address());

        let hash = content_hash("hello");
        let task = Task::new(hash, ai.sign(&hash).unwrap());
        ledger.create_new_task(&task).await.unwrap();

        Fixture {
            ledger,
            operator,
            task,
        }
    }

    #[test]
    fn test_retry_policy_delays() {
        let fixed = RetryPolicy::default();
        assert_eq!(fixed.delay_after(1), Duration::from_secs(1));
        assert_eq!(fixed.delay_after(2), Duration::from_secs(1));

        let backoff = RetryPolicy {
            max_attempts: 4,
            delay: Duration::from_millis(100),
            backoff: 2.0,
        };
        assert_eq!(backoff.delay_after(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_after(3), Duration::from_millis(400));

        assert_eq!(RetryPolicy::none().attempts(), 1);
        assert_eq!(RetryPolicy { max_attempts: 0, ..RetryPolicy::default() }.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_respond_first_attempt() {
        let f = fixture().await;
        let submitter = ResponseSubmitter::new(f.ledger.clone(), RetryPolicy::default());

        let tx_hash = submitter.respond(&f.task, 0, true, &f.operator, Some(1)).await.unwrap();

        assert_eq!(f.ledger.respond_attempts(), 1);
        let responses = f.ledger.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].tx_hash, tx_hash);
        assert_eq!(responses[0].response, "Verified");
        assert_eq!(responses[0].operator, f.operator.address());
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_transient_failures_then_success() {
        let f = fixture().await;
        f.ledger.fail_next_responses(2);
        let submitter = ResponseSubmitter::new(f.ledger.clone(), RetryPolicy::default());

        let started = tokio::time::Instant::now();
        let tx_hash = submitter.respond(&f.task, 0, false, &f.operator, Some(1)).await.unwrap();

        assert_eq!(f.ledger.respond_attempts(), 3);
        assert_eq!(f.ledger.responses()[0].tx_hash, tx_hash);
        assert_eq!(f.ledger.responses()[0].response, "Not Verified");
        // Two fixed one-second pauses
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let f = fixture().await;
        f.ledger.fail_next_responses(u32::MAX);
        let policy = RetryPolicy {
            max_attempts: 5,
            ..RetryPolicy::default()
        };
        let submitter = ResponseSubmitter::new(f.ledger.clone(), policy);

        let result = submitter.respond(&f.task, 0, true, &f.operator, Some(1)).await;

        assert!(matches!(
            result,
            Err(AvsError::ResponseSubmission {
                attempts: 5,
                source: LedgerError::Connection(_)
            })
        ));
        assert_eq!(f.ledger.respond_attempts(), 5);
        assert!(f.ledger.responses().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_attempt_that_was_included_is_not_resent() {
        let f = fixture().await;
        let ledger = Arc::new(SlowConfirmations {
            inner: f.ledger.clone(),
            stall: Duration::from_secs(600),
        });
        let submitter = ResponseSubmitter::new(ledger, RetryPolicy::default())
            .with_confirmation_timeout(Duration::from_secs(10));

        let tx_hash = submitter
            .respond(&f.task, 0, true, &f.operator, Some(1))
            .await
            .unwrap();

        assert_eq!(f.ledger.respond_attempts(), 1);
        let responses = f.ledger.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].tx_hash, tx_hash);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_policy_makes_three_attempts() {
        let f = fixture().await;
        f.ledger.fail_next_responses(u32::MAX);
        let submitter = ResponseSubmitter::new(f.ledger.clone(), RetryPolicy::default());

        assert!(submitter.respond(&f.task, 0, true, &f.operator, Some(1)).await.is_err());
        assert_eq!(f.ledger.respond_attempts(), 3);
    }
}
