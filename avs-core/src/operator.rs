//! The operator service: watch for tasks, verify them, attest the verdict.
//!
//! Tasks are handled one at a time, in emission order. Each one moves through
//! the journal as `Observed → Verifying → Responded | ResponseFailed`; a task
//! already terminal in the journal, or already answered on-chain by this
//! operator, is not answered again. A task that fails short of a terminal
//! state holds the journal's resume block, so it is delivered again after a
//! restart.

use crate::crypto::Signer;
use crate::error::AvsError;
use crate::journal::Journal;
use crate::ledger::Ledger;
use crate::registration::RegistrationGuard;
use crate::responder::{ResponseSubmitter, RetryPolicy};
use crate::submitter::DEFAULT_CONFIRMATION_TIMEOUT;
use crate::types::{Address, NewTaskEvent, TaskState, TxHash, Verdict};
use crate::verifier::Verifier;
use crate::watcher::{EventWatcher, ReconnectPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    pub retry: RetryPolicy,
    pub reconnect: ReconnectPolicy,
    /// Bound on each `respondToTask` inclusion
    pub confirmation_timeout: Duration,
    /// First block to replay when the journal has none
    pub start_block: Option<u64>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            start_block: None,
        }
    }
}

/// How a single task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Responded { verdict: Verdict, tx_hash: TxHash },
    /// A `TaskResponded` from this operator was already on-chain
    AlreadyResponded,
    /// The journal already held a terminal state
    Skipped(TaskState),
}

pub struct Operator {
    ledger: Arc<dyn Ledger>,
    signer: Signer,
    journal: Journal,
    verifier: Verifier,
    responder: ResponseSubmitter,
    watcher: EventWatcher,
    start_block: Option<u64>,
}

impl Operator {
    pub fn new(ledger: Arc<dyn Ledger>, signer: Signer, journal: Journal, config: OperatorConfig) -> Self {
        let OperatorConfig {
            retry,
            reconnect,
            confirmation_timeout,
            start_block,
        } = config;

        Self {
            verifier: Verifier::new(ledger.clone()),
            responder: ResponseSubmitter::new(ledger.clone(), retry)
                .with_confirmation_timeout(confirmation_timeout),
            watcher: EventWatcher::new(ledger.clone(), reconnect),
            ledger,
            signer,
            journal,
            start_block,
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Run until `shutdown` fires.
    ///
    /// Fails before subscribing if the operator is not registered, and with
    /// [`AvsError::SubscriptionClosed`] if event delivery stops for good.
    /// A task in flight when `shutdown` fires is finished first.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), AvsError> {
        RegistrationGuard::new(self.ledger.clone())
            .assert_registered(self.address())
            .await?;

        let from_block = self.journal.resume_block().or(self.start_block);
        tracing::info!(
            operator = ?self.address(),
            ?from_block,
            "Operator started"
        );

        let mut subscription = self.watcher.subscribe(from_block);

        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested");
                    break Ok(());
                }
                event = subscription.recv() => {
                    let Some(event) = event else {
                        tracing::error!("Task subscription closed");
                        break Err(AvsError::SubscriptionClosed);
                    };
                    if let Err(e) = self.process(event).await {
                        break Err(e);
                    }
                }
            }
        };

        subscription.unsubscribe().await;
        tracing::info!(operator = ?self.address(), "Operator stopped");
        result
    }

    /// Handle one event and advance the journal's block. Only fatal errors
    /// are returned.
    async fn process(&mut self, event: NewTaskEvent) -> Result<(), AvsError> {
        match self.handle_task(&event).await {
            Ok(outcome) => tracing::debug!(task_index = event.task_index, ?outcome, "Task done"),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => tracing::error!(task_index = event.task_index, "Task failed: {}", e),
        }

        if let Some(block) = event.block_number {
            self.journal.record_block(block)?;
        }
        Ok(())
    }

    /// Verify one task and submit the attestation.
    pub async fn handle_task(&mut self, event: &NewTaskEvent) -> Result<TaskOutcome, AvsError> {
        let task_index = event.task_index;

        match self.journal.observe(task_index, event.block_number)? {
            Some(state) if state.is_terminal() => {
                tracing::debug!(task_index, %state, "Already handled");
                return Ok(TaskOutcome::Skipped(state));
            }
            Some(TaskState::Verifying) => {
                tracing::info!(task_index, "Resuming interrupted task");
            }
            _ => self.journal.transition(task_index, TaskState::Verifying)?,
        }

        if let Some(tx_hash) = self
            .ledger
            .find_response(task_index, self.address(), event.block_number)
            .await?
        {
            tracing::info!(task_index, tx = ?tx_hash, "Response already on-chain");
            self.journal.mark_responded(task_index, tx_hash.0)?;
            return Ok(TaskOutcome::AlreadyResponded);
        }

        let is_verified = self.verifier.verify_task(&event.task).await?;
        let verdict = Verdict::from(is_verified);
        tracing::info!(
            task_index,
            hash = %hex::encode(event.task.hash_before_sign),
            %verdict,
            "Task verified"
        );

        match self
            .responder
            .respond(&event.task, task_index, is_verified, &self.signer, event.block_number)
            .await
        {
            Ok(tx_hash) => {
                self.journal.mark_responded(task_index, tx_hash.0)?;
                Ok(TaskOutcome::Responded { verdict, tx_hash })
            }
            Err(e) => {
                self.journal.mark_failed(task_index, e.to_string())?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::content_hash;
    use crate::ledger::{LedgerError, MemoryLedger};
    use crate::types::Task;

    struct Fixture {
        ai: Signer,
        operator: Signer,
        ledger: Arc<MemoryLedger>,
    }

    impl Fixture {
        fn new() -> Self {
            let ai = Signer::random();
            let operator = Signer::random();
            let ledger = Arc::new(MemoryLedger::new(ai.address()));
            ledger.register_operator(operator.address());
            Self { ai, operator, ledger }
        }

        async fn create(&self, content: &str, signer: &Signer) -> NewTaskEvent {
            let hash = content_hash(content);
            let task = Task::new(hash, signer.sign(&hash).unwrap());
            let receipt = self.ledger.create_new_task(&task).await.unwrap();
            NewTaskEvent {
                task_index: receipt.task_index.unwrap(),
                task,
                block_number: receipt.block_number,
            }
        }

        fn operator(&self, journal: Journal) -> Operator {
            let config = OperatorConfig {
                retry: RetryPolicy {
                    max_attempts: 2,
                    delay: Duration::from_millis(1),
                    backoff: 1.0,
                },
                reconnect: ReconnectPolicy::disabled(),
                start_block: Some(0),
                ..OperatorConfig::default()
            };
            Operator::new(self.ledger.clone(), self.operator.clone(), journal, config)
        }

        async fn wait_for_responses(&self, n: usize) {
            for _ in 0..500 {
                if self.ledger.responses().len() >= n {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("expected {n} responses");
        }
    }

    #[tokio::test]
    async fn test_handle_task_verified() {
        let f = Fixture::new();
        let event = f.create("hello", &f.ai).await;
        let mut operator = f.operator(Journal::in_memory());

        let outcome = operator.handle_task(&event).await.unwrap();

        let responses = f.ledger.responses();
        assert_eq!(
            outcome,
            TaskOutcome::Responded {
                verdict: Verdict::Verified,
                tx_hash: responses[0].tx_hash
            }
        );
        assert_eq!(responses[0].response, "Verified");
        assert_eq!(responses[0].operator, f.operator.address());
        assert_eq!(operator.journal().state(0), Some(TaskState::Responded));
    }

    #[tokio::test]
    async fn test_handle_task_wrong_signer_is_not_verified() {
        let f = Fixture::new();
        let impostor = Signer::random();
        let event = f.create("hello", &impostor).await;
        let mut operator = f.operator(Journal::in_memory());

        let outcome = operator.handle_task(&event).await.unwrap();

        assert!(matches!(
            outcome,
            TaskOutcome::Responded {
                verdict: Verdict::NotVerified,
                ..
            }
        ));
        assert_eq!(f.ledger.responses()[0].response, "Not Verified");
    }

    #[tokio::test]
    async fn test_does_not_answer_twice() {
        let f = Fixture::new();
        let event = f.create("hello", &f.ai).await;

        let mut operator = f.operator(Journal::in_memory());
        operator.handle_task(&event).await.unwrap();
        assert_eq!(
            operator.handle_task(&event).await.unwrap(),
            TaskOutcome::Skipped(TaskState::Responded)
        );

        // A fresh journal still finds the on-chain response
        let mut restarted = f.operator(Journal::in_memory());
        assert_eq!(
            restarted.handle_task(&event).await.unwrap(),
            TaskOutcome::AlreadyResponded
        );
        assert_eq!(restarted.journal().state(0), Some(TaskState::Responded));
        assert_eq!(f.ledger.respond_attempts(), 1);
    }

    #[tokio::test]
    async fn test_resumes_interrupted_task() {
        let f = Fixture::new();
        let event = f.create("hello", &f.ai).await;

        let mut journal = Journal::in_memory();
        journal.observe(0, event.block_number).unwrap();
        journal.transition(0, TaskState::Verifying).unwrap();

        let mut operator = f.operator(journal);
        let outcome = operator.handle_task(&event).await.unwrap();

        assert!(matches!(outcome, TaskOutcome::Responded { .. }));
        assert_eq!(operator.journal().state(0), Some(TaskState::Responded));
    }

    #[tokio::test]
    async fn test_response_failure_is_recorded() {
        let f = Fixture::new();
        let event = f.create("hello", &f.ai).await;
        f.ledger.fail_next_responses(u32::MAX);
        let mut operator = f.operator(Journal::in_memory());

        let result = operator.handle_task(&event).await;

        assert!(matches!(
            result,
            Err(AvsError::ResponseSubmission {
                attempts: 2,
                source: LedgerError::Connection(_)
            })
        ));
        let entry = operator.journal().entry(0).unwrap();
        assert_eq!(entry.state, TaskState::ResponseFailed);
        assert!(entry.error.is_some());
    }

    #[tokio::test]
    async fn test_run_rejects_unregistered_operator() {
        let f = Fixture::new();
        f.ledger.deregister_operator(f.operator.address());
        let mut operator = f.operator(Journal::in_memory());

        let result = operator.run(CancellationToken::new()).await;

        assert!(matches!(result, Err(AvsError::Registration(addr)) if addr == f.operator.address()));
        assert_eq!(f.ledger.stream_calls(), 0);
    }

    #[tokio::test]
    async fn test_run_answers_tasks_until_shutdown() {
        let f = Fixture::new();
        f.create("first", &f.ai).await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("operator.journal");
        let mut operator = f.operator(Journal::open(&path).unwrap());

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let running = tokio::spawn(async move {
            let result = operator.run(token).await;
            (operator, result)
        });

        f.wait_for_responses(1).await;
        f.create("second", &Signer::random()).await;
        f.wait_for_responses(2).await;

        shutdown.cancel();
        let (operator, result) = running.await.unwrap();
        assert!(result.is_ok());

        let responses = f.ledger.responses();
        assert_eq!(responses[0].response, "Verified");
        assert_eq!(responses[1].response, "Not Verified");
        assert_eq!(operator.journal().last_block(), Some(3));

        let reopened = Journal::open(&path).unwrap();
        assert_eq!(reopened.state(0), Some(TaskState::Responded));
        assert_eq!(reopened.state(1), Some(TaskState::Responded));
    }

    #[tokio::test]
    async fn test_unsettled_task_is_redelivered_after_restart() {
        let f = Fixture::new();
        let first = f.create("first", &f.ai).await;
        let second = f.create("second", &f.ai).await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("operator.journal");

        {
            let mut operator = f.operator(Journal::open(&path).unwrap());
            f.ledger.fail_next_key_lookups(1);
            operator.process(first).await.unwrap();
            operator.process(second).await.unwrap();

            let journal = operator.journal();
            assert_eq!(journal.state(0), Some(TaskState::Verifying));
            assert_eq!(journal.state(1), Some(TaskState::Responded));
            assert_eq!(journal.last_block(), Some(2));
            assert_eq!(journal.resume_block(), Some(1));
        }

        let mut restarted = f.operator(Journal::open(&path).unwrap());
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let running = tokio::spawn(async move {
            let result = restarted.run(token).await;
            (restarted, result)
        });

        f.wait_for_responses(2).await;
        shutdown.cancel();
        let (restarted, result) = running.await.unwrap();
        assert!(result.is_ok());

        let answered: Vec<_> = f.ledger.responses().iter().map(|r| r.task_index).collect();
        assert_eq!(answered, vec![1, 0]);
        assert_eq!(f.ledger.respond_attempts(), 2);
        assert_eq!(restarted.journal().state(0), Some(TaskState::Responded));
    }

    #[tokio::test]
    async fn test_run_fails_when_subscription_closes() {
        let f = Fixture::new();
        f.create("first", &f.ai).await;
        let mut operator = f.operator(Journal::in_memory());

        let running = tokio::spawn(async move { operator.run(CancellationToken::new()).await });

        f.wait_for_responses(1).await;
        f.ledger.disconnect_subscribers();

        let result = running.await.unwrap();
        assert!(matches!(result, Err(AvsError::SubscriptionClosed)));
    }
}
