//! In-process ledger with the contract's semantics.
//!
//! Every transaction is mined into its own block. Failures and dropped
//! subscriptions can be injected to exercise retry and reconnect paths.

use super::{Ledger, LedgerError, TaskReceipt};
use crate::attestation::TaskResponse;
use crate::crypto::keccak256;
use crate::types::{Address, NewTaskEvent, Task, TaskIndex, TxHash};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum Signal {
    NewTask(NewTaskEvent),
    Disconnect,
}

/// A recorded `TaskResponded` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespondedRecord {
    pub task_index: TaskIndex,
    pub task: Task,
    pub response: String,
    pub operator: Address,
    pub tx_hash: TxHash,
}

#[derive(Debug, Default)]
struct State {
    tasks: Vec<NewTaskEvent>,
    responses: Vec<RespondedRecord>,
    registered: HashSet<Address>,
    ai_public_key: Address,
    block_number: u64,
    tx_nonce: u64,
    respond_attempts: u32,
    stream_calls: u32,
    fail_next_responses: u32,
    fail_next_key_lookups: u32,
    reverting: bool,
    closed: bool,
}

impl State {
    fn next_tx_hash(&mut self) -> TxHash {
        self.tx_nonce += 1;
        TxHash::from(keccak256(&self.tx_nonce.to_be_bytes()))
    }
}

/// In-memory [`Ledger`].
pub struct MemoryLedger {
    state: Mutex<State>,
    events: broadcast::Sender<Signal>,
}

impl MemoryLedger {
    /// Create a ledger whose AI identity is `ai_public_key`.
    pub fn new(ai_public_key: Address) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(State {
                ai_public_key,
                ..State::default()
            }),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-update
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register_operator(&self, operator: Address) {
        self.lock().registered.insert(operator);
    }

    pub fn deregister_operator(&self, operator: Address) {
        self.lock().registered.remove(&operator);
    }

    /// Rotate the AI identity.
    pub fn set_ai_public_key(&self, address: Address) {
        self.lock().ai_public_key = address;
    }

    /// Make the next `n` `respondToTask` submissions fail.
    pub fn fail_next_responses(&self, n: u32) {
        self.lock().fail_next_responses = n;
    }

    /// Make the next `n` `aiPublicKey()` queries fail.
    pub fn fail_next_key_lookups(&self, n: u32) {
        self.lock().fail_next_key_lookups = n;
    }

    /// Make `createNewTask` revert.
    pub fn set_reverting(&self, reverting: bool) {
        self.lock().reverting = reverting;
    }

    /// Drop every open event subscription.
    pub fn disconnect_subscribers(&self) {
        let _ = self.events.send(Signal::Disconnect);
    }

    /// Close the ledger; every later call fails with [`LedgerError::Closed`].
    pub fn close(&self) {
        self.lock().closed = true;
        self.disconnect_subscribers();
    }

    pub fn task_count(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn task(&self, task_index: TaskIndex) -> Option<Task> {
        self.lock()
            .tasks
            .get(task_index as usize)
            .map(|event| event.task.clone())
    }

    /// All accepted responses, in inclusion order.
    pub fn responses(&self) -> Vec<RespondedRecord> {
        self.lock().responses.clone()
    }

    /// Number of `respondToTask` submissions, failed ones included.
    pub fn respond_attempts(&self) -> u32 {
        self.lock().respond_attempts
    }

    /// Number of event subscriptions opened so far.
    pub fn stream_calls(&self) -> u32 {
        self.lock().stream_calls
    }

    pub fn block_number(&self) -> u64 {
        self.lock().block_number
    }

    fn ensure_open(state: &State) -> Result<(), LedgerError> {
        if state.closed {
            Err(LedgerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_new_task(&self, task: &Task) -> Result<TaskReceipt, LedgerError> {
        let (event, tx_hash) = {
            let mut state = self.lock();
            Self::ensure_open(&state)?;

            let tx_hash = state.next_tx_hash();
            if state.reverting {
                return Err(LedgerError::Reverted(tx_hash));
            }

            state.block_number += 1;
            let event = NewTaskEvent {
                task_index: state.tasks.len() as TaskIndex,
                task: task.clone(),
                block_number: Some(state.block_number),
            };
            state.tasks.push(event.clone());
            (event, tx_hash)
        };

        let receipt = TaskReceipt {
            tx_hash,
            task_index: Some(event.task_index),
            block_number: event.block_number,
        };
        // No subscribers is fine
        let _ = self.events.send(Signal::NewTask(event));

        Ok(receipt)
    }

    async fn respond_to_task(&self, response: &TaskResponse) -> Result<TxHash, LedgerError> {
        let mut state = self.lock();
        Self::ensure_open(&state)?;

        state.respond_attempts += 1;
        if state.fail_next_responses > 0 {
            state.fail_next_responses -= 1;
            return Err(LedgerError::Connection("injected failure".to_string()));
        }

        let tx_hash = state.next_tx_hash();

        let stored = state
            .tasks
            .get(response.task_index as usize)
            .map(|event| &event.task);
        if stored != Some(&response.task) {
            return Err(LedgerError::Reverted(tx_hash));
        }

        // The contract checks msg.sender; here the sender is whoever signed
        // the attestation.
        let operator = response
            .operator()
            .map_err(|_| LedgerError::Reverted(tx_hash))?;
        if !state.registered.contains(&operator) {
            return Err(LedgerError::Reverted(tx_hash));
        }

        state.block_number += 1;
        state.responses.push(RespondedRecord {
            task_index: response.task_index,
            task: response.task.clone(),
            response: response.response_text(),
            operator,
            tx_hash,
        });

        Ok(tx_hash)
    }

    async fn operator_registered(&self, operator: Address) -> Result<bool, LedgerError> {
        let state = self.lock();
        Self::ensure_open(&state)?;
        Ok(state.registered.contains(&operator))
    }

    async fn ai_public_key(&self) -> Result<Address, LedgerError> {
        let mut state = self.lock();
        Self::ensure_open(&state)?;
        if state.fail_next_key_lookups > 0 {
            state.fail_next_key_lookups -= 1;
            return Err(LedgerError::Connection("injected failure".to_string()));
        }
        Ok(state.ai_public_key)
    }

    async fn current_block(&self) -> Result<u64, LedgerError> {
        let state = self.lock();
        Self::ensure_open(&state)?;
        Ok(state.block_number)
    }

    async fn find_response(
        &self,
        task_index: TaskIndex,
        operator: Address,
        _from_block: Option<u64>,
    ) -> Result<Option<TxHash>, LedgerError> {
        let state = self.lock();
        Self::ensure_open(&state)?;
        Ok(state
            .responses
            .iter()
            .find(|r| r.task_index == task_index && r.operator == operator)
            .map(|r| r.tx_hash))
    }

    async fn stream_new_tasks(
        &self,
        from_block: Option<u64>,
        sink: mpsc::Sender<NewTaskEvent>,
    ) -> Result<(), LedgerError> {
        // Subscribe before reading the backlog so nothing falls in between
        let mut live = self.events.subscribe();

        let backlog: Vec<NewTaskEvent> = {
            let mut state = self.lock();
            Self::ensure_open(&state)?;
            state.stream_calls += 1;
            match from_block {
                Some(from) => state
                    .tasks
                    .iter()
                    .filter(|event| event.block_number.unwrap_or(0) >= from)
                    .cloned()
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut last_sent: Option<TaskIndex> = None;
        for event in backlog {
            last_sent = Some(event.task_index);
            if sink.send(event).await.is_err() {
                return Ok(());
            }
        }

        loop {
            let signal = tokio::select! {
                _ = sink.closed() => return Ok(()),
                signal = live.recv() => signal,
            };

            match signal {
                Ok(Signal::NewTask(event)) => {
                    if last_sent.is_some_and(|last| event.task_index <= last) {
                        continue;
                    }
                    last_sent = Some(event.task_index);
                    if sink.send(event).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(Signal::Disconnect) => return Err(LedgerError::StreamClosed),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Err(LedgerError::Connection(format!(
                        "subscriber lagged by {missed} events"
                    )));
                }
                Err(broadcast::error::RecvError::Closed) => return Err(LedgerError::StreamClosed),
            }
        }
    }
}
