//! Ledger interface: the seam between the task protocol and the chain.
//!
//! The ledger contract holds tasks and operator registrations and emits
//! `NewTaskCreated` / `TaskResponded` events. Everything above this trait is
//! chain-agnostic; [`EthLedger`] talks to a deployed contract over WebSocket
//! and [`MemoryLedger`] keeps the same semantics in process.

mod ethereum;
mod memory;

pub use ethereum::{EthLedger, EthLedgerConfig, DEFAULT_GAS_LIMIT, DEFAULT_LOG_RANGE};
pub use memory::{MemoryLedger, RespondedRecord};

use crate::attestation::TaskResponse;
use crate::types::{Address, NewTaskEvent, Task, TaskIndex, TxHash};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Outcome of an included `createNewTask` transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReceipt {
    pub tx_hash: TxHash,
    /// Index assigned by the contract, when the `NewTaskCreated` log was found
    pub task_index: Option<TaskIndex>,
    pub block_number: Option<u64>,
}

/// Trait for ledger clients.
///
/// Transaction methods return once the transaction is included; a reverted
/// transaction is an error. Callers bound the wait with their own timeout.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Short name for logs (e.g., "ethereum", "memory").
    fn name(&self) -> &str;

    /// Submit `createNewTask(hashBeforeSign, signature)`.
    async fn create_new_task(&self, task: &Task) -> Result<TaskReceipt, LedgerError>;

    /// Submit `respondToTask(task, taskIndex, response, signature)`.
    async fn respond_to_task(&self, response: &TaskResponse) -> Result<TxHash, LedgerError>;

    /// Query `operatorRegistered(address)`.
    async fn operator_registered(&self, operator: Address) -> Result<bool, LedgerError>;

    /// Query `aiPublicKey()`, the address whose signatures count as the AI identity.
    async fn ai_public_key(&self) -> Result<Address, LedgerError>;

    /// Latest block number.
    async fn current_block(&self) -> Result<u64, LedgerError>;

    /// Transaction of `operator`'s `TaskResponded` record for `task_index`.
    ///
    /// A response can only follow its task, so `from_block` (the task's block,
    /// when known) narrows the search.
    async fn find_response(
        &self,
        task_index: TaskIndex,
        operator: Address,
        from_block: Option<u64>,
    ) -> Result<Option<TxHash>, LedgerError>;

    /// Whether `operator` already has a `TaskResponded` record for `task_index`.
    async fn has_responded(
        &self,
        task_index: TaskIndex,
        operator: Address,
    ) -> Result<bool, LedgerError> {
        Ok(self.find_response(task_index, operator, None).await?.is_some())
    }

    /// Forward `NewTaskCreated` events into `sink` in emission order.
    ///
    /// When `from_block` is set, logs from that block onward are replayed
    /// before live delivery starts. Returns `Ok(())` once `sink` is closed and
    /// an error when the underlying connection drops.
    async fn stream_new_tasks(
        &self,
        from_block: Option<u64>,
        sink: mpsc::Sender<NewTaskEvent>,
    ) -> Result<(), LedgerError>;
}

/// Errors that can occur while talking to the ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Contract call failed: {0}")]
    Contract(String),

    #[error("Transaction {0:?} reverted")]
    Reverted(TxHash),

    #[error("Transaction {0:?} dropped before inclusion")]
    Dropped(TxHash),

    #[error("Timed out after {0:?} waiting for inclusion")]
    Timeout(Duration),

    #[error("Event stream closed")]
    StreamClosed,

    #[error("Ledger client is closed")]
    Closed,
}
