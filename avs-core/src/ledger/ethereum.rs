//! Ledger client for the deployed service-manager contract, using ethers-rs
//! over a WebSocket provider.
//!
//! ## Lifecycle
//! [`EthLedger::open`] connects, resolves the chain id and binds the sending
//! wallet. [`EthLedger::close`] releases the connection. Nothing is cached
//! between calls: `aiPublicKey()` and `operatorRegistered()` hit the chain
//! every time.

use super::{Ledger, LedgerError, TaskReceipt};
use crate::attestation::TaskResponse;
use crate::crypto::Signer;
use crate::types::{Address, NewTaskEvent, Task, TaskIndex, TxHash};
use async_trait::async_trait;
use ethers::contract::{parse_log, LogMeta};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Middleware, PendingTransaction, Provider, Ws};
use ethers::signers::{LocalWallet, Signer as _};
use ethers::types::{Bytes, TransactionReceipt, H256, U64};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Gas ceiling for `createNewTask` and `respondToTask`.
pub const DEFAULT_GAS_LIMIT: u64 = 500_000;

/// Blocks covered by one `eth_getLogs` request when searching for responses.
pub const DEFAULT_LOG_RANGE: u64 = 5_000;

mod bindings {
    ethers::contract::abigen!(
        AiAvsServiceManager,
        r#"[
            struct Task { bytes32 hashBeforeSign; bytes signature; }
            function createNewTask(bytes32 hashBeforeSign, bytes signature) external returns (Task)
            function respondToTask(Task task, uint32 referenceTaskIndex, string response, bytes signature) external
            function operatorRegistered(address operator) external view returns (bool)
            function aiPublicKey() external view returns (address)
            event NewTaskCreated(uint32 indexed taskIndex, Task task)
            event TaskResponded(uint32 indexed taskIndex, Task task, string response, address operator)
        ]"#
    );
}

use bindings::{AiAvsServiceManager, NewTaskCreatedFilter};

type Client = SignerMiddleware<Provider<Ws>, LocalWallet>;

/// Configuration for the Ethereum ledger client.
#[derive(Debug, Clone)]
pub struct EthLedgerConfig {
    /// WebSocket RPC endpoint
    pub rpc_url: String,
    /// Service-manager contract address
    pub contract_address: Address,
    /// Gas ceiling for both submission calls
    pub gas_limit: u64,
    /// First block scanned when looking up past responses
    pub deploy_block: u64,
    /// Block span of each log query; providers cap the range they serve
    pub log_range: u64,
}

impl Default for EthLedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "ws://127.0.0.1:8545".to_string(),
            contract_address: Address::zero(),
            gas_limit: DEFAULT_GAS_LIMIT,
            deploy_block: 0,
            log_range: DEFAULT_LOG_RANGE,
        }
    }
}

/// [`Ledger`] backed by the on-chain contract.
pub struct EthLedger {
    contract: AiAvsServiceManager<Client>,
    client: Arc<Client>,
    config: EthLedgerConfig,
    chain_id: u64,
}

impl EthLedger {
    /// Connect to the chain; transactions are sent from `sender`.
    pub async fn open(config: EthLedgerConfig, sender: &Signer) -> Result<Self, LedgerError> {
        let provider = Provider::<Ws>::connect(config.rpc_url.as_str())
            .await
            .map_err(|e| LedgerError::Connection(format!("{}: {}", config.rpc_url, e)))?;

        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|e| LedgerError::Connection(e.to_string()))?
            .as_u64();

        let wallet = sender.wallet().clone().with_chain_id(chain_id);
        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        let contract = AiAvsServiceManager::new(config.contract_address, client.clone());

        tracing::info!(
            chain_id,
            contract = ?config.contract_address,
            sender = ?client.address(),
            "Connected to ledger at {}",
            config.rpc_url
        );

        Ok(Self {
            contract,
            client,
            config,
            chain_id,
        })
    }

    /// Release the connection.
    pub fn close(self) {
        tracing::info!(chain_id = self.chain_id, "Closing ledger connection");
        drop(self.contract);
        drop(self.client);
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Address transactions are sent from.
    pub fn sender(&self) -> Address {
        self.client.address()
    }

    pub fn config(&self) -> &EthLedgerConfig {
        &self.config
    }
}

fn contract_error(e: impl std::fmt::Display) -> LedgerError {
    LedgerError::Contract(e.to_string())
}

/// Wait for inclusion and check the receipt status.
async fn confirm(pending: PendingTransaction<'_, Ws>) -> Result<TransactionReceipt, LedgerError> {
    let tx_hash = pending.tx_hash();
    tracing::debug!("Waiting for inclusion of {:?}", tx_hash);

    let receipt = pending
        .await
        .map_err(|e| LedgerError::Connection(e.to_string()))?
        .ok_or(LedgerError::Dropped(tx_hash))?;

    if receipt.status != Some(U64::from(1)) {
        tracing::error!(
            tx = ?tx_hash,
            gas_used = ?receipt.gas_used,
            block = ?receipt.block_number,
            "Transaction reverted"
        );
        return Err(LedgerError::Reverted(tx_hash));
    }

    Ok(receipt)
}

/// Split `from..=to` into inclusive windows of at most `span` blocks.
fn block_windows(from: u64, to: u64, span: u64) -> impl Iterator<Item = (u64, u64)> {
    let span = span.max(1);
    let mut next = Some(from).filter(|from| *from <= to);
    std::iter::from_fn(move || {
        let start = next?;
        let end = start.saturating_add(span - 1).min(to);
        next = end.checked_add(1).filter(|n| *n <= to);
        Some((start, end))
    })
}

fn to_task(task: bindings::Task) -> Task {
    Task::new(task.hash_before_sign, task.signature.to_vec())
}

fn to_binding(task: &Task) -> bindings::Task {
    bindings::Task {
        hash_before_sign: task.hash_before_sign,
        signature: Bytes::from(task.signature.0.clone()),
    }
}

fn to_event(event: NewTaskCreatedFilter, meta: &LogMeta) -> NewTaskEvent {
    NewTaskEvent {
        task_index: event.task_index,
        task: to_task(event.task),
        block_number: Some(meta.block_number.as_u64()),
    }
}

#[async_trait]
impl Ledger for EthLedger {
    fn name(&self) -> &str {
        "ethereum"
    }

    async fn create_new_task(&self, task: &Task) -> Result<TaskReceipt, LedgerError> {
        let call = self
            .contract
            .create_new_task(task.hash_before_sign, Bytes::from(task.signature.0.clone()))
            .gas(self.config.gas_limit);

        let pending = call.send().await.map_err(|e| {
            tracing::error!(
                hash = %hex::encode(task.hash_before_sign),
                signature = %task.signature,
                "createNewTask rejected: {}",
                e
            );
            contract_error(e)
        })?;
        let tx_hash = pending.tx_hash();
        let receipt = confirm(pending).await?;

        let task_index = receipt
            .logs
            .iter()
            .filter(|log| log.address == self.config.contract_address)
            .find_map(|log| parse_log::<NewTaskCreatedFilter>(log.clone()).ok())
            .map(|event| event.task_index);

        Ok(TaskReceipt {
            tx_hash,
            task_index,
            block_number: receipt.block_number.map(|n| n.as_u64()),
        })
    }

    async fn respond_to_task(&self, response: &TaskResponse) -> Result<TxHash, LedgerError> {
        let call = self
            .contract
            .respond_to_task(
                to_binding(&response.task),
                response.task_index,
                response.response_text(),
                Bytes::from(response.operator_signature.0.clone()),
            )
            .gas(self.config.gas_limit);

        let pending = call.send().await.map_err(|e| {
            tracing::error!(
                task_index = response.task_index,
                response = %response.verdict,
                "respondToTask rejected: {}",
                e
            );
            contract_error(e)
        })?;
        let tx_hash = pending.tx_hash();
        confirm(pending).await?;

        Ok(tx_hash)
    }

    async fn operator_registered(&self, operator: Address) -> Result<bool, LedgerError> {
        self.contract
            .operator_registered(operator)
            .call()
            .await
            .map_err(contract_error)
    }

    async fn ai_public_key(&self) -> Result<Address, LedgerError> {
        self.contract.ai_public_key().call().await.map_err(contract_error)
    }

    async fn current_block(&self) -> Result<u64, LedgerError> {
        self.client
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(|e| LedgerError::Connection(e.to_string()))
    }

    async fn find_response(
        &self,
        task_index: TaskIndex,
        operator: Address,
        from_block: Option<u64>,
    ) -> Result<Option<TxHash>, LedgerError> {
        let from = from_block.map_or(self.config.deploy_block, |block| {
            block.max(self.config.deploy_block)
        });
        let head = self.current_block().await?;

        for (start, end) in block_windows(from, head, self.config.log_range) {
            let responses = self
                .contract
                .task_responded_filter()
                .topic1(H256::from_low_u64_be(u64::from(task_index)))
                .from_block(start)
                .to_block(end)
                .query_with_meta()
                .await
                .map_err(contract_error)?;

            if let Some((_, meta)) = responses.iter().find(|(event, _)| event.operator == operator) {
                return Ok(Some(meta.transaction_hash));
            }
        }

        Ok(None)
    }

    async fn stream_new_tasks(
        &self,
        from_block: Option<u64>,
        sink: mpsc::Sender<NewTaskEvent>,
    ) -> Result<(), LedgerError> {
        // Subscribe first; the replayed range and the live stream may overlap
        // and the overlap is dropped by task index below.
        let live = self.contract.new_task_created_filter();
        let mut stream = live
            .subscribe_with_meta()
            .await
            .map_err(|e| LedgerError::Connection(e.to_string()))?;

        let mut last_sent: Option<TaskIndex> = None;

        if let Some(from) = from_block {
            let past = self
                .contract
                .new_task_created_filter()
                .from_block(from)
                .query_with_meta()
                .await
                .map_err(contract_error)?;

            tracing::debug!("Replaying {} NewTaskCreated logs from block {}", past.len(), from);

            for (event, meta) in past {
                last_sent = Some(event.task_index);
                if sink.send(to_event(event, &meta)).await.is_err() {
                    return Ok(());
                }
            }
        }

        loop {
            let next = tokio::select! {
                _ = sink.closed() => return Ok(()),
                next = stream.next() => next,
            };

            match next {
                Some(Ok((event, meta))) => {
                    if last_sent.is_some_and(|last| event.task_index <= last) {
                        continue;
                    }
                    last_sent = Some(event.task_index);
                    if sink.send(to_event(event, &meta)).await.is_err() {
                        return Ok(());
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("Skipping undecodable NewTaskCreated log: {}", e);
                }
                None => return Err(LedgerError::StreamClosed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EthLedgerConfig::default();
        assert_eq!(config.gas_limit, 500_000);
        assert_eq!(config.deploy_block, 0);
        assert_eq!(config.log_range, DEFAULT_LOG_RANGE);
    }

    #[test]
    fn test_block_windows() {
        let windows: Vec<_> = block_windows(10, 25, 5).collect();
        assert_eq!(windows, vec![(10, 14), (15, 19), (20, 24), (25, 25)]);

        assert_eq!(block_windows(7, 7, 5000).collect::<Vec<_>>(), vec![(7, 7)]);
        assert_eq!(block_windows(8, 7, 5000).count(), 0);
        // A zero span still makes progress
        assert_eq!(block_windows(0, 2, 0).count(), 3);
        assert_eq!(
            block_windows(u64::MAX - 1, u64::MAX, 10).collect::<Vec<_>>(),
            vec![(u64::MAX - 1, u64::MAX)]
        );
    }

    #[test]
    fn test_task_binding_conversion() {
        let task = Task::new([9u8; 32], vec![1, 2, 3]);
        let binding = to_binding(&task);

        assert_eq!(binding.hash_before_sign, [9u8; 32]);
        assert_eq!(binding.signature.to_vec(), vec![1, 2, 3]);
        assert_eq!(to_task(binding), task);
    }
}
