//! Core types used across the AVS task pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;

pub use ethers::types::{Address, TxHash};

/// Keccak-256 digest (32 bytes)
pub type Hash256 = [u8; 32];

/// Ledger-assigned task identifier. Monotonically increasing, never reused.
pub type TaskIndex = u32;

/// Variable-length signature bytes.
///
/// ECDSA recoverable signatures produced by [`crate::Signer`] are 65 bytes
/// (`r ‖ s ‖ v`), but tasks read from the ledger may carry anything.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignatureBytes(pub Vec<u8>);

impl SignatureBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for SignatureBytes {
    fn from(bytes: Vec<u8>) -> Self {
        SignatureBytes(bytes)
    }
}

impl AsRef<[u8]> for SignatureBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for SignatureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureBytes({self})")
    }
}

/// A content hash and the AI identity's signature over it.
///
/// Immutable once included in a `createNewTask` transaction. The ledger
/// requires the exact tuple to be replayed when responding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// keccak256 of the application content
    pub hash_before_sign: Hash256,
    /// Signature over `hash_before_sign` by the AI identity
    pub signature: SignatureBytes,
}

impl Task {
    pub fn new(hash_before_sign: Hash256, signature: impl Into<SignatureBytes>) -> Self {
        Self {
            hash_before_sign,
            signature: signature.into(),
        }
    }
}

/// The operator's verdict on a task, as sent in `respondToTask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Verified,
    NotVerified,
}

impl Verdict {
    pub fn is_verified(self) -> bool {
        matches!(self, Verdict::Verified)
    }
}

impl From<bool> for Verdict {
    fn from(is_verified: bool) -> Self {
        if is_verified {
            Verdict::Verified
        } else {
            Verdict::NotVerified
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Verified => write!(f, "Verified"),
            Verdict::NotVerified => write!(f, "Not Verified"),
        }
    }
}

/// A `NewTaskCreated` log as observed by the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTaskEvent {
    pub task_index: TaskIndex,
    pub task: Task,
    /// Block the log was included in, when the ledger reports it
    pub block_number: Option<u64>,
}

/// Per-task processing state, from the operator's perspective.
///
/// `Observed → Verifying → Responded | ResponseFailed`. There is no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Observed,
    Verifying,
    Responded,
    ResponseFailed,
}

impl TaskState {
    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Observed, TaskState::Verifying)
                | (TaskState::Verifying, TaskState::Responded)
                | (TaskState::Verifying, TaskState::ResponseFailed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Responded | TaskState::ResponseFailed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Observed => write!(f, "observed"),
            TaskState::Verifying => write!(f, "verifying"),
            TaskState::Responded => write!(f, "responded"),
            TaskState::ResponseFailed => write!(f, "response-failed"),
        }
    }
}

/// Connection state of an event subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}
