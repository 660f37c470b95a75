//! # AVS Core
//!
//! Task attestation pipeline for the AI AVS: an AI identity signs content
//! hashes and submits them as tasks; registered operators verify each
//! task's signature and attest the verdict on-chain.
//!
//! ## Key Features
//! - **EIP-191 signatures**: secp256k1 personal-message signing and recovery
//! - **Attestations**: `keccak256(abi.encode(bool, bytes32))` signed by the operator
//! - **Pluggable ledger**: `Ledger` trait with an ethers-backed and an in-memory implementation
//! - **Resilient delivery**: exactly-once, in-order task events across reconnects
//! - **Bounded retries**: configurable response retry and confirmation timeouts
//! - **Processing journal**: canonical CBOR record for restart without duplicate responses

pub mod attestation;
pub mod crypto;
pub mod error;
pub mod journal;
pub mod ledger;
pub mod operator;
pub mod registration;
pub mod responder;
pub mod submitter;
pub mod types;
pub mod verifier;
pub mod watcher;

pub use attestation::{attestation_message, TaskResponse};
pub use crypto::{content_hash, KeyError, Signer};
pub use error::AvsError;
pub use journal::{Journal, JournalError};
pub use ledger::{EthLedger, EthLedgerConfig, Ledger, LedgerError, MemoryLedger, TaskReceipt};
pub use operator::{Operator, OperatorConfig, TaskOutcome};
pub use registration::RegistrationGuard;
pub use responder::{ResponseSubmitter, RetryPolicy};
pub use submitter::{SubmittedTask, TaskSubmitter};
pub use types::*;
pub use verifier::{verify, Verifier};
pub use watcher::{EventWatcher, ReconnectPolicy, Subscription, Unsubscribe};
