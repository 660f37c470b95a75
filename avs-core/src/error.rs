//! Error taxonomy for the task pipeline.
//!
//! A signature that does not match the AI identity is not an error; it is a
//! `false` verdict that still gets attested.

use crate::crypto::KeyError;
use crate::journal::JournalError;
use crate::ledger::LedgerError;
use crate::types::Address;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AvsError {
    /// Missing key material or endpoint. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Key(#[from] KeyError),

    /// The operator address is not registered. Fatal before watching starts.
    #[error("Operator {0:?} is not registered with the ledger")]
    Registration(Address),

    /// `createNewTask` failed, reverted or timed out. Not retried.
    #[error("Task submission failed: {0}")]
    Submission(#[source] LedgerError),

    /// `respondToTask` failed on every attempt.
    #[error("Task response failed after {attempts} attempts: {source}")]
    ResponseSubmission {
        attempts: u32,
        #[source]
        source: LedgerError,
    },

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Task event subscription closed")]
    SubscriptionClosed,
}

impl AvsError {
    /// Whether the process should refuse to start (or stop) on this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AvsError::Configuration(_)
                | AvsError::Key(_)
                | AvsError::Registration(_)
                | AvsError::Journal(_)
                | AvsError::SubscriptionClosed
        )
    }
}
