//! Durable per-operator processing journal.
//!
//! Records the [`TaskState`] of every task this operator has touched and the
//! last block it saw, so a restarted process neither answers a task twice nor
//! skips the blocks it missed while down.
//!
//! ## Resuming
//! [`Journal::resume_block`] is the block a restarted operator replays from:
//! the block of the oldest task not yet terminal, or the last block seen when
//! every task is settled.
//!
//! ## Format
//! A single CBOR document (ciborium, definite-length, struct fields in
//! declaration order). Writes go to a sibling temp file that is flushed to
//! disk and renamed over the journal, so a crash leaves either the old or the
//! new document. Responded entries more than [`DEFAULT_RETAINED_BLOCKS`]
//! behind the resume block are dropped.

use crate::types::{Hash256, TaskIndex, TaskState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Journal format version
pub const JOURNAL_VERSION: u8 = 1;

/// How far behind the resume block responded entries are kept.
pub const DEFAULT_RETAINED_BLOCKS: u64 = 50_000;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("CBOR encoding error: {0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("CBOR decoding error: {0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported journal version {0}")]
    UnsupportedVersion(u8),

    #[error("Task {task_index}: cannot move from {from} to {to}")]
    InvalidTransition {
        task_index: TaskIndex,
        from: TaskState,
        to: TaskState,
    },

    #[error("Task {0} is not in the journal")]
    UnknownTask(TaskIndex),
}

pub type Result<T> = std::result::Result<T, JournalError>;

/// What the journal knows about one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub state: TaskState,
    pub updated_at: DateTime<Utc>,
    /// Block the task was created in
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub block: Option<u64>,
    /// Response transaction, once responded
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tx_hash: Option<Hash256>,
    /// Last error, once failed
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct JournalDocument {
    version: u8,
    last_block: Option<u64>,
    tasks: BTreeMap<TaskIndex, JournalEntry>,
}

impl Default for JournalDocument {
    fn default() -> Self {
        Self {
            version: JOURNAL_VERSION,
            last_block: None,
            tasks: BTreeMap::new(),
        }
    }
}

/// Task-processing journal, optionally backed by a file.
#[derive(Debug)]
pub struct Journal {
    path: Option<PathBuf>,
    document: JournalDocument,
    retained_blocks: u64,
}

impl Journal {
    /// A journal that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            document: JournalDocument::default(),
            retained_blocks: DEFAULT_RETAINED_BLOCKS,
        }
    }

    /// Load the journal at `path`, or start an empty one if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let document = match std::fs::read(&path) {
            Ok(bytes) => {
                let document: JournalDocument = ciborium::from_reader(bytes.as_slice())?;
                if document.version != JOURNAL_VERSION {
                    return Err(JournalError::UnsupportedVersion(document.version));
                }
                tracing::info!(
                    path = %path.display(),
                    tasks = document.tasks.len(),
                    last_block = ?document.last_block,
                    "Loaded processing journal"
                );
                document
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "Starting new processing journal");
                JournalDocument::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: Some(path),
            document,
            retained_blocks: DEFAULT_RETAINED_BLOCKS,
        })
    }

    /// Keep responded entries for `blocks` blocks behind the resume block.
    pub fn with_retention(mut self, blocks: u64) -> Self {
        self.retained_blocks = blocks;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn state(&self, task_index: TaskIndex) -> Option<TaskState> {
        self.document.tasks.get(&task_index).map(|entry| entry.state)
    }

    pub fn entry(&self, task_index: TaskIndex) -> Option<&JournalEntry> {
        self.document.tasks.get(&task_index)
    }

    pub fn len(&self) -> usize {
        self.document.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.document.tasks.is_empty()
    }

    /// Highest block number recorded.
    pub fn last_block(&self) -> Option<u64> {
        self.document.last_block
    }

    /// Block to replay from after a restart.
    ///
    /// A task left `Observed` or `Verifying` pins this to its own block so it
    /// is delivered again.
    pub fn resume_block(&self) -> Option<u64> {
        let pending = self
            .document
            .tasks
            .values()
            .filter(|entry| !entry.state.is_terminal())
            .filter_map(|entry| entry.block)
            .min();

        match (pending, self.document.last_block) {
            (Some(pending), Some(last)) => Some(pending.min(last)),
            (pending, last) => pending.or(last),
        }
    }

    /// Record that events up to `block` have been seen. Never moves backwards.
    pub fn record_block(&mut self, block: u64) -> Result<()> {
        if self.document.last_block.is_some_and(|last| last >= block) {
            return Ok(());
        }
        self.document.last_block = Some(block);
        self.prune();
        self.persist()
    }

    /// Start tracking a task created in `block` as `Observed`. Returns the
    /// state the journal already held, if any, without changing it.
    pub fn observe(&mut self, task_index: TaskIndex, block: Option<u64>) -> Result<Option<TaskState>> {
        if let Some(existing) = self.state(task_index) {
            return Ok(Some(existing));
        }

        self.document.tasks.insert(
            task_index,
            JournalEntry {
                state: TaskState::Observed,
                updated_at: Utc::now(),
                block,
                tx_hash: None,
                error: None,
            },
        );
        self.persist()?;
        Ok(None)
    }

    /// Move a task to `next`, enforcing the task state machine.
    pub fn transition(&mut self, task_index: TaskIndex, next: TaskState) -> Result<()> {
        self.update(task_index, next, None, None)
    }

    pub fn mark_responded(&mut self, task_index: TaskIndex, tx_hash: Hash256) -> Result<()> {
        self.update(task_index, TaskState::Responded, Some(tx_hash), None)
    }

    pub fn mark_failed(&mut self, task_index: TaskIndex, error: impl Into<String>) -> Result<()> {
        self.update(task_index, TaskState::ResponseFailed, None, Some(error.into()))
    }

    fn update(
        &mut self,
        task_index: TaskIndex,
        next: TaskState,
        tx_hash: Option<Hash256>,
        error: Option<String>,
    ) -> Result<()> {
        let entry = self
            .document
            .tasks
            .get_mut(&task_index)
            .ok_or(JournalError::UnknownTask(task_index))?;

        if !entry.state.can_transition_to(next) {
            return Err(JournalError::InvalidTransition {
                task_index,
                from: entry.state,
                to: next,
            });
        }

        entry.state = next;
        entry.updated_at = Utc::now();
        entry.tx_hash = tx_hash.or(entry.tx_hash);
        entry.error = error;

        tracing::debug!(task_index, state = %next, "Journal updated");
        self.persist()
    }

    /// Drop responded entries that fell out of the retention window.
    fn prune(&mut self) {
        let Some(horizon) = self
            .resume_block()
            .and_then(|resume| resume.checked_sub(self.retained_blocks))
        else {
            return;
        };

        let before = self.document.tasks.len();
        self.document.tasks.retain(|_, entry| {
            entry.state != TaskState::Responded || entry.block.map_or(true, |block| block >= horizon)
        });

        let pruned = before - self.document.tasks.len();
        if pruned > 0 {
            tracing::debug!(pruned, horizon, "Pruned responded tasks from journal");
        }
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut bytes = Vec::new();
        ciborium::into_writer(&self.document, &mut bytes)?;

        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, path)?;
        sync_parent(path)
    }
}

/// Flush the directory entry so the rename survives a crash.
#[cfg(unix)]
fn sync_parent(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> Result<()> {
    Ok(())
}
