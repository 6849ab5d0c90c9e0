use std::time::Duration;

use thiserror::Error;

use crate::slot::{SlotId, Version};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Lease store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    /// The store accepted the write but its reply did not say which
    /// version it created. The lease may be held.
    #[error("Write to the lease store may have been committed: {reason}")]
    CommitUnconfirmed { reason: String },

    #[error("Version conflict: ledger changed since version {expected}")]
    VersionConflict { expected: Version },

    #[error("Malformed ledger at line {line}: {reason}")]
    Decode { line: usize, reason: String },

    #[error("Cannot encode slot {id}: {reason}")]
    Encode { id: SlotId, reason: String },

    #[error("Gave up after {attempts} conflicting attempts")]
    ContentionFailed { attempts: u32 },

    #[error("Invalid lease request: {0}")]
    InvalidRequest(String),

    #[error("Acquire did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn unavailable(reason: impl std::fmt::Display) -> Self {
        Self::StoreUnavailable {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn decode(line: usize, reason: impl Into<String>) -> Self {
        Self::Decode {
            line,
            reason: reason.into(),
        }
    }

    /// Conflicts are the only failure the acquire loop recovers from.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
