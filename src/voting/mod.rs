pub mod ledger;
pub mod lifecycle;
pub mod results;

use crate::db::StoreError;
use crate::identity::IdentityError;
use thiserror::Error;

pub use ledger::VoteLedger;
pub use lifecycle::PollManager;
pub use results::ResultsReader;

const MAX_POLL_ID_LEN: usize = 128;

/// What happened to a vote that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// First vote from this voter in this poll; counted.
    Recorded,
    /// The voter already has a record; nothing changed.
    AlreadyVoted,
}

#[derive(Debug, Error)]
pub enum VotingError {
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(#[from] IdentityError),
    #[error("unknown option: {0}")]
    InvalidOption(String),
    #[error("poll id must be between 1 and 128 characters")]
    InvalidPollId,
    #[error("poll not found")]
    NotFound,
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

impl VotingError {
    /// Storage faults are worth retrying; bad input never is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VotingError::Storage(_))
    }
}

/// Trim and bound-check a caller-supplied poll id.
pub fn clean_poll_id(raw: &str) -> Result<&str, VotingError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_POLL_ID_LEN {
        return Err(VotingError::InvalidPollId);
    }
    Ok(trimmed)
}
