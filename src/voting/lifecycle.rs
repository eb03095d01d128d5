use chrono::Utc;
use log::{info, warn};
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{StoreError, VoteStore};
use crate::models::{CurrentPoll, PollResults, VoteOption};
use crate::voting::results::to_results;
use crate::voting::{clean_poll_id, VotingError};

const MAX_SWAP_ATTEMPTS: u32 = 5;

/// Summary of a completed reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetReport {
    pub poll_id: String,
    pub voters_removed: u64,
}

/// One page of a voter purge. Feed `next_cursor` back in until it is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeStep {
    pub removed: u64,
    pub next_cursor: Option<String>,
}

/// Creates, resets and repairs polls, and owns the `CURRENT` pointer.
pub struct PollManager {
    store: Arc<dyn VoteStore>,
    page_size: u32,
}

impl PollManager {
    pub fn new(store: Arc<dyn VoteStore>, page_size: u32) -> Self {
        Self { store, page_size: page_size.max(1) }
    }

    pub async fn current(&self) -> Result<Option<CurrentPoll>, VotingError> {
        Ok(self.store.current_poll().await?)
    }

    /// Start a poll and point `CURRENT` at it.
    ///
    /// Tallies are written before the pointer moves, so anyone who observes
    /// the new pointer also finds the poll.
    pub async fn create_poll(&self, requested_id: Option<&str>) -> Result<CurrentPoll, VotingError> {
        let poll_id = match requested_id {
            Some(raw) => clean_poll_id(raw)?.to_string(),
            None => format!("poll-{}", Uuid::new_v4()),
        };

        self.store.init_tallies(&poll_id).await?;

        for attempt in 1..=MAX_SWAP_ATTEMPTS {
            let current = self.store.current_poll().await?;
            let expected = current.as_ref().map(|c| c.version);
            let updated_at = Utc::now();

            if self.store.swap_current(expected, &poll_id, updated_at).await? {
                info!("Poll {} is now current", poll_id);
                return Ok(CurrentPoll {
                    poll_id,
                    version: expected.map_or(1, |v| v + 1),
                    updated_at,
                });
            }
            warn!("CURRENT pointer moved under us (attempt {}), retrying", attempt);
        }

        Err(StoreError::Contention(MAX_SWAP_ATTEMPTS).into())
    }

    /// Explicit id if given, otherwise whatever `CURRENT` points at.
    pub async fn resolve_poll_id(&self, explicit: Option<&str>) -> Result<String, VotingError> {
        match explicit {
            Some(raw) => Ok(clean_poll_id(raw)?.to_string()),
            None => self
                .store
                .current_poll()
                .await?
                .map(|c| c.poll_id)
                .ok_or(VotingError::NotFound),
        }
    }

    /// Zero the tallies, then purge the voter roll page by page.
    ///
    /// Tallies go first: a vote racing the reset is still blocked by its old
    /// voter record until that record is purged. Safe to re-run after an
    /// interrupted reset.
    pub async fn reset_poll(&self, poll_id: Option<&str>) -> Result<ResetReport, VotingError> {
        let poll_id = self.resolve_poll_id(poll_id).await?;
        if self.store.get_tallies(&poll_id).await?.is_empty() {
            return Err(VotingError::NotFound);
        }

        for option in VoteOption::ALL {
            self.store.zero_tally(&poll_id, option).await?;
        }

        let mut voters_removed = 0;
        let mut cursor: Option<String> = None;
        loop {
            let step = self.purge_voters_page(&poll_id, cursor.as_deref()).await?;
            voters_removed += step.removed;
            match step.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        info!("Poll {} reset, {} voter record(s) removed", poll_id, voters_removed);
        Ok(ResetReport { poll_id, voters_removed })
    }

    /// Delete one page of voter records after `cursor`. Each page is removed
    /// in a single transaction.
    pub async fn purge_voters_page(&self, poll_id: &str, cursor: Option<&str>) -> Result<PurgeStep, VotingError> {
        let page = self.store.list_voters(poll_id, cursor, self.page_size).await?;
        let removed = if page.voter_keys.is_empty() {
            0
        } else {
            self.store.delete_voters(poll_id, &page.voter_keys).await?
        };

        Ok(PurgeStep { removed, next_cursor: page.next_cursor })
    }

    /// Recompute the poll's tallies from its voter records.
    pub async fn reconcile(&self, poll_id: Option<&str>) -> Result<PollResults, VotingError> {
        let poll_id = self.resolve_poll_id(poll_id).await?;
        let tallies = self.store.recount_tallies(&poll_id).await?;
        if tallies.is_empty() {
            return Err(VotingError::NotFound);
        }

        let results = to_results(&poll_id, tallies);
        info!(
            "Poll {} recounted from voter records: optionA={} optionB={}",
            poll_id,
            results.count_for(VoteOption::OptionA),
            results.count_for(VoteOption::OptionB)
        );
        Ok(results)
    }
}
