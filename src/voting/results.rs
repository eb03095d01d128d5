use std::sync::Arc;

use crate::db::VoteStore;
use crate::models::{OptionCount, PollResults, Tally, VoteOption};
use crate::voting::{clean_poll_id, VotingError};

/// Read-only view of the tallies.
///
/// Reads are not serialized against votes; a count may trail a vote that is
/// committing at the same moment by one read.
pub struct ResultsReader {
    store: Arc<dyn VoteStore>,
}

impl ResultsReader {
    pub fn new(store: Arc<dyn VoteStore>) -> Self {
        Self { store }
    }

    pub async fn get_results(&self, poll_id: &str) -> Result<PollResults, VotingError> {
        let poll_id = clean_poll_id(poll_id)?;
        let tallies = self.store.get_tallies(poll_id).await?;
        Ok(to_results(poll_id, tallies))
    }
}

/// Known options first, in fixed order and defaulting to zero; any other
/// stored option follows by id.
pub(crate) fn to_results(poll_id: &str, mut tallies: Vec<Tally>) -> PollResults {
    let mut results: Vec<OptionCount> = VoteOption::ALL
        .iter()
        .map(|option| {
            let count = tallies
                .iter()
                .position(|t| t.option_id == option.as_str())
                .map(|i| tallies.swap_remove(i).count)
                .unwrap_or(0);
            OptionCount { option_id: option.as_str().to_string(), count }
        })
        .collect();

    tallies.sort_by(|a, b| a.option_id.cmp(&b.option_id));
    results.extend(tallies.into_iter().map(|t| OptionCount {
        option_id: t.option_id,
        count: t.count,
    }));

    PollResults { poll_id: poll_id.to_string(), results }
}
