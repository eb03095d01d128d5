use log::{debug, info};
use std::sync::Arc;

use crate::db::{InsertOutcome, VoteStore};
use crate::identity::{Pepper, VoterCredential};
use crate::models::{VoteOption, VoterRecord};
use crate::voting::{clean_poll_id, VoteOutcome, VotingError};

/// Exactly-once vote recording on top of a [`VoteStore`].
pub struct VoteLedger {
    store: Arc<dyn VoteStore>,
    pepper: Pepper,
}

impl VoteLedger {
    pub fn new(store: Arc<dyn VoteStore>, pepper: Pepper) -> Self {
        Self { store, pepper }
    }

    /// Register the voter and count their vote, or neither.
    ///
    /// All input is validated before storage is touched. A repeat submission
    /// for the same poll and voter returns [`VoteOutcome::AlreadyVoted`]
    /// whatever option it names; the first stored option is never changed.
    pub async fn submit_vote(
        &self,
        poll_id: &str,
        option_id: &str,
        credential: &VoterCredential,
    ) -> Result<VoteOutcome, VotingError> {
        let poll_id = clean_poll_id(poll_id)?;
        let option = option_id
            .parse::<VoteOption>()
            .map_err(|_| VotingError::InvalidOption(option_id.to_string()))?;
        let voter_key = credential.resolve(&self.pepper)?;

        let record = VoterRecord::new(poll_id, voter_key.as_str(), option);
        match self.store.record_vote(&record).await? {
            InsertOutcome::Inserted => {
                info!("Vote recorded in poll {} for {}", poll_id, option);
                debug!("Voter {}… registered in poll {}", voter_key.short(), poll_id);
                Ok(VoteOutcome::Recorded)
            }
            InsertOutcome::AlreadyExists => {
                info!("Duplicate vote ignored in poll {}", poll_id);
                Ok(VoteOutcome::AlreadyVoted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::identity::IdentityError;

    async fn setup() -> (Arc<Database>, Arc<VoteLedger>) {
        let db = Arc::new(Database::in_memory().await);
        let pepper = Pepper::new("ledger-test").unwrap();
        let ledger = Arc::new(VoteLedger::new(db.clone(), pepper));
        (db, ledger)
    }

    /// WAL file database behind a multi-connection pool, as deployed.
    async fn setup_file_backed(dir: &tempfile::TempDir) -> (Arc<Database>, Arc<VoteLedger>) {
        let url = format!("sqlite:{}", dir.path().join("ledger.db").display());
        let db = Arc::new(Database::new(&url, 5).await.unwrap());
        let pepper = Pepper::new("ledger-test").unwrap();
        let ledger = Arc::new(VoteLedger::new(db.clone(), pepper));
        (db, ledger)
    }

    async fn count(db: &Database, poll_id: &str, option: VoteOption) -> i64 {
        db.get_tallies(poll_id)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.option_id == option.as_str())
            .map(|t| t.count)
            .unwrap_or(0)
    }

    fn id_number(raw: &str) -> VoterCredential {
        VoterCredential::IdNumber(raw.to_string())
    }

    #[tokio::test]
    async fn second_vote_from_same_id_is_already_voted() {
        let (db, ledger) = setup().await;
        let voter = id_number("123456782");

        let first = ledger.submit_vote("p1", "optionA", &voter).await.unwrap();
        assert_eq!(first, VoteOutcome::Recorded);
        assert_eq!(count(&db, "p1", VoteOption::OptionA).await, 1);

        let second = ledger.submit_vote("p1", "optionA", &voter).await.unwrap();
        assert_eq!(second, VoteOutcome::AlreadyVoted);
        assert_eq!(count(&db, "p1", VoteOption::OptionA).await, 1);
    }

    #[tokio::test]
    async fn later_option_is_ignored_for_existing_voter() {
        let (db, ledger) = setup().await;
        let voter = VoterCredential::VoterKey("browser-token".to_string());

        ledger.submit_vote("p1", "optionB", &voter).await.unwrap();
        let again = ledger.submit_vote("p1", "optionA", &voter).await.unwrap();
        assert_eq!(again, VoteOutcome::AlreadyVoted);

        assert_eq!(count(&db, "p1", VoteOption::OptionA).await, 0);
        assert_eq!(count(&db, "p1", VoteOption::OptionB).await, 1);
        let stored = db.get_voter("p1", "browser-token").await.unwrap().unwrap();
        assert_eq!(stored.option, VoteOption::OptionB);
    }

    #[tokio::test]
    async fn formatting_variants_of_one_id_collide() {
        let (_db, ledger) = setup().await;

        let first = ledger.submit_vote("p1", "optionA", &id_number("12345678-2")).await.unwrap();
        let second = ledger.submit_vote("p1", "optionB", &id_number(" 123 456 782")).await.unwrap();
        assert_eq!(first, VoteOutcome::Recorded);
        assert_eq!(second, VoteOutcome::AlreadyVoted);
    }

    #[tokio::test]
    async fn invalid_input_fails_before_any_write() {
        let (db, ledger) = setup().await;

        let err = ledger.submit_vote("p1", "optionC", &id_number("123456782")).await.unwrap_err();
        assert!(matches!(err, VotingError::InvalidOption(ref o) if o == "optionC"));

        let err = ledger.submit_vote("p1", "optionA", &id_number("123456789")).await.unwrap_err();
        assert!(matches!(err, VotingError::InvalidIdentifier(IdentityError::InvalidChecksum)));

        let err = ledger.submit_vote("  ", "optionA", &id_number("123456782")).await.unwrap_err();
        assert!(matches!(err, VotingError::InvalidPollId));
        assert!(!err.is_retryable());

        assert!(db.get_tallies("p1").await.unwrap().is_empty());
        assert!(db.list_voters("p1", None, 10).await.unwrap().voter_keys.is_empty());
    }

    #[tokio::test]
    async fn concurrent_distinct_voters_are_all_counted() {
        let (db, ledger) = setup().await;

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                tokio::spawn(async move {
                    let voter = VoterCredential::VoterKey(format!("voter-{i}"));
                    ledger.submit_vote("p1", "optionA", &voter).await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), VoteOutcome::Recorded);
        }
        assert_eq!(count(&db, "p1", VoteOption::OptionA).await, 50);
    }

    #[tokio::test]
    async fn concurrent_retries_of_one_voter_count_once() {
        let (db, ledger) = setup().await;

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                let option = if i % 2 == 0 { "optionA" } else { "optionB" };
                tokio::spawn(async move {
                    ledger.submit_vote("p1", option, &id_number("123456782")).await
                })
            })
            .collect();

        let mut recorded = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() == VoteOutcome::Recorded {
                recorded += 1;
            }
        }
        assert_eq!(recorded, 1);

        let total = count(&db, "p1", VoteOption::OptionA).await + count(&db, "p1", VoteOption::OptionB).await;
        assert_eq!(total, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn pooled_file_database_counts_every_distinct_voter_once() {
        let dir = tempfile::tempdir().unwrap();
        let (db, ledger) = setup_file_backed(&dir).await;

        // each of 50 voters submits twice, all at once
        let handles: Vec<_> = (0..100)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                tokio::spawn(async move {
                    let voter = VoterCredential::VoterKey(format!("voter-{}", i % 50));
                    ledger.submit_vote("p1", "optionA", &voter).await
                })
            })
            .collect();

        let (mut recorded, mut duplicates) = (0, 0);
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                VoteOutcome::Recorded => recorded += 1,
                VoteOutcome::AlreadyVoted => duplicates += 1,
            }
        }

        assert_eq!(recorded, 50);
        assert_eq!(duplicates, 50);
        assert_eq!(count(&db, "p1", VoteOption::OptionA).await, 50);
        assert_eq!(db.list_voters("p1", None, 100).await.unwrap().voter_keys.len(), 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn pooled_file_database_counts_one_voters_retries_once() {
        let dir = tempfile::tempdir().unwrap();
        let (db, ledger) = setup_file_backed(&dir).await;

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                let option = if i % 2 == 0 { "optionA" } else { "optionB" };
                tokio::spawn(async move {
                    ledger.submit_vote("p1", option, &id_number("123456782")).await
                })
            })
            .collect();

        let mut recorded = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() == VoteOutcome::Recorded {
                recorded += 1;
            }
        }
        assert_eq!(recorded, 1);

        let total = count(&db, "p1", VoteOption::OptionA).await + count(&db, "p1", VoteOption::OptionB).await;
        assert_eq!(total, 1);
    }
}
