use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::models::{CurrentPoll, Tally, VoteOption, VoterPage, VoterRecord};

/// Key of the single row in `poll_pointer`.
const CURRENT_KEY: &str = "CURRENT";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("gave up after {0} conflicting pointer updates")]
    Contention(u32),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Result of a conditional insert on the voter roll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// Storage primitives for the voter roll, the tallies and the `CURRENT`
/// pointer. All mutual exclusion lives behind these calls.
#[async_trait]
pub trait VoteStore: Send + Sync {
    /// Insert a voter record only if `(poll_id, voter_key)` is absent.
    async fn try_insert_voter(&self, record: &VoterRecord) -> Result<InsertOutcome, StoreError>;

    /// Create the tally at zero if needed, add one, return the new count.
    async fn increment_tally(&self, poll_id: &str, option: VoteOption) -> Result<i64, StoreError>;

    /// Conditional voter insert and tally increment in one transaction.
    async fn record_vote(&self, record: &VoterRecord) -> Result<InsertOutcome, StoreError>;

    async fn get_tallies(&self, poll_id: &str) -> Result<Vec<Tally>, StoreError>;

    /// Write zero tallies for every option, leaving existing rows alone.
    async fn init_tallies(&self, poll_id: &str) -> Result<(), StoreError>;

    async fn zero_tally(&self, poll_id: &str, option: VoteOption) -> Result<(), StoreError>;

    /// Keyset page of voter keys strictly after `after`, in key order.
    async fn list_voters(&self, poll_id: &str, after: Option<&str>, limit: u32) -> Result<VoterPage, StoreError>;

    /// Deleting an absent record is not an error.
    async fn delete_voter(&self, poll_id: &str, voter_key: &str) -> Result<(), StoreError>;

    /// Delete a batch of voter records atomically; returns how many existed.
    async fn delete_voters(&self, poll_id: &str, voter_keys: &[String]) -> Result<u64, StoreError>;

    /// Rewrite every tally of the poll from the voter records.
    async fn recount_tallies(&self, poll_id: &str) -> Result<Vec<Tally>, StoreError>;

    async fn current_poll(&self) -> Result<Option<CurrentPoll>, StoreError>;

    /// Compare-and-swap on the pointer version. `None` means "no pointer yet".
    /// Returns `false` when another writer got there first.
    async fn swap_current(
        &self,
        expected_version: Option<i64>,
        poll_id: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let in_memory = database_url.contains(":memory:");

        let mut options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // An in-memory database lives and dies with its connection, so keep
        // exactly one and never recycle it.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections)
        };

        let pool = pool_options.connect_with(options).await?;

        Self::init_schema(&pool).await?;
        info!("Database ready at {}", database_url);

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn in_memory() -> Self {
        Self::new("sqlite::memory:", 1).await.unwrap()
    }

    async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS voters (
                poll_id TEXT NOT NULL,
                voter_key TEXT NOT NULL,
                option_id TEXT NOT NULL,
                voted_at TEXT NOT NULL,
                PRIMARY KEY (poll_id, voter_key)
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tallies (
                poll_id TEXT NOT NULL,
                option_id TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0 CHECK (count >= 0),
                PRIMARY KEY (poll_id, option_id)
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS poll_pointer (
                key TEXT PRIMARY KEY,
                poll_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}

async fn insert_voter(conn: &mut SqliteConnection, record: &VoterRecord) -> Result<InsertOutcome, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO voters (poll_id, voter_key, option_id, voted_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(poll_id, voter_key) DO NOTHING
        "#,
    )
    .bind(&record.poll_id)
    .bind(&record.voter_key)
    .bind(record.option.as_str())
    .bind(record.voted_at.to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(if result.rows_affected() == 1 {
        InsertOutcome::Inserted
    } else {
        InsertOutcome::AlreadyExists
    })
}

async fn bump_tally(conn: &mut SqliteConnection, poll_id: &str, option: VoteOption) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO tallies (poll_id, option_id, count)
        VALUES (?, ?, 1)
        ON CONFLICT(poll_id, option_id) DO UPDATE SET count = tallies.count + 1
        RETURNING count
        "#,
    )
    .bind(poll_id)
    .bind(option.as_str())
    .fetch_one(&mut *conn)
    .await?;

    Ok(row.get::<i64, _>("count"))
}

async fn fetch_tallies(conn: &mut SqliteConnection, poll_id: &str) -> Result<Vec<Tally>, sqlx::Error> {
    let tallies = sqlx::query(
        r#"
        SELECT poll_id, option_id, count
        FROM tallies
        WHERE poll_id = ?
        ORDER BY option_id
        "#,
    )
    .bind(poll_id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(|row| Tally {
        poll_id: row.get::<String, _>("poll_id"),
        option_id: row.get::<String, _>("option_id"),
        count: row.get::<i64, _>("count"),
    })
    .collect();

    Ok(tallies)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {:?}: {}", raw, e)))
}

#[async_trait]
impl VoteStore for Database {
    async fn try_insert_voter(&self, record: &VoterRecord) -> Result<InsertOutcome, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(insert_voter(&mut conn, record).await?)
    }

    async fn increment_tally(&self, poll_id: &str, option: VoteOption) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(bump_tally(&mut conn, poll_id, option).await?)
    }

    async fn record_vote(&self, record: &VoterRecord) -> Result<InsertOutcome, StoreError> {
        // The voter insert comes first so the write lock is taken before
        // anything is read; concurrent transactions queue on busy_timeout.
        let mut tx = self.pool.begin().await?;

        if insert_voter(&mut tx, record).await? == InsertOutcome::AlreadyExists {
            tx.rollback().await?;
            return Ok(InsertOutcome::AlreadyExists);
        }

        bump_tally(&mut tx, &record.poll_id, record.option).await?;
        tx.commit().await?;

        Ok(InsertOutcome::Inserted)
    }

    async fn get_tallies(&self, poll_id: &str) -> Result<Vec<Tally>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(fetch_tallies(&mut conn, poll_id).await?)
    }

    async fn init_tallies(&self, poll_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for option in VoteOption::ALL {
            sqlx::query(
                r#"
                INSERT INTO tallies (poll_id, option_id, count)
                VALUES (?, ?, 0)
                ON CONFLICT(poll_id, option_id) DO NOTHING
                "#,
            )
            .bind(poll_id)
            .bind(option.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn zero_tally(&self, poll_id: &str, option: VoteOption) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tallies (poll_id, option_id, count)
            VALUES (?, ?, 0)
            ON CONFLICT(poll_id, option_id) DO UPDATE SET count = 0
            "#,
        )
        .bind(poll_id)
        .bind(option.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_voters(&self, poll_id: &str, after: Option<&str>, limit: u32) -> Result<VoterPage, StoreError> {
        let voter_keys: Vec<String> = sqlx::query(
            r#"
            SELECT voter_key
            FROM voters
            WHERE poll_id = ? AND (? IS NULL OR voter_key > ?)
            ORDER BY voter_key
            LIMIT ?
            "#,
        )
        .bind(poll_id)
        .bind(after)
        .bind(after)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| row.get::<String, _>("voter_key"))
        .collect();

        // A short page means the listing is exhausted.
        let next_cursor = if limit > 0 && voter_keys.len() == limit as usize {
            voter_keys.last().cloned()
        } else {
            None
        };

        Ok(VoterPage { voter_keys, next_cursor })
    }

    async fn delete_voter(&self, poll_id: &str, voter_key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM voters WHERE poll_id = ? AND voter_key = ?")
            .bind(poll_id)
            .bind(voter_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_voters(&self, poll_id: &str, voter_keys: &[String]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for voter_key in voter_keys {
            removed += sqlx::query("DELETE FROM voters WHERE poll_id = ? AND voter_key = ?")
                .bind(poll_id)
                .bind(voter_key)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn recount_tallies(&self, poll_id: &str) -> Result<Vec<Tally>, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE tallies
            SET count = (
                SELECT COUNT(*) FROM voters v
                WHERE v.poll_id = tallies.poll_id AND v.option_id = tallies.option_id
            )
            WHERE poll_id = ?
            "#,
        )
        .bind(poll_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO tallies (poll_id, option_id, count)
            SELECT poll_id, option_id, COUNT(*)
            FROM voters
            WHERE poll_id = ?
            GROUP BY poll_id, option_id
            ON CONFLICT(poll_id, option_id) DO NOTHING
            "#,
        )
        .bind(poll_id)
        .execute(&mut *tx)
        .await?;

        let tallies = fetch_tallies(&mut tx, poll_id).await?;
        tx.commit().await?;
        Ok(tallies)
    }

    async fn current_poll(&self) -> Result<Option<CurrentPoll>, StoreError> {
        let row = sqlx::query("SELECT poll_id, version, updated_at FROM poll_pointer WHERE key = ?")
            .bind(CURRENT_KEY)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(CurrentPoll {
                poll_id: row.get::<String, _>("poll_id"),
                version: row.get::<i64, _>("version"),
                updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
            })),
            None => Ok(None),
        }
    }

    async fn swap_current(
        &self,
        expected_version: Option<i64>,
        poll_id: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = match expected_version {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO poll_pointer (key, poll_id, version, updated_at)
                    VALUES (?, ?, 1, ?)
                    ON CONFLICT(key) DO NOTHING
                    "#,
                )
                .bind(CURRENT_KEY)
                .bind(poll_id)
                .bind(updated_at.to_rfc3339())
                .execute(&self.pool)
                .await?
            }
            Some(version) => {
                sqlx::query(
                    r#"
                    UPDATE poll_pointer
                    SET poll_id = ?, version = version + 1, updated_at = ?
                    WHERE key = ? AND version = ?
                    "#,
                )
                .bind(poll_id)
                .bind(updated_at.to_rfc3339())
                .bind(CURRENT_KEY)
                .bind(version)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
impl Database {
    /// Read back one voter record.
    pub async fn get_voter(&self, poll_id: &str, voter_key: &str) -> Result<Option<VoterRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT poll_id, voter_key, option_id, voted_at
            FROM voters
            WHERE poll_id = ? AND voter_key = ?
            "#,
        )
        .bind(poll_id)
        .bind(voter_key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let option_id = row.get::<String, _>("option_id");
        let option = option_id.parse::<VoteOption>().map_err(StoreError::Corrupt)?;

        Ok(Some(VoterRecord {
            poll_id: row.get::<String, _>("poll_id"),
            voter_key: row.get::<String, _>("voter_key"),
            option,
            voted_at: parse_timestamp(&row.get::<String, _>("voted_at"))?,
        }))
    }
}
