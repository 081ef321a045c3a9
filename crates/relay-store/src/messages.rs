use chrono::Utc;
use tracing::{debug, instrument};

use relay_core::{ChatMessage, QuotaPolicy, RelayLimits};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Result of a quota-checked append.
#[derive(Clone, Debug)]
pub enum AppendOutcome {
    Appended(ChatMessage),
    /// The author is at quota and the policy is Reject.
    QuotaExceeded { count: i64 },
}

/// Repository for the bounded message log.
///
/// Every mutation runs as one critical section under the connection lock,
/// so quota validation is never split from the insert it guards and
/// trimming never races a concurrent append.
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message, enforcing the per-author quota atomically.
    ///
    /// The author's retained count is read and acted on under the same lock
    /// hold as the insert. With `QuotaPolicy::EvictOldest` enough of the
    /// author's oldest messages are deleted to land exactly at the quota
    /// after the insert; with `QuotaPolicy::Reject` the outcome reports the
    /// breach and nothing is written. The caller must only start the
    /// sender's cooldown when the outcome is `Appended`.
    #[instrument(skip(self, text), fields(author = %author))]
    pub fn append_with_quota(
        &self,
        author: &str,
        text: &str,
        limits: &RelayLimits,
    ) -> Result<AppendOutcome, StoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE author = ?1",
                [author],
                |row| row.get(0),
            )?;

            if count >= i64::from(limits.max_messages_per_user) {
                match limits.quota_policy {
                    QuotaPolicy::Reject => return Ok(AppendOutcome::QuotaExceeded { count }),
                    QuotaPolicy::EvictOldest => {
                        // The count can sit above the limit when the relay
                        // restarts with a smaller quota; evict enough to
                        // land at the limit after the insert.
                        let excess = count - i64::from(limits.max_messages_per_user) + 1;
                        conn.execute(
                            "DELETE FROM messages WHERE id IN
                                 (SELECT id FROM messages WHERE author = ?1
                                  ORDER BY id ASC LIMIT ?2)",
                            rusqlite::params![author, excess],
                        )?;
                        debug!(author = %author, evicted = excess, "evicted oldest messages for quota");
                    }
                }
            }

            let created_at = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO messages (author, text, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![author, text, created_at],
            )?;
            let id = conn.last_insert_rowid();

            Ok(AppendOutcome::Appended(ChatMessage {
                id,
                author: author.to_string(),
                text: text.to_string(),
                created_at,
            }))
        })
    }

    /// Delete oldest messages until at most `limit` remain. One statement,
    /// so a concurrent append is either fully before or fully after it.
    #[instrument(skip(self))]
    pub fn trim_to_total(&self, limit: u32) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM messages WHERE id NOT IN
                     (SELECT id FROM messages ORDER BY id DESC LIMIT ?1)",
                [limit],
            )?;
            if deleted > 0 {
                debug!(deleted, limit, "trimmed message log");
            }
            Ok(deleted)
        })
    }

    /// Up to `limit` newest messages, returned oldest-first.
    pub fn read_recent(&self, limit: u32) -> Result<Vec<ChatMessage>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, author, text, created_at FROM
                     (SELECT id, author, text, created_at FROM messages
                      ORDER BY id DESC LIMIT ?1)
                 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    /// Empty the log. Votes go with their messages via the cascade.
    pub fn clear(&self) -> Result<usize, StoreError> {
        self.db
            .with_conn(|conn| Ok(conn.execute("DELETE FROM messages", [])?))
    }

    pub fn total(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?)
        })
    }

    pub fn count_by_author(&self, author: &str) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE author = ?1",
                [author],
                |row| row.get(0),
            )?)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<ChatMessage, StoreError> {
    Ok(ChatMessage {
        id: row_helpers::get(row, 0, "messages", "id")?,
        author: row_helpers::get(row, 1, "messages", "author")?,
        text: row_helpers::get(row, 2, "messages", "text")?,
        created_at: row_helpers::get(row, 3, "messages", "created_at")?,
    })
}
