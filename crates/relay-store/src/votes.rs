use chrono::Utc;
use tracing::instrument;

use relay_core::{VoteCounts, VoteKind};

use crate::database::Database;
use crate::error::StoreError;

/// Repository for the vote relation: at most one row per
/// (message, voter) pair, upsert semantics.
pub struct VoteRepo {
    db: Database,
}

impl VoteRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a vote, overwriting any prior vote by the same voter on the
    /// same message, and return the new aggregate counts. Upsert and
    /// recount share one lock hold so counts never reflect a half-applied
    /// vote.
    #[instrument(skip(self), fields(message_id, voter = %voter))]
    pub fn cast(
        &self,
        message_id: i64,
        voter: &str,
        kind: VoteKind,
    ) -> Result<VoteCounts, StoreError> {
        self.db.with_conn(|conn| {
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM messages WHERE id = ?1",
                    [message_id],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            if !exists {
                return Err(StoreError::NotFound(format!("message {message_id}")));
            }

            conn.execute(
                "INSERT INTO votes (message_id, voter, kind, cast_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (message_id, voter)
                 DO UPDATE SET kind = excluded.kind, cast_at = excluded.cast_at",
                rusqlite::params![message_id, voter, kind.as_str(), Utc::now().to_rfc3339()],
            )?;

            counts_locked(conn, message_id)
        })
    }

    /// Aggregate counts for one message.
    pub fn counts(&self, message_id: i64) -> Result<VoteCounts, StoreError> {
        self.db.with_conn(|conn| counts_locked(conn, message_id))
    }
}

fn counts_locked(conn: &rusqlite::Connection, message_id: i64) -> Result<VoteCounts, StoreError> {
    let (approve_count, disapprove_count) = conn.query_row(
        "SELECT
             COUNT(*) FILTER (WHERE kind = 'approve'),
             COUNT(*) FILTER (WHERE kind = 'disapprove')
         FROM votes WHERE message_id = ?1",
        [message_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(VoteCounts {
        message_id,
        approve_count,
        disapprove_count,
    })
}
