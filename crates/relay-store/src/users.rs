use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::database::Database;
use crate::error::StoreError;

/// Repository for credential rows. Secrets are stored as SHA-256 digests;
/// the relay only ever needs an opaque match/no-match answer.
pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create(&self, identity: &str, secret: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO users (identity, secret_sha256, created_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![identity, digest(secret), Utc::now().to_rfc3339()],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict(format!("user {identity}")));
            }
            Ok(())
        })
    }

    /// Constant answer for unknown identities and wrong secrets alike.
    pub fn verify(&self, identity: &str, secret: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let stored: Option<String> = conn
                .query_row(
                    "SELECT secret_sha256 FROM users WHERE identity = ?1",
                    [identity],
                    |row| row.get(0),
                )
                .ok();
            Ok(stored.is_some_and(|s| s == digest(secret)))
        })
    }

    pub fn exists(&self, identity: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row("SELECT 1 FROM users WHERE identity = ?1", [identity], |_| {
                    Ok(true)
                })
                .unwrap_or(false))
        })
    }
}

fn digest(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}
