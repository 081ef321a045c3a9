/// SQL DDL for the relay database.
/// WAL mode + foreign keys enabled at connection time; votes are deleted
/// with their message via the cascade so trim/evict never orphans rows.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    identity TEXT PRIMARY KEY,
    secret_sha256 TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    author TEXT NOT NULL,
    text TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS votes (
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    voter TEXT NOT NULL,
    kind TEXT NOT NULL,
    cast_at TEXT NOT NULL,
    UNIQUE (message_id, voter)
);

CREATE INDEX IF NOT EXISTS idx_messages_author ON messages(author);
CREATE INDEX IF NOT EXISTS idx_votes_message ON votes(message_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
