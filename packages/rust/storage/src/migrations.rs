//! SQL migration definitions for the StreamDigest session database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: sessions, batches, documents",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Selection sessions (full snapshot as JSON, key columns for listing)
CREATE TABLE IF NOT EXISTS sessions (
    id            TEXT PRIMARY KEY,
    range_start   TEXT NOT NULL,
    range_end     TEXT NOT NULL,
    stage         TEXT NOT NULL,
    snapshot_json TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at);

-- Recorded candidate batches, one per (session, artifact, prompt version)
CREATE TABLE IF NOT EXISTS batches (
    session_id      TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    artifact_type   TEXT NOT NULL,
    prompt_version  TEXT NOT NULL,
    candidates_json TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    PRIMARY KEY (session_id, artifact_type, prompt_version)
);

-- Finalized newsletters
CREATE TABLE IF NOT EXISTS documents (
    id            TEXT PRIMARY KEY,
    session_id    TEXT NOT NULL UNIQUE REFERENCES sessions(id) ON DELETE CASCADE,
    document_json TEXT NOT NULL,
    created_at    TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
