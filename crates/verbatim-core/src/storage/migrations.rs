//! Database Migrations
//!
//! Schema migration definitions for the shared SQLite database. One file
//! backs everything durable: documents, the FTS5 index, embeddings, task
//! rows, inter-agent messages, and the optimizer context log.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Documents with FTS5 porter index and embeddings",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Task store: tasks, messages, dead letters",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Append-only optimizer context log",
        up: MIGRATION_V3_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Documents, FTS5 keyword index, embedding rows
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL,
    applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    channel TEXT NOT NULL,
    published_at TEXT NOT NULL,
    body TEXT NOT NULL,
    tokens TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_documents_channel ON documents(channel);
CREATE INDEX IF NOT EXISTS idx_documents_published ON documents(published_at);

-- Porter tokenizer: stemmed keyword recall at the index level
CREATE VIRTUAL TABLE IF NOT EXISTS documents_fts USING fts5(
    id, body, channel,
    content='documents',
    content_rowid='rowid',
    tokenize='porter ascii'
);

CREATE TRIGGER IF NOT EXISTS documents_ai AFTER INSERT ON documents BEGIN
    INSERT INTO documents_fts(rowid, id, body, channel)
    VALUES (NEW.rowid, NEW.id, NEW.body, NEW.channel);
END;

CREATE TRIGGER IF NOT EXISTS documents_ad AFTER DELETE ON documents BEGIN
    INSERT INTO documents_fts(documents_fts, rowid, id, body, channel)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.body, OLD.channel);
END;

CREATE TRIGGER IF NOT EXISTS documents_au AFTER UPDATE ON documents BEGIN
    INSERT INTO documents_fts(documents_fts, rowid, id, body, channel)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.body, OLD.channel);
    INSERT INTO documents_fts(rowid, id, body, channel)
    VALUES (NEW.rowid, NEW.id, NEW.body, NEW.channel);
END;

-- Embedding vectors for the semantic fallback index, JSON-encoded f32 arrays
CREATE TABLE IF NOT EXISTS embeddings (
    document_id TEXT PRIMARY KEY REFERENCES documents(id) ON DELETE CASCADE,
    vector TEXT NOT NULL,
    dims INTEGER NOT NULL
);

INSERT INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: Task runtime tables
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    agent_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    config TEXT NOT NULL DEFAULT '{}',
    result TEXT,
    error TEXT,
    progress REAL NOT NULL DEFAULT 0.0,
    attempt INTEGER NOT NULL DEFAULT 1,
    retry_of TEXT,
    cancel_requested INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_agent_type ON tasks(agent_type);
CREATE INDEX IF NOT EXISTS idx_tasks_retry_of ON tasks(retry_of);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    from_agent TEXT NOT NULL,
    to_agent TEXT NOT NULL,
    task_id TEXT,
    content TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    seq INTEGER NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0,
    dedup_key TEXT
);

-- Send-order delivery per recipient
CREATE INDEX IF NOT EXISTS idx_messages_inbox ON messages(to_agent, processed, seq);
-- At-least-once transport, logically exactly-once: duplicate sends collapse here
CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_dedup
    ON messages(to_agent, dedup_key) WHERE dedup_key IS NOT NULL;

CREATE TABLE IF NOT EXISTS message_seq (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    next INTEGER NOT NULL
);
INSERT OR IGNORE INTO message_seq (id, next) VALUES (1, 1);

CREATE TABLE IF NOT EXISTS dead_letters (
    id TEXT PRIMARY KEY,
    from_agent TEXT NOT NULL,
    to_agent TEXT NOT NULL,
    content TEXT NOT NULL,
    reason TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

/// V3: Optimizer context log (append-only, best-effort writes)
const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS optimizer_context (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    original TEXT NOT NULL,
    optimized TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_optimizer_context_original ON optimizer_context(original);

UPDATE schema_version SET version = 3, applied_at = datetime('now');
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );

            // execute_batch handles multi-statement SQL including triggers
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn migrations_apply_cleanly() {
        let conn = Connection::open_in_memory().unwrap();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied as usize, MIGRATIONS.len());
        assert_eq!(get_current_version(&conn).unwrap(), 3);
    }

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied, 0);
    }

    #[test]
    fn versions_are_strictly_increasing() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }
}
