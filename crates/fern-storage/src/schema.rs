use rusqlite::Connection;

/// Tables, FTS5 shadow indexes, and sync triggers for the five persisted
/// record types (spec §4.A): summaries, memories, scheduled_jobs,
/// subagent_tasks, thread_sessions. Every statement is `IF NOT EXISTS` so
/// opening an existing database is a no-op.
const SCHEMA_SQL: &str = r#"
PRAGMA foreign_keys = ON;
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS thread_sessions (
    thread_id   TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL,
    share_url   TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS summaries (
    chunk_id          TEXT PRIMARY KEY,
    thread_id         TEXT NOT NULL,
    session_id        TEXT NOT NULL,
    summary           TEXT NOT NULL,
    token_count       INTEGER NOT NULL,
    message_count     INTEGER NOT NULL,
    first_message_id  TEXT NOT NULL,
    last_message_id   TEXT NOT NULL,
    first_ts          TEXT NOT NULL,
    last_ts           TEXT NOT NULL,
    created_at        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_summaries_thread ON summaries (thread_id, created_at);

CREATE VIRTUAL TABLE IF NOT EXISTS summaries_fts USING fts5(
    summary,
    content = 'summaries',
    content_rowid = 'rowid',
    tokenize = 'porter unicode61'
);

CREATE TABLE IF NOT EXISTS summary_vectors (
    chunk_id   TEXT PRIMARY KEY REFERENCES summaries (chunk_id) ON DELETE CASCADE,
    embedding  BLOB NOT NULL
);

DROP TRIGGER IF EXISTS summaries_after_insert;
DROP TRIGGER IF EXISTS summaries_after_delete;
DROP TRIGGER IF EXISTS summaries_after_update;

CREATE TRIGGER summaries_after_insert AFTER INSERT ON summaries BEGIN
    INSERT INTO summaries_fts (rowid, summary) VALUES (new.rowid, new.summary);
END;
CREATE TRIGGER summaries_after_delete AFTER DELETE ON summaries BEGIN
    INSERT INTO summaries_fts (summaries_fts, rowid, summary) VALUES ('delete', old.rowid, old.summary);
END;
CREATE TRIGGER summaries_after_update AFTER UPDATE ON summaries BEGIN
    INSERT INTO summaries_fts (summaries_fts, rowid, summary) VALUES ('delete', old.rowid, old.summary);
    INSERT INTO summaries_fts (rowid, summary) VALUES (new.rowid, new.summary);
END;

CREATE TABLE IF NOT EXISTS memories (
    id          TEXT PRIMARY KEY,
    type        TEXT NOT NULL,
    content     TEXT NOT NULL,
    tags        TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memories_type ON memories (type, created_at);

CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    content,
    content = 'memories',
    content_rowid = 'rowid',
    tokenize = 'porter unicode61'
);

CREATE TABLE IF NOT EXISTS memory_vectors (
    memory_id  TEXT PRIMARY KEY REFERENCES memories (id) ON DELETE CASCADE,
    embedding  BLOB NOT NULL
);

DROP TRIGGER IF EXISTS memories_after_insert;
DROP TRIGGER IF EXISTS memories_after_delete;
DROP TRIGGER IF EXISTS memories_after_update;

CREATE TRIGGER memories_after_insert AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts (rowid, content) VALUES (new.rowid, new.content);
END;
CREATE TRIGGER memories_after_delete AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts (memories_fts, rowid, content) VALUES ('delete', old.rowid, old.content);
END;
CREATE TRIGGER memories_after_update AFTER UPDATE ON memories BEGIN
    INSERT INTO memories_fts (memories_fts, rowid, content) VALUES ('delete', old.rowid, old.content);
    INSERT INTO memories_fts (rowid, content) VALUES (new.rowid, new.content);
END;

CREATE TABLE IF NOT EXISTS scheduled_jobs (
    id                 TEXT PRIMARY KEY,
    job_type           TEXT NOT NULL,
    status             TEXT NOT NULL,
    prompt             TEXT NOT NULL,
    scheduled_at       TEXT NOT NULL,
    cron_expr          TEXT,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL,
    completed_at       TEXT,
    last_run_response  TEXT,
    last_error         TEXT,
    metadata           TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_jobs_status_sched ON scheduled_jobs (status, scheduled_at);

CREATE TABLE IF NOT EXISTS subagent_tasks (
    id                 TEXT PRIMARY KEY,
    agent_type         TEXT NOT NULL,
    status             TEXT NOT NULL,
    prompt             TEXT NOT NULL,
    parent_session_id  TEXT NOT NULL,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL,
    completed_at       TEXT,
    result             TEXT,
    error              TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON subagent_tasks (status, created_at);
"#;

pub(crate) fn apply(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)
}
