/// SQL DDL for the flotilla store.
/// Timestamps are fixed-width RFC 3339 millisecond strings (`...sssZ`), so
/// text comparison orders them chronologically.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS mailboxes (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    stream_id TEXT NOT NULL REFERENCES mailboxes(id),
    seq INTEGER NOT NULL,
    type TEXT NOT NULL,
    payload TEXT NOT NULL,
    causation_id TEXT,
    correlation_id TEXT,
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_events_stream_seq ON events(stream_id, seq);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(type);

CREATE TABLE IF NOT EXISTS cursors (
    id TEXT PRIMARY KEY,
    stream_id TEXT NOT NULL REFERENCES mailboxes(id),
    consumer_id TEXT NOT NULL,
    position INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    UNIQUE(stream_id, consumer_id)
);

CREATE TABLE IF NOT EXISTS locks (
    id TEXT PRIMARY KEY,
    resource_key TEXT NOT NULL,
    holder_id TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at TEXT,
    released_at TEXT,
    status TEXT NOT NULL DEFAULT 'active'
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_locks_one_active
    ON locks(resource_key) WHERE status = 'active';
CREATE INDEX IF NOT EXISTS idx_locks_holder ON locks(holder_id, status);
CREATE INDEX IF NOT EXISTS idx_locks_expiry ON locks(status, expires_at);

CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY,
    mission_id TEXT NOT NULL,
    trigger TEXT NOT NULL,
    progress_percent REAL NOT NULL,
    body TEXT NOT NULL,
    created_by TEXT NOT NULL,
    version INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    consumed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_mission ON checkpoints(mission_id, created_at);

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    agent_type TEXT NOT NULL,
    status TEXT NOT NULL,
    pid INTEGER,
    mailbox_id TEXT NOT NULL REFERENCES mailboxes(id),
    task TEXT NOT NULL,
    config TEXT NOT NULL,
    last_heartbeat_at TEXT,
    recovery_attempts INTEGER NOT NULL DEFAULT 0,
    recovered_from TEXT,
    replaced_by TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);

CREATE TABLE IF NOT EXISTS agent_samples (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id TEXT NOT NULL REFERENCES agents(id),
    cpu_percent REAL NOT NULL,
    memory_bytes INTEGER NOT NULL,
    sampled_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_agent_samples_agent ON agent_samples(agent_id, id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

/// Applied to every connection. `busy_timeout` is set separately from
/// settings.
pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA synchronous = NORMAL;
"#;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
