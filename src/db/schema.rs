/// Schema for the cache and task tables. Timestamps are unix milliseconds.
pub const SCHEMA: &str = r#"
-- Key/value cache, partitioned by namespace
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    entry_type TEXT NOT NULL,
    value BLOB NOT NULL,
    size_bytes INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER,
    PRIMARY KEY (namespace, key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_type
    ON cache_entries(namespace, entry_type);

CREATE INDEX IF NOT EXISTS idx_cache_entries_expiry
    ON cache_entries(namespace, expires_at);

-- Deferred work waiting for connectivity
CREATE TABLE IF NOT EXISTS sync_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tag TEXT NOT NULL,
    payload TEXT NOT NULL,
    content_key TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    scheduled_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_tasks_status ON sync_tasks(status, id);
CREATE INDEX IF NOT EXISTS idx_sync_tasks_key ON sync_tasks(content_key, status);
"#;
