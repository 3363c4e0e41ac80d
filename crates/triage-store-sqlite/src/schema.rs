//! SQL schemas for the Triage SQLite backends.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Ticket store DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const STORE_SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- Latest known state per ticket. Later commits overwrite enrichment columns.
CREATE TABLE IF NOT EXISTS enriched_tickets (
    ticket_id        TEXT PRIMARY KEY,
    last_event_id    TEXT,
    subject          TEXT NOT NULL,
    body             TEXT NOT NULL,
    channel          TEXT NOT NULL,   -- 'email' | 'chat' | 'phone'
    priority         TEXT NOT NULL,   -- 'low' | 'normal' | 'high' | 'critical'
    customer_id      TEXT,
    status           TEXT NOT NULL DEFAULT 'pending'
                     CHECK (status IN ('pending', 'enriched', 'failed')),
    summary          TEXT,
    category         TEXT,
    sentiment        TEXT,
    risk             REAL CHECK (risk IS NULL OR (risk >= 0.0 AND risk <= 1.0)),
    suggested_reply  TEXT,
    citations        TEXT NOT NULL DEFAULT '[]',   -- JSON array of citations
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

-- Dedup ledger. Rows are inserted once and never updated or deleted.
CREATE TABLE IF NOT EXISTS processed_events (
    event_id     TEXT PRIMARY KEY,
    processed_at TEXT NOT NULL
);

-- Knowledge base; populated by external ingestion, read-only to the pipeline.
CREATE TABLE IF NOT EXISTS kb_documents (
    doc_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    title      TEXT NOT NULL,
    source     TEXT,
    source_url TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS kb_chunks (
    chunk_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    doc_id       INTEGER NOT NULL REFERENCES kb_documents(doc_id) ON DELETE CASCADE,
    chunk_index  INTEGER NOT NULL,
    heading_path TEXT,
    content      TEXT NOT NULL,
    embedding    BLOB,                        -- little-endian f32 values
    keywords     TEXT NOT NULL DEFAULT '[]'   -- JSON array of terms
);

CREATE INDEX IF NOT EXISTS kb_chunks_doc_idx ON kb_chunks(doc_id);
CREATE INDEX IF NOT EXISTS tickets_status_idx ON enriched_tickets(status);

PRAGMA user_version = 1;
";

/// Event log DDL.
pub const LOG_SCHEMA: &str = "
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS topics (
    name       TEXT PRIMARY KEY,
    partitions INTEGER NOT NULL CHECK (partitions > 0)
);

-- Records are append-only; offsets are dense per (topic, partition).
CREATE TABLE IF NOT EXISTS log_records (
    topic        TEXT NOT NULL REFERENCES topics(name),
    partition_no INTEGER NOT NULL,
    log_offset   INTEGER NOT NULL,
    record_key   TEXT,
    payload      BLOB NOT NULL,
    appended_at  TEXT NOT NULL,
    PRIMARY KEY (topic, partition_no, log_offset)
);

-- Committed position per consumer group: the next offset to deliver.
CREATE TABLE IF NOT EXISTS consumer_offsets (
    group_id     TEXT NOT NULL,
    topic        TEXT NOT NULL,
    partition_no INTEGER NOT NULL,
    next_offset  INTEGER NOT NULL,
    PRIMARY KEY (group_id, topic, partition_no)
);

PRAGMA user_version = 1;
";
