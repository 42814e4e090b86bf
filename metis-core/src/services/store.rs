// src/services/store.rs
//! Durable document store on SQLite.
//!
//! - One connection per `Store` handle, guarded by a mutex (single writer per handle).
//! - WAL mode so several handles on the same file can read while one writes.
//! - Every server-assigned timestamp comes from SQLite's clock (`SQL_NOW`), never the caller.
//! - Append-only and one-way status rules are enforced by triggers, not by callers.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Millisecond RFC3339 UTC timestamp evaluated by the store.
pub(crate) const SQL_NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ','now')";

pub struct Store {
    path: PathBuf,
    busy_timeout: Duration,
    conn: Mutex<Connection>,
}

impl Store {
    /// Open/create the database and ensure schema.
    ///
    /// Behavior:
    /// - Creates the parent directory if missing.
    /// - Sets the busy timeout before touching the schema so concurrent openers wait.
    /// - Creates tables, indexes and guard triggers if they don't exist.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create_dir_all({:?})", parent))?;
        }
        let conn = open_connection(path, busy_timeout)?;
        conn.execute_batch(SCHEMA).context("creating store schema")?;
        Ok(Self {
            path: path.to_path_buf(),
            busy_timeout,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("store connection lock poisoned"))
    }

    /// Current time according to the store.
    pub fn now(&self) -> Result<DateTime<Utc>> {
        let conn = self.conn()?;
        store_now(&conn)
    }
}

/// Open a raw connection with the store's pragmas applied. Used by `Store`
/// and by sinks that must write outside the store's own transactions.
pub(crate) fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path).with_context(|| format!("opening store {:?}", path))?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

pub(crate) fn store_now(conn: &Connection) -> Result<DateTime<Utc>> {
    let raw: String = conn.query_row(&format!("SELECT {SQL_NOW}"), [], |r| r.get(0))?;
    parse_ts(&raw)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp {raw:?}"))?
        .with_timezone(&Utc))
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// True for lock contention errors that are worth retrying.
pub(crate) fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(e, _))
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    })
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
  uid             TEXT PRIMARY KEY,   -- identity provider subject id
  email           TEXT,
  display_name    TEXT,
  role            TEXT NOT NULL,      -- primary | partner | unlinked
  partner_id      TEXT,               -- back-reference, kept symmetric by redemption
  created_at      TEXT NOT NULL,
  last_active_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_consents (
  user_id                 TEXT PRIMARY KEY,
  data_processing         INTEGER,    -- NULL = never answered (treated as false)
  sentiment_analysis      INTEGER,
  anonymized_licensing    INTEGER,
  research_participation  INTEGER,
  granted_at              TEXT NOT NULL,
  withdrawn_at            TEXT
);

CREATE TABLE IF NOT EXISTS invites (
  code          TEXT PRIMARY KEY,
  from_user_id  TEXT NOT NULL,
  status        TEXT NOT NULL,        -- pending | completed | expired
  expires_at    TEXT NOT NULL,
  created_at    TEXT NOT NULL,
  accepted_by   TEXT,
  completed_at  TEXT
);

CREATE TABLE IF NOT EXISTS journal_entries (
  entry_id    TEXT PRIMARY KEY,
  user_id     TEXT NOT NULL,
  text        TEXT NOT NULL,
  is_shared   INTEGER NOT NULL,
  created_at  TEXT NOT NULL,
  app_origin  TEXT NOT NULL,
  analysis    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_journal_user ON journal_entries(user_id, created_at);

CREATE TABLE IF NOT EXISTS data_retention (
  user_id                TEXT PRIMARY KEY,
  data_type              TEXT NOT NULL,
  retention_period_days  INTEGER NOT NULL,
  jurisdiction           TEXT NOT NULL,
  created_at             TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_logs (
  seq            INTEGER PRIMARY KEY AUTOINCREMENT,  -- append order
  user_id        TEXT NOT NULL,
  action         TEXT NOT NULL,
  details        TEXT NOT NULL,                      -- JSON object
  resource_id    TEXT,
  resource_type  TEXT,
  ip_address     TEXT NOT NULL,
  user_agent     TEXT NOT NULL,
  timestamp      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
);
CREATE INDEX IF NOT EXISTS idx_audit_user ON audit_logs(user_id, seq);

CREATE TRIGGER IF NOT EXISTS audit_logs_no_update BEFORE UPDATE ON audit_logs
BEGIN SELECT RAISE(ABORT, 'audit_logs is append-only'); END;

CREATE TRIGGER IF NOT EXISTS audit_logs_no_delete BEFORE DELETE ON audit_logs
BEGIN SELECT RAISE(ABORT, 'audit_logs is append-only'); END;

CREATE TRIGGER IF NOT EXISTS invites_terminal_status BEFORE UPDATE OF status ON invites
WHEN OLD.status <> 'pending'
BEGIN SELECT RAISE(ABORT, 'invite status is terminal'); END;
"#;
