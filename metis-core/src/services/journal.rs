// src/services/journal.rs
//! Journal entries: the one gated write the platform persists.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::services::store::{parse_ts, Store, SQL_NOW};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub entry_id: String,
    pub user_id: String,
    pub text: String,
    pub is_shared: bool,
    pub created_at: DateTime<Utc>,
    pub app_origin: String,
    /// Filled in by a later analysis pass; `{}` on creation.
    pub analysis: Value,
}

/// Fields a journal write accepts after minimization.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub text: String,
    pub is_shared: bool,
}

impl NewEntry {
    /// Read the minimized payload. Missing or blank text is rejected.
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let text = payload
            .get("text")
            .and_then(Value::as_str)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| anyhow!("journal text must be a non-empty string"))?;
        let is_shared = payload.get("isShared").and_then(Value::as_bool).unwrap_or(false);
        Ok(Self { text: text.to_string(), is_shared })
    }
}

pub fn insert(store: &Store, user_id: &str, entry: &NewEntry, app_origin: &str) -> Result<JournalEntry> {
    let entry_id = uuid::Uuid::new_v4().to_string();
    let conn = store.conn()?;
    let created_at: String = conn
        .query_row(
            &format!(
                "INSERT INTO journal_entries(entry_id, user_id, text, is_shared, created_at, app_origin, analysis)
                 VALUES (?1, ?2, ?3, ?4, {SQL_NOW}, ?5, '{{}}')
                 RETURNING created_at"
            ),
            (&entry_id, user_id, &entry.text, entry.is_shared, app_origin),
            |r| r.get(0),
        )
        .with_context(|| format!("inserting journal entry for {user_id}"))?;
    Ok(JournalEntry {
        entry_id,
        user_id: user_id.to_string(),
        text: entry.text.clone(),
        is_shared: entry.is_shared,
        created_at: parse_ts(&created_at)?,
        app_origin: app_origin.to_string(),
        analysis: Value::Object(Default::default()),
    })
}

/// Entries owned by `user_id`, oldest first.
pub fn list_for_user(store: &Store, user_id: &str) -> Result<Vec<JournalEntry>> {
    let conn = store.conn()?;
    let mut stmt = conn.prepare(
        "SELECT entry_id, text, is_shared, created_at, app_origin, analysis
         FROM journal_entries WHERE user_id = ?1 ORDER BY created_at, rowid",
    )?;
    let rows = stmt.query_map([user_id], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, bool>(2)?,
            r.get::<_, String>(3)?,
            r.get::<_, String>(4)?,
            r.get::<_, String>(5)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (entry_id, text, is_shared, created_at, app_origin, analysis) = row?;
        out.push(JournalEntry {
            entry_id,
            user_id: user_id.to_string(),
            text,
            is_shared,
            created_at: parse_ts(&created_at)?,
            app_origin,
            analysis: serde_json::from_str(&analysis).context("journal analysis column")?,
        });
    }
    Ok(out)
}
