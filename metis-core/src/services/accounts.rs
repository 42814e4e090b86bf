// src/services/accounts.rs
//! User accounts and their retention records.
//!
//! Accounts are created on first onboarding and never deleted here. The partner
//! link is only ever written by invite redemption.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::RetentionConfig;
use crate::services::store::{parse_ts, Store, SQL_NOW};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    Partner,
    Unlinked,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Partner => "partner",
            Role::Unlinked => "unlinked",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "primary" => Ok(Role::Primary),
            "partner" => Ok(Role::Partner),
            "unlinked" => Ok(Role::Unlinked),
            other => Err(anyhow!("unknown role {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub role: Role,
    pub partner_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionRecord {
    pub user_id: String,
    pub data_type: String,
    pub retention_period_days: u32,
    pub jurisdiction: String,
    pub created_at: DateTime<Utc>,
}

/// Create or refresh `uid`'s account and make sure it has a retention record.
///
/// - First call inserts the account with role `primary`.
/// - Later calls refresh email, display name and `last_active_at`; role and
///   partner link are left alone.
/// - The retention record is written once and never overwritten.
pub fn onboard(
    store: &Store,
    uid: &str,
    email: Option<&str>,
    display_name: Option<&str>,
    retention: &RetentionConfig,
) -> Result<UserAccount> {
    let mut conn = store.conn()?;
    let tx = conn.transaction()?;
    tx.execute(
        &format!(
            "INSERT INTO users(uid, email, display_name, role, partner_id, created_at, last_active_at)
             VALUES (?1, ?2, ?3, 'primary', NULL, {SQL_NOW}, {SQL_NOW})
             ON CONFLICT(uid) DO UPDATE SET
               email          = excluded.email,
               display_name   = excluded.display_name,
               last_active_at = excluded.last_active_at"
        ),
        (uid, email, display_name),
    )
    .with_context(|| format!("upserting user {uid}"))?;
    tx.execute(
        &format!(
            "INSERT OR IGNORE INTO data_retention(user_id, data_type, retention_period_days, jurisdiction, created_at)
             VALUES (?1, ?2, ?3, ?4, {SQL_NOW})"
        ),
        (uid, &retention.data_type, retention.period_days, &retention.jurisdiction),
    )
    .with_context(|| format!("seeding retention record for {uid}"))?;
    let account = load(&tx, uid)?.ok_or_else(|| anyhow!("user {uid} vanished after upsert"))?;
    tx.commit()?;
    Ok(account)
}

pub fn get(store: &Store, uid: &str) -> Result<Option<UserAccount>> {
    let conn = store.conn()?;
    load(&conn, uid)
}

pub fn retention_record(store: &Store, uid: &str) -> Result<Option<RetentionRecord>> {
    let conn = store.conn()?;
    let row = conn
        .query_row(
            "SELECT data_type, retention_period_days, jurisdiction, created_at
             FROM data_retention WHERE user_id = ?1",
            [uid],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, u32>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;
    row.map(|(data_type, days, jurisdiction, created_at)| {
        Ok(RetentionRecord {
            user_id: uid.to_string(),
            data_type,
            retention_period_days: days,
            jurisdiction,
            created_at: parse_ts(&created_at)?,
        })
    })
    .transpose()
}

/// Read an account on any connection, including inside a transaction.
pub(crate) fn load(conn: &Connection, uid: &str) -> Result<Option<UserAccount>> {
    let row = conn
        .query_row(
            "SELECT email, display_name, role, partner_id, created_at, last_active_at
             FROM users WHERE uid = ?1",
            [uid],
            |r| {
                Ok((
                    r.get::<_, Option<String>>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                ))
            },
        )
        .optional()
        .with_context(|| format!("reading user {uid}"))?;
    row.map(|(email, display_name, role, partner_id, created_at, last_active_at)| {
        Ok(UserAccount {
            uid: uid.to_string(),
            email,
            display_name,
            role: role.parse()?,
            partner_id,
            created_at: parse_ts(&created_at)?,
            last_active_at: parse_ts(&last_active_at)?,
        })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn re_onboarding_keeps_role_and_retention() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("m.db"), Duration::from_millis(500)).unwrap();
        let retention = RetentionConfig::default();

        let first = onboard(&store, "U1", Some("a@example.com"), None, &retention).unwrap();
        assert_eq!(first.role, Role::Primary);

        store
            .conn()
            .unwrap()
            .execute("UPDATE users SET role='partner', partner_id='U9' WHERE uid='U1'", [])
            .unwrap();

        let custom = RetentionConfig { period_days: 30, ..RetentionConfig::default() };
        let again = onboard(&store, "U1", Some("b@example.com"), Some("Bea"), &custom).unwrap();
        assert_eq!(again.role, Role::Partner);
        assert_eq!(again.partner_id.as_deref(), Some("U9"));
        assert_eq!(again.email.as_deref(), Some("b@example.com"));
        assert_eq!(again.created_at, first.created_at);

        let rec = retention_record(&store, "U1").unwrap().unwrap();
        assert_eq!(rec.retention_period_days, 2555);
        assert_eq!(rec.jurisdiction, "OTHER");
        assert_eq!(rec.data_type, "personal");
    }
}
