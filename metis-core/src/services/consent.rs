//! services/consent.rs
//! Per-user consent record: one current row per user, rewritten on every change.
//!
//! Withdrawal is a rewrite with every flag cleared and `withdrawn_at` set, never a
//! delete. History lives in the audit trail, not in the record.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::commands::context::ClientMeta;
use crate::services::audit::{AuditEvent, Auditor};
use crate::services::store::{format_ts, parse_opt_ts, parse_ts, store_now, Store, SQL_NOW};

/// A named consent flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Permission {
    DataProcessing,
    SentimentAnalysis,
    AnonymizedLicensing,
    ResearchParticipation,
}

impl Permission {
    pub const ALL: [Permission; 4] = [
        Permission::DataProcessing,
        Permission::SentimentAnalysis,
        Permission::AnonymizedLicensing,
        Permission::ResearchParticipation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::DataProcessing => "dataProcessing",
            Permission::SentimentAnalysis => "sentimentAnalysis",
            Permission::AnonymizedLicensing => "anonymizedLicensing",
            Permission::ResearchParticipation => "researchParticipation",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Permission::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown permission: {s}"))
    }
}

/// Fixed schema of optional flags. `None` means never answered and reads as
/// not granted. Unknown keys in incoming JSON are ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_processing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment_analysis: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymized_licensing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub research_participation: Option<bool>,
}

impl Permissions {
    /// Every flag explicitly false.
    pub fn none() -> Self {
        let mut p = Self::default();
        for perm in Permission::ALL {
            p.set(perm, false);
        }
        p
    }

    /// Exactly the listed flags true, the rest explicitly false.
    pub fn granting(perms: &[Permission]) -> Self {
        let mut p = Self::none();
        for perm in perms {
            p.set(*perm, true);
        }
        p
    }

    pub fn is_granted(&self, perm: Permission) -> bool {
        self.get(perm).unwrap_or(false)
    }

    pub fn get(&self, perm: Permission) -> Option<bool> {
        match perm {
            Permission::DataProcessing => self.data_processing,
            Permission::SentimentAnalysis => self.sentiment_analysis,
            Permission::AnonymizedLicensing => self.anonymized_licensing,
            Permission::ResearchParticipation => self.research_participation,
        }
    }

    pub fn set(&mut self, perm: Permission, value: bool) {
        let slot = match perm {
            Permission::DataProcessing => &mut self.data_processing,
            Permission::SentimentAnalysis => &mut self.sentiment_analysis,
            Permission::AnonymizedLicensing => &mut self.anonymized_licensing,
            Permission::ResearchParticipation => &mut self.research_participation,
        };
        *slot = Some(value);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRecord {
    pub user_id: String,
    pub permissions: Permissions,
    pub granted_at: DateTime<Utc>,
    #[serde(default)]
    pub withdrawn_at: Option<DateTime<Utc>>,
}

impl ConsentRecord {
    /// A withdrawal at or after the grant is in force; only a later grant supersedes it.
    pub fn is_withdrawn(&self) -> bool {
        self.withdrawn_at.map(|w| w >= self.granted_at).unwrap_or(false)
    }
}

/// Durable consent records. Single-owner: last writer wins, no optimistic checks.
#[derive(Clone)]
pub struct ConsentStore {
    store: Arc<Store>,
    auditor: Auditor,
}

impl ConsentStore {
    pub fn new(store: Arc<Store>, auditor: Auditor) -> Self {
        Self { store, auditor }
    }

    /// Current record, or `None` if the user never submitted consent.
    pub fn get_current(&self, user_id: &str) -> Result<Option<ConsentRecord>> {
        let conn = self.store.conn()?;
        load(&conn, user_id)
    }

    /// Overwrite the current record with `permissions`, granted now.
    ///
    /// Audits `consent_given` only after the write committed; a failed write
    /// propagates and leaves no audit entry.
    pub fn submit(
        &self,
        client: &ClientMeta,
        user_id: &str,
        permissions: Permissions,
    ) -> Result<ConsentRecord> {
        let record = {
            let conn = self.store.conn()?;
            let granted_at: String = conn
                .query_row(
                    &format!(
                        "INSERT INTO user_consents(user_id, data_processing, sentiment_analysis,
                            anonymized_licensing, research_participation, granted_at, withdrawn_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, {SQL_NOW}, NULL)
                         ON CONFLICT(user_id) DO UPDATE SET
                           data_processing        = excluded.data_processing,
                           sentiment_analysis     = excluded.sentiment_analysis,
                           anonymized_licensing   = excluded.anonymized_licensing,
                           research_participation = excluded.research_participation,
                           granted_at             = excluded.granted_at,
                           withdrawn_at           = NULL
                         RETURNING granted_at"
                    ),
                    (
                        user_id,
                        permissions.data_processing,
                        permissions.sentiment_analysis,
                        permissions.anonymized_licensing,
                        permissions.research_participation,
                    ),
                    |r| r.get(0),
                )
                .with_context(|| format!("writing consent for {user_id}"))?;
            ConsentRecord {
                user_id: user_id.to_string(),
                permissions,
                granted_at: parse_ts(&granted_at)?,
                withdrawn_at: None,
            }
        };
        tracing::info!(user_id, "consent submitted");
        self.auditor
            .log(client, user_id, AuditEvent::ConsentGiven { permissions });
        Ok(record)
    }

    /// Rewrite the current record with every flag false and `withdrawn_at` set to
    /// the commit time. Without a prior record, the grant time equals the
    /// withdrawal time.
    pub fn withdraw(&self, client: &ClientMeta, user_id: &str) -> Result<ConsentRecord> {
        let record = {
            let mut conn = self.store.conn()?;
            let tx = conn.transaction()?;
            let now = store_now(&tx)?;
            let granted_at = load(&tx, user_id)?
                .map(|current| current.granted_at)
                .unwrap_or(now);
            let permissions = Permissions::none();
            tx.execute(
                "INSERT INTO user_consents(user_id, data_processing, sentiment_analysis,
                    anonymized_licensing, research_participation, granted_at, withdrawn_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(user_id) DO UPDATE SET
                   data_processing        = excluded.data_processing,
                   sentiment_analysis     = excluded.sentiment_analysis,
                   anonymized_licensing   = excluded.anonymized_licensing,
                   research_participation = excluded.research_participation,
                   granted_at             = excluded.granted_at,
                   withdrawn_at           = excluded.withdrawn_at",
                (
                    user_id,
                    permissions.data_processing,
                    permissions.sentiment_analysis,
                    permissions.anonymized_licensing,
                    permissions.research_participation,
                    format_ts(&granted_at),
                    format_ts(&now),
                ),
            )
            .with_context(|| format!("withdrawing consent for {user_id}"))?;
            tx.commit()?;
            ConsentRecord {
                user_id: user_id.to_string(),
                permissions,
                granted_at,
                withdrawn_at: Some(now),
            }
        };
        tracing::info!(user_id, "consent withdrawn");
        self.auditor
            .log(client, user_id, AuditEvent::ConsentWithdrawn {});
        Ok(record)
    }
}

fn load(conn: &Connection, user_id: &str) -> Result<Option<ConsentRecord>> {
    let row = conn
        .query_row(
            "SELECT data_processing, sentiment_analysis, anonymized_licensing,
                    research_participation, granted_at, withdrawn_at
             FROM user_consents WHERE user_id = ?1",
            [user_id],
            |r| {
                Ok((
                    Permissions {
                        data_processing: r.get(0)?,
                        sentiment_analysis: r.get(1)?,
                        anonymized_licensing: r.get(2)?,
                        research_participation: r.get(3)?,
                    },
                    r.get::<_, String>(4)?,
                    r.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .optional()
        .with_context(|| format!("reading consent for {user_id}"))?;
    match row {
        None => Ok(None),
        Some((permissions, granted_at, withdrawn_at)) => Ok(Some(ConsentRecord {
            user_id: user_id.to_string(),
            permissions,
            granted_at: parse_ts(&granted_at)?,
            withdrawn_at: parse_opt_ts(withdrawn_at)?,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unanswered_flags_read_as_not_granted() {
        let p: Permissions = serde_json::from_str(
            r#"{ "dataProcessing": true, "marketingEmails": true }"#,
        )
        .unwrap();
        assert!(p.is_granted(Permission::DataProcessing));
        assert!(!p.is_granted(Permission::SentimentAnalysis));
        assert_eq!(p.get(Permission::ResearchParticipation), None);
    }

    #[test]
    fn granting_sets_the_rest_explicitly_false() {
        let p = Permissions::granting(&[Permission::SentimentAnalysis]);
        assert_eq!(p.get(Permission::SentimentAnalysis), Some(true));
        assert_eq!(p.get(Permission::DataProcessing), Some(false));
        assert_eq!(
            serde_json::to_value(p).unwrap(),
            serde_json::json!({
                "dataProcessing": false,
                "sentimentAnalysis": true,
                "anonymizedLicensing": false,
                "researchParticipation": false
            })
        );
    }

    #[test]
    fn permission_names_parse_case_insensitively() {
        assert_eq!("dataprocessing".parse::<Permission>(), Ok(Permission::DataProcessing));
        assert!("telemetry".parse::<Permission>().is_err());
    }
}
