//! services/audit.rs
//! Append-only compliance audit trail.
//!
//! - Every compliance-relevant action becomes one [`AuditLogEntry`] with a typed [`AuditEvent`].
//! - Timestamps are assigned by the sink's backend, never by the caller.
//! - Emission is best-effort: [`emit`] never returns an error. Failures are reported
//!   on the operational log channel and the triggering operation carries on.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::commands::context::ClientMeta;
use crate::config::{AuditBackend, AuditConfig};
use crate::services::consent::{Permission, Permissions};
use crate::services::store::{open_connection, parse_ts, Store};
use crate::utils::logbook::{append_jsonl, read_jsonl};

// ----------- Events -----------

/// One variant per audited action kind. Serialized adjacently tagged as
/// `{ "action": "<tag>", "details": { .. } }`, detail keys in camelCase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "action",
    content = "details",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum AuditEvent {
    UserOnboarded {
        email: Option<String>,
        display_name: Option<String>,
    },
    ConsentGiven {
        permissions: Permissions,
    },
    ConsentWithdrawn {},
    ConsentGateEvaluated {
        action: String,
        permissions: Vec<Permission>,
        decision: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Minimizer output for denied writes; never the original content.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    JournalEntryCreated {
        is_shared: bool,
        text_length: usize,
        has_consent: bool,
    },
    JournalEntryCreateFailed {
        error: String,
    },
    SentimentAnalysisRequested {
        text_length: usize,
        has_consent: bool,
    },
    SentimentAnalysisCompleted {
        has_result: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        risk_level: Option<String>,
    },
    SentimentAnalysisFailed {
        kind: String,
        error: String,
    },
    PartnerInviteIssued {
        invite_code: String,
        expires_at: String,
    },
    PartnerAcceptedInvite {
        invite_code: String,
    },
    PartnerInviteFailed {
        invite_code: String,
        kind: String,
        error: String,
        committed_state_change: bool,
    },
    ResearchAnonymizationRequested {
        status: String,
    },
}

impl AuditEvent {
    /// Split into the `(action, details)` pair that is persisted.
    pub fn to_parts(&self) -> Result<(String, Value)> {
        let mut v = serde_json::to_value(self)?;
        let action = v
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("audit event without action tag"))?
            .to_string();
        let details = v
            .get_mut("details")
            .map(Value::take)
            .unwrap_or_else(|| json!({}));
        Ok((action, details))
    }

    pub fn from_parts(action: &str, details: &Value) -> Option<Self> {
        serde_json::from_value(json!({ "action": action, "details": details })).ok()
    }
}

/// A single entry handed to a sink. The timestamp is not part of it: the
/// backend assigns it on append.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub user_id: String,
    #[serde(flatten)]
    pub event: AuditEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    pub ip_address: String,
    pub user_agent: String,
}

impl AuditLogEntry {
    pub fn with_resource(mut self, id: impl Into<String>, kind: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self.resource_type = Some(kind.into());
        self
    }
}

/// An entry as read back from the trail. Unknown detail keys are kept in
/// `details` and ignored by [`AuditRecord::event`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub seq: i64,
    pub user_id: String,
    pub action: String,
    pub details: Value,
    pub resource_id: Option<String>,
    pub resource_type: Option<String>,
    pub ip_address: String,
    pub user_agent: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn event(&self) -> Option<AuditEvent> {
        AuditEvent::from_parts(&self.action, &self.details)
    }
}

// ----------- Sinks -----------

/// Durable, append-only recorder of audit entries.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditLogEntry) -> Result<()>;
}

/// Record `entry`, swallowing any failure into the operational log.
pub fn emit(sink: &dyn AuditSink, entry: &AuditLogEntry) {
    if let Err(err) = sink.record(entry) {
        tracing::error!(
            error = ?err,
            user_id = %entry.user_id,
            action = ?entry.event.to_parts().map(|(a, _)| a).ok(),
            "audit logging failed"
        );
    }
}

/// Writes into the store's `audit_logs` table over its own connection, so an
/// append never participates in (or rolls back with) a business transaction.
pub struct SqliteAuditSink {
    conn: Mutex<Connection>,
}

impl SqliteAuditSink {
    pub fn for_store(store: &Store) -> Result<Self> {
        let conn = open_connection(store.path(), store.busy_timeout())?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

impl AuditSink for SqliteAuditSink {
    fn record(&self, entry: &AuditLogEntry) -> Result<()> {
        let (action, details) = entry.event.to_parts()?;
        let conn = self.conn.lock().map_err(|_| anyhow!("audit sink lock poisoned"))?;
        conn.execute(
            "INSERT INTO audit_logs(user_id, action, details, resource_id, resource_type, ip_address, user_agent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            (
                &entry.user_id,
                &action,
                details.to_string(),
                &entry.resource_id,
                &entry.resource_type,
                &entry.ip_address,
                &entry.user_agent,
            ),
        )
        .with_context(|| format!("appending audit entry {action}"))?;
        Ok(())
    }
}

/// Append-only JSONL file. The timestamp is taken at append time under the
/// sink's lock, so file order and timestamp order agree.
pub struct JsonlAuditSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn read_all(&self) -> Result<Vec<Value>> {
        read_jsonl(&self.path)
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, entry: &AuditLogEntry) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("audit sink lock poisoned"))?;
        let mut line = serde_json::to_value(entry)?;
        if let Some(obj) = line.as_object_mut() {
            obj.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        }
        append_jsonl(&self.path, &line)
    }
}

/// Used when auditing is disabled in config.
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _entry: &AuditLogEntry) -> Result<()> {
        Ok(())
    }
}

/// Build the sink selected by config.
pub fn sink_from_config(cfg: &AuditConfig, store: &Store) -> Result<Arc<dyn AuditSink>> {
    if !cfg.enabled {
        return Ok(Arc::new(NullAuditSink));
    }
    Ok(match cfg.backend {
        AuditBackend::Sqlite => Arc::new(SqliteAuditSink::for_store(store)?),
        AuditBackend::Jsonl => Arc::new(JsonlAuditSink::new(cfg.jsonl_path.clone())),
    })
}

// ----------- Auditor -----------

/// Sink plus the fallback client metadata, shared by every service.
#[derive(Clone)]
pub struct Auditor {
    sink: Arc<dyn AuditSink>,
    default_ip: String,
    default_user_agent: String,
}

impl Auditor {
    pub fn new(sink: Arc<dyn AuditSink>, cfg: &AuditConfig) -> Self {
        Self {
            sink,
            default_ip: cfg.default_ip_address.clone(),
            default_user_agent: cfg.default_user_agent.clone(),
        }
    }

    pub fn entry(&self, client: &ClientMeta, user_id: &str, event: AuditEvent) -> AuditLogEntry {
        AuditLogEntry {
            user_id: user_id.to_string(),
            event,
            resource_id: None,
            resource_type: None,
            ip_address: client.ip_address.clone().unwrap_or_else(|| self.default_ip.clone()),
            user_agent: client
                .user_agent
                .clone()
                .unwrap_or_else(|| self.default_user_agent.clone()),
        }
    }

    pub fn emit(&self, entry: AuditLogEntry) {
        emit(self.sink.as_ref(), &entry);
    }

    pub fn log(&self, client: &ClientMeta, user_id: &str, event: AuditEvent) {
        self.emit(self.entry(client, user_id, event));
    }
}

// ----------- Reads -----------

/// Entries for one actor in append order.
pub fn records_for_user(store: &Store, user_id: &str) -> Result<Vec<AuditRecord>> {
    let conn = store.conn()?;
    let mut stmt = conn.prepare(
        "SELECT seq, user_id, action, details, resource_id, resource_type, ip_address, user_agent, timestamp
         FROM audit_logs WHERE user_id = ?1 ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map([user_id], |r| {
        Ok((
            r.get::<_, i64>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, String>(3)?,
            r.get::<_, Option<String>>(4)?,
            r.get::<_, Option<String>>(5)?,
            r.get::<_, String>(6)?,
            r.get::<_, String>(7)?,
            r.get::<_, String>(8)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (seq, user_id, action, details, resource_id, resource_type, ip_address, user_agent, ts) =
            row?;
        out.push(AuditRecord {
            seq,
            user_id,
            action,
            details: serde_json::from_str(&details)
                .with_context(|| format!("audit row {seq} has malformed details"))?,
            resource_id,
            resource_type,
            ip_address,
            user_agent,
            timestamp: parse_ts(&ts)?,
        });
    }
    Ok(out)
}
