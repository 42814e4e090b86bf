// src/services/invites.rs
//! Partner invites and the transaction that redeems them.
//!
//! Invite status only moves `pending → completed` or `pending → expired`, and
//! only inside [`LinkTransaction::redeem`]. The ledger's read is bound to an open
//! transaction so no status decision can be taken outside the atomic scope.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::distributions::Uniform;
use rand::Rng;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::commands::context::ClientMeta;
use crate::services::accounts;
use crate::services::audit::{AuditEvent, Auditor};
use crate::services::store::{format_ts, is_transient, parse_opt_ts, parse_ts, store_now, Store, SQL_NOW};

const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteStatus {
    Pending,
    Completed,
    Expired,
}

impl InviteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InviteStatus::Pending => "pending",
            InviteStatus::Completed => "completed",
            InviteStatus::Expired => "expired",
        }
    }
}

impl FromStr for InviteStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(InviteStatus::Pending),
            "completed" => Ok(InviteStatus::Completed),
            "expired" => Ok(InviteStatus::Expired),
            other => Err(anyhow!("unknown invite status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteRecord {
    pub code: String,
    pub from_user_id: String,
    pub status: InviteStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub accepted_by: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Durable invite records.
pub struct InviteLedger;

impl InviteLedger {
    /// Read an invite inside the redeeming transaction.
    pub fn lookup(tx: &Transaction<'_>, code: &str) -> Result<Option<InviteRecord>> {
        load(tx, code)
    }

    /// Read-only snapshot for display; never used for status decisions.
    pub fn snapshot(store: &Store, code: &str) -> Result<Option<InviteRecord>> {
        let conn = store.conn()?;
        load(&conn, code)
    }

    /// Insert a new `pending` invite from `from_user_id` expiring after `ttl`.
    /// Retries on the (unlikely) event of a code collision.
    pub fn issue(store: &Store, from_user_id: &str, ttl: Duration) -> Result<InviteRecord> {
        let ttl = ChronoDuration::from_std(ttl).context("invite ttl out of range")?;
        let conn = store.conn()?;
        for _ in 0..5 {
            let code = generate_code();
            let now = store_now(&conn)?;
            let expires_at = now + ttl;
            let inserted = conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO invites(code, from_user_id, status, expires_at, created_at)
                     VALUES (?1, ?2, 'pending', ?3, {SQL_NOW})"
                ),
                (&code, from_user_id, format_ts(&expires_at)),
            )?;
            if inserted == 1 {
                return load(&conn, &code)?.ok_or_else(|| anyhow!("invite {code} vanished after insert"));
            }
        }
        Err(anyhow!("could not allocate a unique invite code"))
    }

    /// Pending invites issued by `from_user_id`, oldest first.
    pub fn pending_from(store: &Store, from_user_id: &str) -> Result<Vec<InviteRecord>> {
        let conn = store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT code FROM invites WHERE from_user_id = ?1 AND status = 'pending' ORDER BY created_at",
        )?;
        let codes = stmt
            .query_map([from_user_id], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut out = Vec::with_capacity(codes.len());
        for code in codes {
            if let Some(rec) = load(&conn, &code)? {
                out.push(rec);
            }
        }
        Ok(out)
    }
}

fn generate_code() -> String {
    let dist = Uniform::from(0..CODE_ALPHABET.len());
    rand::thread_rng()
        .sample_iter(dist)
        .take(CODE_LEN)
        .map(|i| CODE_ALPHABET[i] as char)
        .collect()
}

fn load(conn: &Connection, code: &str) -> Result<Option<InviteRecord>> {
    let row = conn
        .query_row(
            "SELECT from_user_id, status, expires_at, created_at, accepted_by, completed_at
             FROM invites WHERE code = ?1",
            [code],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .optional()
        .with_context(|| format!("reading invite {code}"))?;
    row.map(|(from_user_id, status, expires_at, created_at, accepted_by, completed_at)| {
        Ok(InviteRecord {
            code: code.to_string(),
            from_user_id,
            status: status.parse()?,
            expires_at: parse_ts(&expires_at)?,
            created_at: parse_ts(&created_at)?,
            accepted_by,
            completed_at: parse_opt_ts(completed_at)?,
        })
    })
    .transpose()
}

// ----------- Redemption -----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RedeemFailureKind {
    InviteNotFound,
    InviteAlreadyUsed,
    InviteExpired,
    InviteSelfRedeem,
    AccountNotFound,
    AccountAlreadyLinked,
    DeadlineExceeded,
    Internal,
}

impl RedeemFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedeemFailureKind::InviteNotFound => "invite_not_found",
            RedeemFailureKind::InviteAlreadyUsed => "invite_already_used",
            RedeemFailureKind::InviteExpired => "invite_expired",
            RedeemFailureKind::InviteSelfRedeem => "invite_self_redeem",
            RedeemFailureKind::AccountNotFound => "account_not_found",
            RedeemFailureKind::AccountAlreadyLinked => "account_already_linked",
            RedeemFailureKind::DeadlineExceeded => "deadline_exceeded",
            RedeemFailureKind::Internal => "internal",
        }
    }

    /// User-visible reason string.
    pub fn message(&self) -> &'static str {
        match self {
            RedeemFailureKind::InviteNotFound => "Invalid invite code.",
            RedeemFailureKind::InviteAlreadyUsed => "Invite has already been used or expired.",
            RedeemFailureKind::InviteExpired => "This invite has expired.",
            RedeemFailureKind::InviteSelfRedeem => "You cannot accept your own invite.",
            RedeemFailureKind::AccountNotFound => "Both accounts must be onboarded before linking.",
            RedeemFailureKind::AccountAlreadyLinked => "One of these accounts is already linked to a partner.",
            RedeemFailureKind::DeadlineExceeded => "The request timed out before the invite could be accepted.",
            RedeemFailureKind::Internal => "An unexpected error occurred while accepting the invite.",
        }
    }
}

impl fmt::Display for RedeemFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeemFailure {
    pub kind: RedeemFailureKind,
    /// True only when the failing transaction still committed a state change
    /// (closing an expired invite).
    pub committed_state_change: bool,
}

/// The link a successful redemption committed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Partnership {
    pub invite_code: String,
    pub primary_user_id: String,
    pub partner_user_id: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RedeemOutcome {
    Linked(Partnership),
    Failure(RedeemFailure),
}

impl RedeemOutcome {
    fn fail(kind: RedeemFailureKind) -> Self {
        RedeemOutcome::Failure(RedeemFailure { kind, committed_state_change: false })
    }
}

/// Atomically redeems an invite and links both accounts.
#[derive(Clone)]
pub struct LinkTransaction {
    store: Arc<Store>,
    auditor: Auditor,
    max_retries: u32,
}

impl LinkTransaction {
    pub fn new(store: Arc<Store>, auditor: Auditor, max_retries: u32) -> Self {
        Self { store, auditor, max_retries }
    }

    /// Redeem `code` for `redeemer`, then audit the outcome outside the
    /// transaction. Transient lock errors are retried a bounded number of times.
    ///
    /// With a `deadline`, no attempt starts after it passes and each attempt
    /// waits on the write lock for at most the time left. A commit that already
    /// started is never interrupted.
    pub fn redeem(
        &self,
        client: &ClientMeta,
        code: &str,
        redeemer: &str,
        deadline: Option<Instant>,
    ) -> RedeemOutcome {
        let mut attempt = 0u32;
        let outcome = loop {
            let Some(budget) = self.lock_budget(deadline) else {
                tracing::warn!(code, attempt, "invite redemption abandoned at deadline");
                break RedeemOutcome::fail(RedeemFailureKind::DeadlineExceeded);
            };
            match self.attempt(code, redeemer, budget) {
                Ok(outcome) => break outcome,
                Err(err) if is_transient(&err) && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(code, attempt, error = %err, "invite redemption contended, retrying");
                    let pause = Duration::from_millis(10 * u64::from(attempt));
                    std::thread::sleep(time_left(deadline).map_or(pause, |left| pause.min(left)));
                }
                Err(err) if is_transient(&err) && time_left(deadline) == Some(Duration::ZERO) => {
                    tracing::warn!(code, attempt, error = %err, "invite redemption timed out on the write lock");
                    break RedeemOutcome::fail(RedeemFailureKind::DeadlineExceeded);
                }
                Err(err) => {
                    tracing::error!(code, error = ?err, "invite redemption transaction failed");
                    break RedeemOutcome::fail(RedeemFailureKind::Internal);
                }
            }
        };
        self.audit(client, code, redeemer, &outcome);
        outcome
    }

    /// How long the next attempt may wait on the write lock. `None` once the
    /// deadline has passed.
    fn lock_budget(&self, deadline: Option<Instant>) -> Option<Duration> {
        let configured = self.store.busy_timeout();
        match time_left(deadline) {
            None => Some(configured),
            Some(left) if left.is_zero() => None,
            Some(left) => Some(left.min(configured)),
        }
    }

    /// One pass of the state machine with the lock wait capped at `budget`.
    fn attempt(&self, code: &str, redeemer: &str, budget: Duration) -> Result<RedeemOutcome> {
        let mut conn = self.store.conn()?;
        conn.busy_timeout(budget)?;
        let outcome = transition(&mut conn, code, redeemer);
        conn.busy_timeout(self.store.busy_timeout())?;
        outcome
    }

    fn audit(&self, client: &ClientMeta, code: &str, redeemer: &str, outcome: &RedeemOutcome) {
        match outcome {
            RedeemOutcome::Linked(link) => {
                tracing::info!(code, partner = redeemer, primary = %link.primary_user_id, "partner linked");
                let entry = self
                    .auditor
                    .entry(client, redeemer, AuditEvent::PartnerAcceptedInvite {
                        invite_code: code.to_string(),
                    })
                    .with_resource(code, "invite");
                self.auditor.emit(entry);
            }
            RedeemOutcome::Failure(failure) => {
                tracing::info!(code, partner = redeemer, kind = %failure.kind, "invite redemption failed");
                self.auditor.log(
                    client,
                    redeemer,
                    AuditEvent::PartnerInviteFailed {
                        invite_code: code.to_string(),
                        kind: failure.kind.as_str().to_string(),
                        error: failure.kind.message().to_string(),
                        committed_state_change: failure.committed_state_change,
                    },
                );
            }
        }
    }
}

fn time_left(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|d| d.saturating_duration_since(Instant::now()))
}

/// The state machine inside a single `BEGIN IMMEDIATE` transaction. Returning
/// early drops the transaction, which rolls it back.
fn transition(conn: &mut Connection, code: &str, redeemer: &str) -> Result<RedeemOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let Some(invite) = InviteLedger::lookup(&tx, code)? else {
        return Ok(RedeemOutcome::fail(RedeemFailureKind::InviteNotFound));
    };
    match invite.status {
        InviteStatus::Pending => {}
        InviteStatus::Completed => return Ok(RedeemOutcome::fail(RedeemFailureKind::InviteAlreadyUsed)),
        // Already closed by an earlier late attempt: same answer, nothing written.
        InviteStatus::Expired => return Ok(RedeemOutcome::fail(RedeemFailureKind::InviteExpired)),
    }

    let now = store_now(&tx)?;
    if invite.expires_at < now {
        // Closing the invite is committed even though the redemption fails.
        tx.execute(
            "UPDATE invites SET status = 'expired' WHERE code = ?1 AND status = 'pending'",
            [code],
        )?;
        tx.commit()?;
        return Ok(RedeemOutcome::Failure(RedeemFailure {
            kind: RedeemFailureKind::InviteExpired,
            committed_state_change: true,
        }));
    }

    let primary_id = invite.from_user_id.as_str();
    if primary_id == redeemer {
        return Ok(RedeemOutcome::fail(RedeemFailureKind::InviteSelfRedeem));
    }
    let (Some(primary), Some(partner)) = (accounts::load(&tx, primary_id)?, accounts::load(&tx, redeemer)?)
    else {
        return Ok(RedeemOutcome::fail(RedeemFailureKind::AccountNotFound));
    };
    if primary.partner_id.is_some() || partner.partner_id.is_some() {
        return Ok(RedeemOutcome::fail(RedeemFailureKind::AccountAlreadyLinked));
    }

    tx.execute("UPDATE users SET partner_id = ?1 WHERE uid = ?2", (redeemer, primary_id))?;
    tx.execute(
        "UPDATE users SET partner_id = ?1, role = 'partner' WHERE uid = ?2",
        (primary_id, redeemer),
    )?;
    let completed_at: String = tx.query_row(
        &format!(
            "UPDATE invites SET status = 'completed', accepted_by = ?1, completed_at = {SQL_NOW}
             WHERE code = ?2 AND status = 'pending'
             RETURNING completed_at"
        ),
        (redeemer, code),
        |r| r.get(0),
    )?;
    tx.commit()?;

    Ok(RedeemOutcome::Linked(Partnership {
        invite_code: code.to_string(),
        primary_user_id: primary_id.to_string(),
        partner_user_id: redeemer.to_string(),
        completed_at: parse_ts(&completed_at)?,
    }))
}
