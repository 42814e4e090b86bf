// src/commands/api.rs
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::commands::context::RequestContext;
use crate::commands::init::ensure_initialized_once;
use crate::config::PlatformConfig;
use crate::error::{PlatformError, PlatformResult};
use crate::services::accounts::{self, UserAccount};
use crate::services::analysis::{AnalysisRequest, AnalysisResponse, AnalysisService, HttpAnalysisService};
use crate::services::audit::{self, AuditEvent, AuditRecord, AuditSink, Auditor};
use crate::services::consent::{ConsentRecord, ConsentStore, Permissions};
use crate::services::gate::{ConsentGate, GateDecision, GatedAction};
use crate::services::invites::{InviteLedger, InviteRecord, LinkTransaction, Partnership, RedeemFailureKind, RedeemOutcome};
use crate::services::journal::{self, JournalEntry, NewEntry};
use crate::services::retention::{RetentionTrigger, SweepReport};
use crate::services::store::{format_ts, Store};

/// Collaborators that tests and embedders may substitute. `None` means the
/// one built from config.
#[derive(Default)]
pub struct PlatformDeps {
    pub audit_sink: Option<Arc<dyn AuditSink>>,
    pub analysis: Option<Arc<dyn AnalysisService>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnonymizationStatus {
    /// Consent checked and request recorded; the anonymization itself is not built yet.
    Deferred,
}

impl AnonymizationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnonymizationStatus::Deferred => "deferred",
        }
    }
}

/// The operation surface. One instance owns one store connection; open one
/// per worker when several threads share a database file.
pub struct Platform {
    config: PlatformConfig,
    store: Arc<Store>,
    auditor: Auditor,
    consents: ConsentStore,
    gate: ConsentGate,
    links: LinkTransaction,
    analysis: Arc<dyn AnalysisService>,
    retention: RetentionTrigger,
}

impl Platform {
    /// Open against the process-wide root (`METIS_ROOT` or `.metis`).
    pub fn from_init() -> Result<Self> {
        let report = ensure_initialized_once()?;
        Self::open(&report.config)
    }

    pub fn open(config: &PlatformConfig) -> Result<Self> {
        Self::open_with(config, PlatformDeps::default())
    }

    pub fn open_with(config: &PlatformConfig, deps: PlatformDeps) -> Result<Self> {
        let store = Arc::new(
            Store::open(&config.store.path, Duration::from_millis(config.store.busy_timeout_ms))
                .with_context(|| format!("opening store {}", config.store.path.display()))?,
        );
        let sink = match deps.audit_sink {
            Some(sink) => sink,
            None => audit::sink_from_config(&config.audit, &store)?,
        };
        let analysis = deps
            .analysis
            .unwrap_or_else(|| Arc::from(HttpAnalysisService::from_config(&config.analysis)));

        let auditor = Auditor::new(sink, &config.audit);
        let consents = ConsentStore::new(store.clone(), auditor.clone());
        let gate = ConsentGate::new(consents.clone(), auditor.clone());
        let links = LinkTransaction::new(store.clone(), auditor.clone(), config.store.max_txn_retries);
        let retention = RetentionTrigger::new(config.retention.trigger_secret.as_deref());

        Ok(Self {
            config: config.clone(),
            store,
            auditor,
            consents,
            gate,
            links,
            analysis,
            retention,
        })
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    // ---------- accounts ----------

    /// Create or refresh the caller's account. `uid` must be the verified caller.
    pub fn onboard_user(
        &self,
        ctx: &RequestContext,
        uid: &str,
        email: Option<&str>,
        display_name: Option<&str>,
    ) -> PlatformResult<UserAccount> {
        let caller = ctx.require_caller("User must be authenticated to onboard.")?;
        ctx.require_time_left()?;
        if uid.trim().is_empty() {
            return Err(PlatformError::InvalidArgument("A user id is required.".into()));
        }
        if caller != uid {
            tracing::warn!(caller, claimed = uid, "onboarding rejected: uid mismatch");
            return Err(PlatformError::Unauthenticated(
                "Cannot onboard a user other than the caller.".into(),
            ));
        }
        let account = accounts::onboard(&self.store, uid, email, display_name, &self.config.retention)
            .map_err(|e| PlatformError::internal("Failed to onboard user.", e))?;
        tracing::info!(uid, role = %account.role, "user onboarded");

        let entry = self
            .auditor
            .entry(&ctx.client, uid, AuditEvent::UserOnboarded {
                email: email.map(str::to_string),
                display_name: display_name.map(str::to_string),
            })
            .with_resource(uid, "user");
        self.auditor.emit(entry);
        Ok(account)
    }

    // ---------- invites ----------

    /// Issue a pending invite from the caller, valid for `ttl`.
    pub fn issue_invite(&self, ctx: &RequestContext, ttl: Duration) -> PlatformResult<InviteRecord> {
        let caller = ctx.require_caller("User must be authenticated to invite a partner.")?;
        ctx.require_time_left()?;
        let account = accounts::get(&self.store, caller)
            .map_err(|e| PlatformError::internal("Failed to create invite.", e))?
            .ok_or_else(|| PlatformError::FailedPrecondition("Onboard before inviting a partner.".into()))?;
        if account.partner_id.is_some() {
            return Err(PlatformError::FailedPrecondition(
                "This account is already linked to a partner.".into(),
            ));
        }
        let invite = InviteLedger::issue(&self.store, caller, ttl)
            .map_err(|e| PlatformError::internal("Failed to create invite.", e))?;
        tracing::info!(uid = caller, code = %invite.code, "partner invite issued");

        let entry = self
            .auditor
            .entry(&ctx.client, caller, AuditEvent::PartnerInviteIssued {
                invite_code: invite.code.clone(),
                expires_at: format_ts(&invite.expires_at),
            })
            .with_resource(invite.code.as_str(), "invite");
        self.auditor.emit(entry);
        Ok(invite)
    }

    /// Redeem `code` for the caller. Every call with a caller leaves exactly one
    /// audit entry, including one that arrives after its deadline.
    pub fn redeem_invite(&self, ctx: &RequestContext, code: &str) -> PlatformResult<Partnership> {
        let caller = ctx.require_caller("User must be authenticated to accept an invite.")?;
        let code = code.trim();
        if code.is_empty() {
            let message = "An invite code is required.";
            self.auditor.log(&ctx.client, caller, AuditEvent::PartnerInviteFailed {
                invite_code: String::new(),
                kind: "invalid_argument".into(),
                error: message.into(),
                committed_state_change: false,
            });
            return Err(PlatformError::InvalidArgument(message.into()));
        }

        match self.links.redeem(&ctx.client, code, caller, ctx.deadline) {
            RedeemOutcome::Linked(link) => Ok(link),
            RedeemOutcome::Failure(failure) => Err(redeem_error(failure.kind)),
        }
    }

    // ---------- consent ----------

    pub fn submit_consent(&self, ctx: &RequestContext, permissions: Permissions) -> PlatformResult<ConsentRecord> {
        let caller = ctx.require_caller("User must be authenticated to record consent.")?;
        ctx.require_time_left()?;
        self.consents
            .submit(&ctx.client, caller, permissions)
            .map_err(|e| PlatformError::internal("Failed to save consent.", e))
    }

    pub fn withdraw_consent(&self, ctx: &RequestContext) -> PlatformResult<ConsentRecord> {
        let caller = ctx.require_caller("User must be authenticated to withdraw consent.")?;
        ctx.require_time_left()?;
        self.consents
            .withdraw(&ctx.client, caller)
            .map_err(|e| PlatformError::internal("Failed to withdraw consent.", e))
    }

    // ---------- gated operations ----------

    /// Consent-gated write. Only `save_journal_entry` is a write today.
    pub fn gated_write(&self, ctx: &RequestContext, action: &str, payload: &Value) -> PlatformResult<JournalEntry> {
        let caller = ctx.require_caller("User must be authenticated to save data.")?;
        ctx.require_time_left()?;
        let action: GatedAction = action
            .parse()
            .ok()
            .filter(GatedAction::is_write)
            .ok_or_else(|| PlatformError::InvalidArgument(format!("Unknown write action {action:?}.")))?;

        let (decision, sanitized) = self
            .gate
            .evaluate_payload(&ctx.client, caller, action, payload)
            .map_err(|e| PlatformError::internal("Failed to evaluate consent.", e))?;
        if let GateDecision::Deny(reason) = decision {
            return Err(PlatformError::PermissionDenied(reason));
        }

        let entry = match NewEntry::from_payload(&sanitized) {
            Ok(entry) => entry,
            Err(err) => {
                let message = err.to_string();
                self.auditor.log(&ctx.client, caller, AuditEvent::JournalEntryCreateFailed {
                    error: message.clone(),
                });
                return Err(PlatformError::InvalidArgument(message));
            }
        };

        match journal::insert(&self.store, caller, &entry, &self.config.journal.app_origin) {
            Ok(saved) => {
                tracing::info!(uid = caller, entry_id = %saved.entry_id, "journal entry saved");
                let audit_entry = self
                    .auditor
                    .entry(&ctx.client, caller, AuditEvent::JournalEntryCreated {
                        is_shared: saved.is_shared,
                        text_length: saved.text.chars().count(),
                        has_consent: true,
                    })
                    .with_resource(saved.entry_id.as_str(), "journal_entry");
                self.auditor.emit(audit_entry);
                Ok(saved)
            }
            Err(err) => {
                let public = "Failed to save journal entry.";
                self.auditor.log(&ctx.client, caller, AuditEvent::JournalEntryCreateFailed {
                    error: public.into(),
                });
                Err(PlatformError::internal(public, err))
            }
        }
    }

    /// Score `text` with the external analysis service. A consent denial returns
    /// before anything leaves the process.
    pub fn request_analysis(&self, ctx: &RequestContext, text: &str) -> PlatformResult<AnalysisResponse> {
        let caller = ctx.require_caller("User must be authenticated to request analysis.")?;
        if text.trim().is_empty() {
            return Err(PlatformError::InvalidArgument("Text to analyze is required.".into()));
        }
        let decision = self
            .gate
            .evaluate(&ctx.client, caller, GatedAction::RequestAnalysis)
            .map_err(|e| PlatformError::internal("Failed to evaluate consent.", e))?;
        if let GateDecision::Deny(reason) = decision {
            return Err(PlatformError::PermissionDenied(reason));
        }

        let text_length = text.chars().count();
        self.auditor.log(&ctx.client, caller, AuditEvent::SentimentAnalysisRequested {
            text_length,
            has_consent: true,
        });

        let request = AnalysisRequest {
            text: text.to_string(),
            focus: self.config.analysis.focus.clone(),
        };
        let budget = ctx
            .remaining()
            .unwrap_or_else(|| Duration::from_millis(self.config.analysis.request_timeout_ms));

        match self.analysis.analyze(&request, budget) {
            Ok(response) => {
                tracing::info!(uid = caller, text_length, "sentiment analysis completed");
                self.auditor.log(&ctx.client, caller, AuditEvent::SentimentAnalysisCompleted {
                    has_result: true,
                    risk_level: response.risk_level().map(str::to_string),
                });
                Ok(response)
            }
            Err(err) => {
                tracing::warn!(uid = caller, kind = err.kind(), error = %err, "sentiment analysis failed");
                self.auditor.log(&ctx.client, caller, AuditEvent::SentimentAnalysisFailed {
                    kind: err.kind().to_string(),
                    error: err.to_string(),
                });
                Err(PlatformError::Analysis(err))
            }
        }
    }

    /// Research anonymization request. Gated like any other use of the data;
    /// the anonymization pass itself is deferred.
    pub fn anonymize_user_data(&self, ctx: &RequestContext) -> PlatformResult<AnonymizationStatus> {
        let caller = ctx.require_caller("User must be authenticated to request anonymization.")?;
        ctx.require_time_left()?;
        let decision = self
            .gate
            .evaluate(&ctx.client, caller, GatedAction::AnonymizeForResearch)
            .map_err(|e| PlatformError::internal("Failed to evaluate consent.", e))?;
        if let GateDecision::Deny(reason) = decision {
            return Err(PlatformError::PermissionDenied(reason));
        }
        let status = AnonymizationStatus::Deferred;
        self.auditor.log(&ctx.client, caller, AuditEvent::ResearchAnonymizationRequested {
            status: status.as_str().to_string(),
        });
        Ok(status)
    }

    // ---------- scheduling trigger ----------

    /// Retention sweep entry point for the scheduler. Needs no caller, only
    /// the shared trigger secret. Safe to call repeatedly.
    pub fn cleanup_expired_data(&self, presented_secret: &str) -> PlatformResult<SweepReport> {
        if !self.retention.authenticate(presented_secret) {
            tracing::warn!("retention trigger rejected: bad or unconfigured secret");
            return Err(PlatformError::Unauthenticated("Invalid trigger credentials.".into()));
        }
        Ok(self.retention.sweep())
    }

    // ---------- reads ----------

    pub fn account(&self, uid: &str) -> PlatformResult<Option<UserAccount>> {
        accounts::get(&self.store, uid).map_err(|e| PlatformError::internal("Failed to read account.", e))
    }

    pub fn retention_record(&self, uid: &str) -> PlatformResult<Option<accounts::RetentionRecord>> {
        accounts::retention_record(&self.store, uid)
            .map_err(|e| PlatformError::internal("Failed to read retention record.", e))
    }

    pub fn invite(&self, code: &str) -> PlatformResult<Option<InviteRecord>> {
        InviteLedger::snapshot(&self.store, code).map_err(|e| PlatformError::internal("Failed to read invite.", e))
    }

    pub fn pending_invites(&self, uid: &str) -> PlatformResult<Vec<InviteRecord>> {
        InviteLedger::pending_from(&self.store, uid)
            .map_err(|e| PlatformError::internal("Failed to read invites.", e))
    }

    pub fn consent(&self, uid: &str) -> PlatformResult<Option<ConsentRecord>> {
        self.consents
            .get_current(uid)
            .map_err(|e| PlatformError::internal("Failed to read consent.", e))
    }

    /// The caller-facing trail in the configured sqlite store. Empty when audit
    /// goes elsewhere.
    pub fn audit_records_for(&self, uid: &str) -> PlatformResult<Vec<AuditRecord>> {
        audit::records_for_user(&self.store, uid).map_err(|e| PlatformError::internal("Failed to read audit trail.", e))
    }

    pub fn journal_entries_for(&self, uid: &str) -> PlatformResult<Vec<JournalEntry>> {
        journal::list_for_user(&self.store, uid)
            .map_err(|e| PlatformError::internal("Failed to read journal entries.", e))
    }
}

fn redeem_error(kind: RedeemFailureKind) -> PlatformError {
    let message = kind.message();
    match kind {
        RedeemFailureKind::InviteNotFound | RedeemFailureKind::AccountNotFound => {
            PlatformError::NotFound(message.to_string())
        }
        RedeemFailureKind::InviteAlreadyUsed
        | RedeemFailureKind::InviteExpired
        | RedeemFailureKind::InviteSelfRedeem
        | RedeemFailureKind::AccountAlreadyLinked => PlatformError::FailedPrecondition(message.to_string()),
        RedeemFailureKind::DeadlineExceeded => PlatformError::DeadlineExceeded(message.to_string()),
        RedeemFailureKind::Internal => PlatformError::Internal(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redemption_failures_map_to_distinct_codes() {
        assert_eq!(redeem_error(RedeemFailureKind::InviteNotFound).code(), "not-found");
        assert_eq!(redeem_error(RedeemFailureKind::InviteExpired).code(), "failed-precondition");
        assert_eq!(redeem_error(RedeemFailureKind::DeadlineExceeded).code(), "deadline-exceeded");
        let internal = redeem_error(RedeemFailureKind::Internal);
        assert_eq!(internal.code(), "internal");
        assert_eq!(internal.to_string(), RedeemFailureKind::Internal.message());
    }
}
