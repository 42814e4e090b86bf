//! services/gate.rs
//! Consent gate: per-action allow/deny against the current consent record.
//!
//! The decision itself ([`decide`]) is pure. [`ConsentGate::evaluate`] loads the
//! record, decides, and audits the outcome; audit failures never reach the caller.

use anyhow::Result;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::commands::context::ClientMeta;
use crate::services::audit::{AuditEvent, Auditor};
use crate::services::consent::{ConsentRecord, ConsentStore, Permission};
use crate::services::minimizer;

/// Actions that touch personal data, with the minimal consent and fields each needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatedAction {
    SaveJournalEntry,
    RequestAnalysis,
    AnonymizeForResearch,
}

impl GatedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatedAction::SaveJournalEntry => "save_journal_entry",
            GatedAction::RequestAnalysis => "request_analysis",
            GatedAction::AnonymizeForResearch => "anonymize_user_data",
        }
    }

    pub fn required_permissions(&self) -> &'static [Permission] {
        match self {
            GatedAction::SaveJournalEntry => &[Permission::DataProcessing],
            GatedAction::RequestAnalysis => &[Permission::SentimentAnalysis],
            GatedAction::AnonymizeForResearch => &[
                Permission::AnonymizedLicensing,
                Permission::ResearchParticipation,
            ],
        }
    }

    /// Fields the action may persist; everything else is dropped.
    pub fn declared_fields(&self) -> &'static [&'static str] {
        match self {
            GatedAction::SaveJournalEntry => &["text", "isShared"],
            GatedAction::RequestAnalysis => &["text"],
            GatedAction::AnonymizeForResearch => &[],
        }
    }

    /// Declared fields carrying user content.
    pub fn sensitive_fields(&self) -> &'static [&'static str] {
        match self {
            GatedAction::SaveJournalEntry | GatedAction::RequestAnalysis => &["text"],
            GatedAction::AnonymizeForResearch => &[],
        }
    }

    /// Whether `gated_write` may persist this action's payload.
    pub fn is_write(&self) -> bool {
        matches!(self, GatedAction::SaveJournalEntry)
    }
}

impl FromStr for GatedAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "save_journal_entry" => Ok(GatedAction::SaveJournalEntry),
            "request_analysis" => Ok(GatedAction::RequestAnalysis),
            "anonymize_user_data" => Ok(GatedAction::AnonymizeForResearch),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    NoConsentRecord,
    PermissionNotGranted(Permission),
    ConsentWithdrawn,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::NoConsentRecord => f.write_str("no_consent_record"),
            DenyReason::PermissionNotGranted(p) => write!(f, "permission_not_granted:{p}"),
            DenyReason::ConsentWithdrawn => f.write_str("consent_withdrawn"),
        }
    }
}

impl Serialize for DenyReason {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Deny(DenyReason),
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allow)
    }
}

/// Allow iff a record exists, no withdrawal is in force, and every required flag is true.
pub fn decide(record: Option<&ConsentRecord>, required: &[Permission]) -> GateDecision {
    let Some(record) = record else {
        return GateDecision::Deny(DenyReason::NoConsentRecord);
    };
    if record.is_withdrawn() {
        return GateDecision::Deny(DenyReason::ConsentWithdrawn);
    }
    match required
        .iter()
        .find(|perm| !record.permissions.is_granted(**perm))
    {
        Some(missing) => GateDecision::Deny(DenyReason::PermissionNotGranted(*missing)),
        None => GateDecision::Allow,
    }
}

#[derive(Clone)]
pub struct ConsentGate {
    consents: ConsentStore,
    auditor: Auditor,
}

impl ConsentGate {
    pub fn new(consents: ConsentStore, auditor: Auditor) -> Self {
        Self { consents, auditor }
    }

    /// Decide `action` for `user_id` and audit the outcome.
    pub fn evaluate(
        &self,
        client: &ClientMeta,
        user_id: &str,
        action: GatedAction,
    ) -> Result<GateDecision> {
        self.evaluate_inner(client, user_id, action, None)
    }

    /// Like [`evaluate`](Self::evaluate), and also returns the payload as the
    /// minimizer shapes it for this decision. A denial's audit entry carries the
    /// minimized payload, never the original.
    pub fn evaluate_payload(
        &self,
        client: &ClientMeta,
        user_id: &str,
        action: GatedAction,
        payload: &Value,
    ) -> Result<(GateDecision, Value)> {
        let mut sanitized = Value::Null;
        let decision = self.evaluate_inner(client, user_id, action, Some((payload, &mut sanitized)))?;
        Ok((decision, sanitized))
    }

    fn evaluate_inner(
        &self,
        client: &ClientMeta,
        user_id: &str,
        action: GatedAction,
        payload: Option<(&Value, &mut Value)>,
    ) -> Result<GateDecision> {
        let required = action.required_permissions();
        let record = match self.consents.get_current(user_id) {
            Ok(record) => record,
            Err(err) => {
                self.audit(client, user_id, action, "deny", Some("consent_unavailable".into()), None);
                return Err(err);
            }
        };
        let decision = decide(record.as_ref(), required);

        let mut audited_payload = None;
        if let Some((raw, out)) = payload {
            *out = minimizer::sanitize(action, raw, &decision);
            if !decision.is_allowed() {
                audited_payload = Some(out.clone());
            }
        }

        match decision {
            GateDecision::Allow => {
                tracing::debug!(user_id, action = action.as_str(), "consent gate allow");
                self.audit(client, user_id, action, "allow", None, audited_payload);
            }
            GateDecision::Deny(reason) => {
                tracing::info!(user_id, action = action.as_str(), %reason, "consent gate deny");
                self.audit(client, user_id, action, "deny", Some(reason.to_string()), audited_payload);
            }
        }
        Ok(decision)
    }

    fn audit(
        &self,
        client: &ClientMeta,
        user_id: &str,
        action: GatedAction,
        decision: &str,
        reason: Option<String>,
        payload: Option<Value>,
    ) {
        self.auditor.log(
            client,
            user_id,
            AuditEvent::ConsentGateEvaluated {
                action: action.as_str().to_string(),
                permissions: action.required_permissions().to_vec(),
                decision: decision.to_string(),
                reason,
                payload,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::consent::Permissions;
    use chrono::{Duration, Utc};

    fn record(perms: Permissions) -> ConsentRecord {
        ConsentRecord {
            user_id: "U1".into(),
            permissions: perms,
            granted_at: Utc::now(),
            withdrawn_at: None,
        }
    }

    #[test]
    fn missing_record_denies_everything() {
        assert_eq!(
            decide(None, &[Permission::DataProcessing]),
            GateDecision::Deny(DenyReason::NoConsentRecord)
        );
    }

    #[test]
    fn first_missing_flag_is_reported() {
        let rec = record(Permissions::granting(&[Permission::AnonymizedLicensing]));
        assert_eq!(
            decide(Some(&rec), GatedAction::AnonymizeForResearch.required_permissions()),
            GateDecision::Deny(DenyReason::PermissionNotGranted(
                Permission::ResearchParticipation
            ))
        );
        assert_eq!(
            DenyReason::PermissionNotGranted(Permission::ResearchParticipation).to_string(),
            "permission_not_granted:researchParticipation"
        );
    }

    #[test]
    fn withdrawal_outranks_flags() {
        let mut rec = record(Permissions::granting(&[Permission::DataProcessing]));
        rec.withdrawn_at = Some(rec.granted_at + Duration::seconds(1));
        assert_eq!(
            decide(Some(&rec), &[Permission::DataProcessing]),
            GateDecision::Deny(DenyReason::ConsentWithdrawn)
        );
    }

    #[test]
    fn stale_withdrawal_before_grant_is_ignored() {
        let mut rec = record(Permissions::granting(&[Permission::DataProcessing]));
        rec.withdrawn_at = Some(rec.granted_at - Duration::days(3));
        assert_eq!(decide(Some(&rec), &[Permission::DataProcessing]), GateDecision::Allow);
    }

    #[test]
    fn empty_requirement_still_needs_a_record() {
        let rec = record(Permissions::none());
        assert_eq!(decide(Some(&rec), &[]), GateDecision::Allow);
        assert!(!decide(None, &[]).is_allowed());
    }

    #[test]
    fn actions_round_trip_through_their_names() {
        for action in [
            GatedAction::SaveJournalEntry,
            GatedAction::RequestAnalysis,
            GatedAction::AnonymizeForResearch,
        ] {
            assert_eq!(action.as_str().parse::<GatedAction>(), Ok(action));
        }
        assert!("delete_everything".parse::<GatedAction>().is_err());
    }
}
