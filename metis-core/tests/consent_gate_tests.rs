use metis_core::commands::{Platform, RequestContext};
use metis_core::config::PlatformConfig;
use metis_core::services::audit::AuditEvent;
use metis_core::services::consent::{Permission, Permissions};
use metis_core::services::gate::DenyReason;
use metis_core::services::identity::{StaticIdentityProvider, TrustedOperator};
use metis_core::services::minimizer::CONSENT_REQUIRED;
use metis_core::PlatformError;
use serde_json::json;

fn open(dir: &tempfile::TempDir) -> anyhow::Result<Platform> {
    Platform::open(&PlatformConfig::rooted_at(dir.path()))
}

fn as_user(uid: &str) -> RequestContext {
    RequestContext::authenticate(&TrustedOperator, uid)
}

#[test]
fn journal_write_denied_without_data_processing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let platform = open(&dir)?;
    let u1 = as_user("U1");
    platform.onboard_user(&u1, "U1", Some("u1@example.com"), None)?;
    platform.submit_consent(&u1, Permissions::granting(&[Permission::SentimentAnalysis]))?;
    let before = platform.audit_records_for("U1")?.len();

    let err = platform
        .gated_write(
            &u1,
            "save_journal_entry",
            &json!({ "text": "a very private note", "isShared": false }),
        )
        .unwrap_err();
    assert_eq!(err.code(), "permission-denied");
    assert!(matches!(
        err,
        PlatformError::PermissionDenied(DenyReason::PermissionNotGranted(Permission::DataProcessing))
    ));

    let records = platform.audit_records_for("U1")?;
    assert_eq!(records.len(), before + 1, "a denial leaves exactly the gate's entry");
    let gate_entry = records.last().unwrap();
    assert_eq!(gate_entry.action, "consent_gate_evaluated");
    assert_eq!(gate_entry.details["reason"], "permission_not_granted:dataProcessing");
    assert_eq!(gate_entry.details["decision"], "deny");
    assert_eq!(gate_entry.details["payload"]["text"], CONSENT_REQUIRED);
    assert!(!gate_entry.details.to_string().contains("private note"));

    assert!(platform.journal_entries_for("U1")?.is_empty());
    Ok(())
}

#[test]
fn missing_consent_record_denies() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let platform = open(&dir)?;
    let err = platform
        .gated_write(&as_user("U7"), "save_journal_entry", &json!({ "text": "hi" }))
        .unwrap_err();
    assert!(matches!(err, PlatformError::PermissionDenied(DenyReason::NoConsentRecord)));
    Ok(())
}

#[test]
fn allowed_write_drops_undeclared_fields() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let platform = open(&dir)?;
    let u1 = as_user("U1");
    platform.submit_consent(&u1, Permissions::granting(&[Permission::DataProcessing]))?;

    let saved = platform.gated_write(
        &u1,
        "save_journal_entry",
        &json!({ "text": "hot flashes at 3am", "isShared": true, "userId": "U2", "mood": 3 }),
    )?;
    assert_eq!(saved.user_id, "U1");
    assert_eq!(saved.text, "hot flashes at 3am");
    assert!(saved.is_shared);
    assert_eq!(saved.app_origin, "MenoWellness");
    assert_eq!(saved.analysis, json!({}));

    let records = platform.audit_records_for("U1")?;
    let created = records.last().unwrap();
    assert_eq!(
        created.event(),
        Some(AuditEvent::JournalEntryCreated {
            is_shared: true,
            text_length: "hot flashes at 3am".len(),
            has_consent: true,
        })
    );
    assert_eq!(created.resource_type.as_deref(), Some("journal_entry"));
    assert_eq!(created.resource_id.as_deref(), Some(saved.entry_id.as_str()));
    Ok(())
}

#[test]
fn withdrawal_is_effective_immediately() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let platform = open(&dir)?;
    let u1 = as_user("U1");
    platform.submit_consent(&u1, Permissions::granting(&Permission::ALL))?;
    platform.gated_write(&u1, "save_journal_entry", &json!({ "text": "first" }))?;

    let withdrawn = platform.withdraw_consent(&u1)?;
    assert!(withdrawn.is_withdrawn());
    assert_eq!(withdrawn.permissions, Permissions::none());

    // A second handle on the same file sees the withdrawal too.
    let other = open(&dir)?;
    for p in [&platform, &other] {
        let err = p
            .gated_write(&u1, "save_journal_entry", &json!({ "text": "second" }))
            .unwrap_err();
        assert_eq!(err.code(), "permission-denied");
    }
    assert_eq!(platform.journal_entries_for("U1")?.len(), 1);

    // Re-consenting clears the withdrawal.
    let again = platform.submit_consent(&u1, Permissions::granting(&[Permission::DataProcessing]))?;
    assert!(!again.is_withdrawn());
    platform.gated_write(&u1, "save_journal_entry", &json!({ "text": "third" }))?;
    Ok(())
}

#[test]
fn blank_text_and_unknown_actions_are_invalid() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let platform = open(&dir)?;
    let u1 = as_user("U1");
    platform.submit_consent(&u1, Permissions::granting(&[Permission::DataProcessing]))?;

    let err = platform
        .gated_write(&u1, "save_journal_entry", &json!({ "text": "   " }))
        .unwrap_err();
    assert_eq!(err.code(), "invalid-argument");
    assert_eq!(platform.audit_records_for("U1")?.last().unwrap().action, "journal_entry_create_failed");

    for action in ["delete_everything", "request_analysis"] {
        let err = platform.gated_write(&u1, action, &json!({ "text": "x" })).unwrap_err();
        assert_eq!(err.code(), "invalid-argument");
    }
    Ok(())
}

#[test]
fn onboarding_requires_matching_verified_identity() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let platform = open(&dir)?;

    let err = platform
        .onboard_user(&RequestContext::anonymous(), "U1", None, None)
        .unwrap_err();
    assert_eq!(err.code(), "unauthenticated");

    let idp = StaticIdentityProvider::new().with_token("tok-1", "U1");
    let ctx = RequestContext::authenticate(&idp, "tok-1");
    let err = platform.onboard_user(&ctx, "U2", None, None).unwrap_err();
    assert_eq!(err.code(), "unauthenticated");
    assert!(platform.account("U2")?.is_none());

    let account = platform.onboard_user(&ctx, "U1", Some("u1@example.com"), Some("Uma"))?;
    assert_eq!(account.role.as_str(), "primary");
    let retention = platform.retention_record("U1")?.expect("retention record");
    assert_eq!(retention.retention_period_days, 2555);

    let records = platform.audit_records_for("U1")?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].action, "user_onboarded");
    assert_eq!(records[0].resource_type.as_deref(), Some("user"));
    assert_eq!(records[0].ip_address, "0.0.0.0");
    assert_eq!(records[0].user_agent, "Unknown");
    Ok(())
}

#[test]
fn anonymization_needs_both_research_flags() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let platform = open(&dir)?;
    let u1 = as_user("U1");

    platform.submit_consent(&u1, Permissions::granting(&[Permission::AnonymizedLicensing]))?;
    let err = platform.anonymize_user_data(&u1).unwrap_err();
    assert!(matches!(
        err,
        PlatformError::PermissionDenied(DenyReason::PermissionNotGranted(Permission::ResearchParticipation))
    ));

    platform.submit_consent(
        &u1,
        Permissions::granting(&[Permission::AnonymizedLicensing, Permission::ResearchParticipation]),
    )?;
    let status = platform.anonymize_user_data(&u1)?;
    assert_eq!(status.as_str(), "deferred");
    let last = platform.audit_records_for("U1")?.pop().unwrap();
    assert_eq!(last.action, "research_anonymization_requested");
    Ok(())
}

#[test]
fn retention_trigger_checks_the_shared_secret() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let unconfigured = open(&dir)?;
    assert_eq!(unconfigured.cleanup_expired_data("").unwrap_err().code(), "unauthenticated");

    let mut config = PlatformConfig::rooted_at(dir.path());
    config.retention.trigger_secret = Some("cron-secret".into());
    let platform = Platform::open(&config)?;
    assert!(platform.cleanup_expired_data("wrong").is_err());
    let first = platform.cleanup_expired_data("cron-secret")?;
    let second = platform.cleanup_expired_data("cron-secret")?;
    assert_eq!(first, second);
    assert_eq!(first.status, "not_implemented");
    assert_eq!(first.swept, 0);
    Ok(())
}

#[test]
fn writes_after_the_deadline_are_rejected_untouched() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let platform = open(&dir)?;
    let u1 = as_user("U1");
    platform.submit_consent(&u1, Permissions::granting(&[Permission::DataProcessing]))?;
    let trail_before = platform.audit_records_for("U1")?.len();

    let late = as_user("U1").with_deadline(std::time::Instant::now());
    let err = platform.withdraw_consent(&late).unwrap_err();
    assert_eq!(err.code(), "deadline-exceeded");
    let err = platform
        .gated_write(&late, "save_journal_entry", &json!({ "text": "too late" }))
        .unwrap_err();
    assert_eq!(err.code(), "deadline-exceeded");
    let err = platform.onboard_user(&late, "U1", None, None).unwrap_err();
    assert_eq!(err.code(), "deadline-exceeded");

    assert!(!platform.consent("U1")?.unwrap().is_withdrawn());
    assert!(platform.journal_entries_for("U1")?.is_empty());
    assert!(platform.account("U1")?.is_none());
    assert_eq!(platform.audit_records_for("U1")?.len(), trail_before);
    Ok(())
}
