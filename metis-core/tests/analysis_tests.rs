use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use metis_core::commands::{Platform, RequestContext};
use metis_core::config::PlatformConfig;
use metis_core::services::analysis::AnalysisError;
use metis_core::services::consent::{Permission, Permissions};
use metis_core::services::identity::TrustedOperator;
use metis_core::PlatformError;
use serde_json::{json, Value};

fn as_user(uid: &str) -> RequestContext {
    RequestContext::authenticate(&TrustedOperator, uid)
}

/// Serve one canned HTTP response; the join handle yields the request body.
fn one_shot_server(status_line: &'static str, body: &'static str) -> (String, thread::JoinHandle<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/analyze", listener.local_addr().unwrap());
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream);
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap();
                }
            }
        }
        let mut buf = vec![0u8; content_length];
        reader.read_exact(&mut buf).unwrap();

        let mut stream = reader.into_inner();
        write!(
            stream,
            "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
        .unwrap();
        stream.flush().unwrap();
        serde_json::from_slice(&buf).unwrap()
    });
    (url, handle)
}

fn platform_with_endpoint(dir: &tempfile::TempDir, endpoint: Option<String>) -> anyhow::Result<Platform> {
    let mut config = PlatformConfig::rooted_at(dir.path());
    config.analysis.endpoint = endpoint;
    config.analysis.request_timeout_ms = 5_000;
    Platform::open(&config)
}

#[test]
fn analysis_result_is_returned_and_audited() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (url, server) = one_shot_server(
        "HTTP/1.1 200 OK",
        r#"{"sentiment":{"label":"negative"},"crisisAssessment":{"risk_level":"low"}}"#,
    );
    let platform = platform_with_endpoint(&dir, Some(url))?;
    let u1 = as_user("U1");
    platform.submit_consent(&u1, Permissions::granting(&[Permission::SentimentAnalysis]))?;

    let response = platform.request_analysis(&u1, "could not sleep again")?;
    assert_eq!(response.risk_level(), Some("low"));
    assert_eq!(response.extra["sentiment"]["label"], "negative");

    let sent = server.join().unwrap();
    assert_eq!(sent, json!({ "text": "could not sleep again", "focus": "Menopause Analysis" }));

    let actions: Vec<String> = platform
        .audit_records_for("U1")?
        .into_iter()
        .map(|r| r.action)
        .collect();
    assert_eq!(
        actions,
        [
            "consent_given",
            "consent_gate_evaluated",
            "sentiment_analysis_requested",
            "sentiment_analysis_completed"
        ]
    );
    let completed = platform.audit_records_for("U1")?.pop().unwrap();
    assert_eq!(completed.details["riskLevel"], "low");
    Ok(())
}

#[test]
fn error_body_surfaces_as_status_failure() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (url, server) = one_shot_server(
        "HTTP/1.1 503 Service Unavailable",
        r#"{"error":"model warming up"}"#,
    );
    let platform = platform_with_endpoint(&dir, Some(url))?;
    let u1 = as_user("U1");
    platform.submit_consent(&u1, Permissions::granting(&[Permission::SentimentAnalysis]))?;

    let err = platform.request_analysis(&u1, "tired").unwrap_err();
    server.join().unwrap();
    assert_eq!(err.code(), "unavailable");
    match err {
        PlatformError::Analysis(AnalysisError::Status { status, message }) => {
            assert_eq!(status, 503);
            assert_eq!(message, "model warming up");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let failed = platform.audit_records_for("U1")?.pop().unwrap();
    assert_eq!(failed.action, "sentiment_analysis_failed");
    assert_eq!(failed.details["kind"], "status");
    Ok(())
}

#[test]
fn denied_analysis_never_calls_out() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let listener = TcpListener::bind("127.0.0.1:0")?;
    listener.set_nonblocking(true)?;
    let url = format!("http://{}/analyze", listener.local_addr()?);
    let platform = platform_with_endpoint(&dir, Some(url))?;
    let u1 = as_user("U1");
    platform.submit_consent(&u1, Permissions::granting(&[Permission::DataProcessing]))?;

    let err = platform.request_analysis(&u1, "private words").unwrap_err();
    assert_eq!(err.code(), "permission-denied");
    assert_eq!(err.to_string(), "consent required: permission_not_granted:sentimentAnalysis");

    thread::sleep(Duration::from_millis(50));
    assert!(listener.accept().is_err(), "no connection may be attempted");
    let records = platform.audit_records_for("U1")?;
    assert!(records.iter().all(|r| !r.action.starts_with("sentiment_analysis")));
    Ok(())
}

#[test]
fn unconfigured_service_fails_distinctly() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let platform = platform_with_endpoint(&dir, None)?;
    let u1 = as_user("U1");
    platform.submit_consent(&u1, Permissions::granting(&[Permission::SentimentAnalysis]))?;

    let err = platform.request_analysis(&u1, "hello").unwrap_err();
    assert!(matches!(err, PlatformError::Analysis(AnalysisError::NotConfigured)));
    let failed = platform.audit_records_for("U1")?.pop().unwrap();
    assert_eq!(failed.details["kind"], "not_configured");
    Ok(())
}

#[test]
fn expired_deadline_is_a_timeout() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let url = format!("http://{}/analyze", listener.local_addr()?);
    let platform = platform_with_endpoint(&dir, Some(url))?;
    let u1 = as_user("U1");
    platform.submit_consent(&u1, Permissions::granting(&[Permission::SentimentAnalysis]))?;

    let late = as_user("U1").with_deadline(std::time::Instant::now());
    let err = platform.request_analysis(&late, "hello").unwrap_err();
    assert!(matches!(err, PlatformError::Analysis(AnalysisError::Timeout)));
    Ok(())
}
