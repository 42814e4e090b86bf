// src/services/analysis.rs
//! Client for the external sentiment-analysis service.
//!
//! The service is unreliable by assumption. Every way it can fail maps to a
//! distinct [`AnalysisError`] kind so callers and the audit trail can tell a
//! timeout from a rejected request.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

use crate::config::AnalysisConfig;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRequest {
    pub text: String,
    pub focus: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrisisAssessment {
    #[serde(default)]
    pub risk_level: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Response body. Only the crisis assessment is interpreted; everything else
/// is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResponse {
    #[serde(default)]
    pub crisis_assessment: Option<CrisisAssessment>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AnalysisResponse {
    pub fn risk_level(&self) -> Option<&str> {
        self.crisis_assessment.as_ref()?.risk_level.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    #[error("the analysis service is not configured")]
    NotConfigured,
    #[error("the analysis service timed out")]
    Timeout,
    #[error("could not reach the analysis service: {0}")]
    Transport(String),
    #[error("analysis service returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("unreadable analysis response: {0}")]
    Decode(String),
}

impl AnalysisError {
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisError::NotConfigured => "not_configured",
            AnalysisError::Timeout => "timeout",
            AnalysisError::Transport(_) => "transport",
            AnalysisError::Status { .. } => "status",
            AnalysisError::Decode(_) => "decode",
        }
    }
}

/// Outbound analysis seam. `timeout` is the whole-call budget left for this request.
pub trait AnalysisService: Send + Sync {
    fn analyze(&self, request: &AnalysisRequest, timeout: Duration) -> Result<AnalysisResponse, AnalysisError>;
}

/// Stand-in used when no endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredAnalysis;

impl AnalysisService for UnconfiguredAnalysis {
    fn analyze(&self, _request: &AnalysisRequest, _timeout: Duration) -> Result<AnalysisResponse, AnalysisError> {
        Err(AnalysisError::NotConfigured)
    }
}

/// JSON-over-HTTP client: `POST {text, focus}` to the configured endpoint.
pub struct HttpAnalysisService {
    endpoint: String,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl HttpAnalysisService {
    pub fn new(endpoint: impl Into<String>, connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout,
            request_timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Configured client, or [`UnconfiguredAnalysis`] when `endpoint` is unset.
    pub fn from_config(cfg: &AnalysisConfig) -> Box<dyn AnalysisService> {
        match cfg.endpoint.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
            Some(endpoint) => Box::new(Self::new(
                endpoint,
                Duration::from_millis(cfg.connect_timeout_ms),
                Duration::from_millis(cfg.request_timeout_ms),
            )),
            None => Box::new(UnconfiguredAnalysis),
        }
    }
}

impl AnalysisService for HttpAnalysisService {
    fn analyze(&self, request: &AnalysisRequest, timeout: Duration) -> Result<AnalysisResponse, AnalysisError> {
        let budget = timeout.min(self.request_timeout);
        if budget.is_zero() {
            return Err(AnalysisError::Timeout);
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(self.connect_timeout.min(budget))
            .timeout(budget)
            .build();
        let body = serde_json::to_value(request).map_err(|e| AnalysisError::Decode(e.to_string()))?;
        match agent
            .post(&self.endpoint)
            .set("content-type", "application/json")
            .send_json(body)
        {
            Ok(resp) => resp
                .into_json::<AnalysisResponse>()
                .map_err(|e| AnalysisError::Decode(e.to_string())),
            Err(ureq::Error::Status(status, resp)) => {
                let message = resp
                    .into_json::<Value>()
                    .ok()
                    .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
                    .unwrap_or_else(|| format!("HTTP error! status: {status}"));
                Err(AnalysisError::Status { status, message })
            }
            Err(ureq::Error::Transport(transport)) => Err(classify_transport(&transport)),
        }
    }
}

fn classify_transport(transport: &ureq::Transport) -> AnalysisError {
    let combined = format!("{:?} {}", transport.kind(), transport).to_ascii_lowercase();
    if combined.contains("timed out") || combined.contains("timeout") {
        AnalysisError::Timeout
    } else {
        AnalysisError::Transport(transport.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_keeps_unknown_fields_and_reads_risk_level() {
        let raw = json!({
            "sentiment": { "score": -0.4 },
            "crisisAssessment": { "risk_level": "low", "notes": "n/a" }
        });
        let resp: AnalysisResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(resp.risk_level(), Some("low"));
        assert!(resp.extra.contains_key("sentiment"));
    }

    #[test]
    fn missing_endpoint_means_not_configured() {
        let svc = HttpAnalysisService::from_config(&AnalysisConfig::default());
        let req = AnalysisRequest { text: "x".into(), focus: "f".into() };
        assert_eq!(svc.analyze(&req, Duration::from_secs(1)), Err(AnalysisError::NotConfigured));
    }
}
