// src/commands/context.rs
//! Per-request context: verified caller, client metadata, optional deadline.

use std::time::{Duration, Instant};

use crate::error::{PlatformError, PlatformResult};
use crate::services::identity::IdentityProvider;

/// A caller identity produced by an [`IdentityProvider`]. Cannot be built from
/// a bare client-supplied string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCaller {
    uid: String,
}

impl VerifiedCaller {
    pub fn uid(&self) -> &str {
        &self.uid
    }
}

/// Network/client metadata recorded on audit entries.
#[derive(Debug, Clone, Default)]
pub struct ClientMeta {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    caller: Option<VerifiedCaller>,
    pub client: ClientMeta,
    pub deadline: Option<Instant>,
}

impl RequestContext {
    /// No verified identity. Every caller-bound operation rejects this.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Verify `credential`; an unverifiable credential yields an anonymous context.
    pub fn authenticate(provider: &dyn IdentityProvider, credential: &str) -> Self {
        let caller = provider.verify(credential).map(|uid| VerifiedCaller { uid });
        if caller.is_none() {
            tracing::warn!("credential failed verification");
        }
        Self { caller, ..Self::default() }
    }

    pub fn with_client(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.client = ClientMeta { ip_address, user_agent };
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn caller(&self) -> Option<&VerifiedCaller> {
        self.caller.as_ref()
    }

    pub(crate) fn require_caller(&self, message: &str) -> PlatformResult<&str> {
        self.caller
            .as_ref()
            .map(VerifiedCaller::uid)
            .ok_or_else(|| PlatformError::Unauthenticated(message.to_string()))
    }

    /// Fail fast once the deadline has passed, before any store work starts.
    pub(crate) fn require_time_left(&self) -> PlatformResult<()> {
        match self.remaining() {
            Some(left) if left.is_zero() => Err(PlatformError::DeadlineExceeded(
                "The request deadline passed before it could be processed.".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Time left before the deadline; `None` without a deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::identity::{StaticIdentityProvider, TrustedOperator};

    #[test]
    fn unknown_credentials_stay_anonymous() {
        let idp = StaticIdentityProvider::new().with_token("tok-u1", "U1");
        let ok = RequestContext::authenticate(&idp, "tok-u1");
        assert_eq!(ok.caller().map(VerifiedCaller::uid), Some("U1"));

        let bad = RequestContext::authenticate(&idp, "U1");
        assert!(bad.caller().is_none());
        assert_eq!(bad.require_caller("nope").unwrap_err().code(), "unauthenticated");
    }

    #[test]
    fn operator_mode_rejects_blank_uids() {
        assert!(RequestContext::authenticate(&TrustedOperator, "  ").caller().is_none());
    }

    #[test]
    fn passed_deadline_has_zero_remaining() {
        let ctx = RequestContext::anonymous().with_deadline(Instant::now());
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
        assert_eq!(RequestContext::anonymous().remaining(), None);
        assert_eq!(ctx.require_time_left().unwrap_err().code(), "deadline-exceeded");
        let roomy = RequestContext::anonymous().with_timeout(Duration::from_secs(60));
        assert!(roomy.require_time_left().is_ok());
    }
}
