//! Caller-facing error taxonomy.
//!
//! Store and plumbing code returns `anyhow::Result`; the `Platform` facade
//! classifies those into [`PlatformError`] before anything reaches a caller.

use thiserror::Error;

use crate::services::analysis::AnalysisError;
use crate::services::gate::DenyReason;

#[derive(Debug, Error)]
pub enum PlatformError {
    /// No verified caller identity, or the claimed identity does not match it.
    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    InvalidArgument(String),

    /// Consent gate denial. Distinct from authentication so a client can prompt
    /// for consent instead of a re-login.
    #[error("consent required: {0}")]
    PermissionDenied(DenyReason),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    FailedPrecondition(String),

    /// The caller's deadline passed before the operation could run or finish.
    /// Nothing was committed on its behalf.
    #[error("{0}")]
    DeadlineExceeded(String),

    #[error("analysis service failed: {0}")]
    Analysis(#[from] AnalysisError),

    /// Store or transaction failure. The message is fixed; detail goes to the log.
    #[error("{0}")]
    Internal(&'static str),
}

impl PlatformError {
    /// Stable wire code for the error class.
    pub fn code(&self) -> &'static str {
        match self {
            PlatformError::Unauthenticated(_) => "unauthenticated",
            PlatformError::InvalidArgument(_) => "invalid-argument",
            PlatformError::PermissionDenied(_) => "permission-denied",
            PlatformError::NotFound(_) => "not-found",
            PlatformError::FailedPrecondition(_) => "failed-precondition",
            PlatformError::DeadlineExceeded(_) => "deadline-exceeded",
            PlatformError::Analysis(_) => "unavailable",
            PlatformError::Internal(_) => "internal",
        }
    }

    /// Log the underlying cause on the operational channel and collapse it into
    /// an `Internal` error carrying only `public_message`.
    pub(crate) fn internal(public_message: &'static str, cause: anyhow::Error) -> Self {
        tracing::error!(error = ?cause, "{public_message}");
        PlatformError::Internal(public_message)
    }
}

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::consent::Permission;

    #[test]
    fn internal_errors_hide_their_cause() {
        let err = PlatformError::internal(
            "Failed to onboard user.",
            anyhow::anyhow!("disk I/O error at /var/lib/secret.db"),
        );
        assert_eq!(err.code(), "internal");
        assert_eq!(err.to_string(), "Failed to onboard user.");
    }

    #[test]
    fn consent_denial_is_not_an_auth_failure() {
        let err = PlatformError::PermissionDenied(DenyReason::PermissionNotGranted(
            Permission::DataProcessing,
        ));
        assert_eq!(err.code(), "permission-denied");
        assert_eq!(
            err.to_string(),
            "consent required: permission_not_granted:dataProcessing"
        );
    }
}
