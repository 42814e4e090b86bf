// src/services/retention.rs
//! Retention sweep trigger.
//!
//! Only the invocation contract exists: authenticate the scheduler, run
//! idempotently, need no body. The sweep itself is not implemented.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub status: &'static str,
    pub swept: u64,
}

pub struct RetentionTrigger {
    secret_hash: Option<blake3::Hash>,
}

impl RetentionTrigger {
    /// `None` rejects every presented secret.
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            secret_hash: secret.filter(|s| !s.is_empty()).map(|s| blake3::hash(s.as_bytes())),
        }
    }

    /// Constant-time check (`blake3::Hash` equality does not short-circuit).
    pub fn authenticate(&self, presented: &str) -> bool {
        match &self.secret_hash {
            Some(expected) => *expected == blake3::hash(presented.as_bytes()),
            None => false,
        }
    }

    pub fn sweep(&self) -> SweepReport {
        tracing::info!("retention sweep triggered; nothing to sweep yet");
        SweepReport { status: "not_implemented", swept: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_secret_rejects_everything() {
        let trigger = RetentionTrigger::new(None);
        assert!(!trigger.authenticate(""));
        assert!(!trigger.authenticate("anything"));
        assert!(!RetentionTrigger::new(Some("")).authenticate(""));
    }

    #[test]
    fn matching_secret_is_accepted() {
        let trigger = RetentionTrigger::new(Some("s3cret"));
        assert!(trigger.authenticate("s3cret"));
        assert!(!trigger.authenticate("s3cret "));
        assert_eq!(trigger.sweep(), trigger.sweep());
    }
}
