//! services/identity.rs
//! Identity provider seam. The core only acts on identities a provider verified.

use std::collections::HashMap;

/// Turns a presented credential into a verified subject id.
pub trait IdentityProvider: Send + Sync {
    fn verify(&self, credential: &str) -> Option<String>;
}

/// Fixed credential → uid table. Used by tests and token-based admin calls.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentityProvider {
    tokens: HashMap<String, String>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, uid: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), uid.into());
        self
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn verify(&self, credential: &str) -> Option<String> {
        self.tokens.get(credential).cloned()
    }
}

/// Local operator mode: the credential *is* the uid. Only for the admin CLI,
/// which already runs with direct access to the store.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustedOperator;

impl IdentityProvider for TrustedOperator {
    fn verify(&self, credential: &str) -> Option<String> {
        let uid = credential.trim();
        (!uid.is_empty()).then(|| uid.to_string())
    }
}
