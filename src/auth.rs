use sha2::{Digest, Sha256};
use tracing::debug;

/// Switches the caller identity used by subsequent backend calls.
///
/// Must be idempotent; the scheduler calls it once per credential change.
pub trait Authenticator {
    fn reload_credential(&self, token: &str);
}

/// Credential cache for one dispatch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    last_token: Option<String>,
}

impl AuthContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_token(&self) -> Option<&str> {
        self.last_token.as_deref()
    }

    /// Make `token` the active credential.
    ///
    /// Nothing happens when it is already cached. An empty token is recorded
    /// but never sent to the authenticator. Returns whether a reload was issued.
    pub fn ensure(&mut self, token: &str, auth: &dyn Authenticator) -> bool {
        if self.last_token.as_deref() == Some(token) {
            return false;
        }
        let reloaded = if token.is_empty() {
            false
        } else {
            debug!(credential = %fingerprint(token), "reloading credential");
            auth.reload_credential(token);
            true
        };
        self.last_token = Some(token.to_string());
        reloaded
    }
}

/// Short, non-reversible label for a credential, safe to log.
pub fn fingerprint(token: &str) -> String {
    if token.is_empty() {
        return "<none>".to_string();
    }
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().take(6).map(|b| format!("{b:02x}")).collect()
}

/// Authenticator that ignores credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

impl Authenticator for NoAuth {
    fn reload_credential(&self, _token: &str) {}
}
