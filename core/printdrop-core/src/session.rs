//! Auth-token sources.
//!
//! There is one session per process. Whether a token is present decides
//! between the prompt/upload path and the queued interactive path.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

const TOKEN_ENV: &str = "PRINTDROP_AUTH_TOKEN";

pub trait SessionProvider: Send + Sync {
    /// The bearer token of the current session, or `None` when logged out.
    fn auth_token(&self) -> Option<String>;
}

/// Session owned by an in-process login flow.
#[derive(Debug, Default, Clone)]
pub struct SharedSession {
    token: Arc<RwLock<Option<String>>>,
}

impl SharedSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let session = Self::new();
        session.set_token(token);
        session
    }

    pub fn set_token(&self, token: impl Into<String>) {
        if let Ok(mut slot) = self.token.write() {
            *slot = Some(token.into());
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.token.write() {
            *slot = None;
        }
    }
}

impl SessionProvider for SharedSession {
    fn auth_token(&self) -> Option<String> {
        self.token.read().ok().and_then(|slot| slot.clone())
    }
}

/// Session for the headless monitor: `PRINTDROP_AUTH_TOKEN`, then the
/// `session-token` file. Re-read on every call so a later login is picked up.
#[derive(Debug, Clone)]
pub struct StoredSession {
    token_file: PathBuf,
}

impl StoredSession {
    pub fn new(token_file: PathBuf) -> Self {
        Self { token_file }
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl SessionProvider for StoredSession {
    fn auth_token(&self) -> Option<String> {
        if let Some(token) = std::env::var(TOKEN_ENV).ok().and_then(non_empty) {
            return Some(token);
        }
        fs_err::read_to_string(&self.token_file)
            .ok()
            .and_then(non_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_session_set_and_clear() {
        let session = SharedSession::new();
        assert!(session.auth_token().is_none());
        session.set_token("abc");
        assert_eq!(session.auth_token().as_deref(), Some("abc"));
        session.clear();
        assert!(session.auth_token().is_none());
    }

    #[test]
    fn test_stored_session_reads_token_file() {
        if std::env::var(TOKEN_ENV).is_ok() {
            return;
        }
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("session-token");
        let session = StoredSession::new(path.clone());
        assert!(session.auth_token().is_none());

        fs_err::write(&path, "  tok-123\n").unwrap();
        assert_eq!(session.auth_token().as_deref(), Some("tok-123"));

        fs_err::write(&path, "\n").unwrap();
        assert!(session.auth_token().is_none());
    }
}
