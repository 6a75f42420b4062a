//! Bearer-token sessions.
//!
//! Tokens are opaque URL-safe strings bound 1:1 to a username. Logging in
//! again revokes the previous token. Both directions of the mapping live
//! under one mutex so they never disagree.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
struct Session {
    username: String,
    issued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Sessions {
    by_token: HashMap<String, Session>,
    by_user: HashMap<String, String>,
}

#[derive(Debug)]
pub struct SessionTable {
    inner: Mutex<Sessions>,
    token_bytes: usize,
}

impl SessionTable {
    pub fn new(token_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Sessions::default()),
            token_bytes: token_bytes.max(16),
        }
    }

    /// Mint a token for `username`, replacing any token it already holds.
    pub fn issue(&self, username: &str) -> String {
        let mut bytes = vec![0u8; self.token_bytes];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(&bytes);

        let mut sessions = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = sessions.by_user.remove(username) {
            sessions.by_token.remove(&old);
            debug!(user = %username, "Revoked previous session token");
        }
        sessions.by_token.insert(
            token.clone(),
            Session {
                username: username.to_string(),
                issued_at: Utc::now(),
            },
        );
        sessions.by_user.insert(username.to_string(), token.clone());
        token
    }

    /// Username bound to `token`.
    pub fn resolve(&self, token: &str) -> Option<String> {
        let sessions = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        sessions.by_token.get(token).map(|s| s.username.clone())
    }

    /// When `token` was issued.
    pub fn issued_at(&self, token: &str) -> Option<DateTime<Utc>> {
        let sessions = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        sessions.by_token.get(token).map(|s| s.issued_at)
    }

    /// Drop the session of `username`, if any.
    pub fn revoke_user(&self, username: &str) -> bool {
        let mut sessions = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match sessions.by_user.remove(username) {
            Some(token) => {
                sessions.by_token.remove(&token);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_issue_and_resolve() {
        let table = SessionTable::new(32);
        let token = table.issue("alice");
        // 32 bytes -> 43 unpadded base64 characters.
        assert_eq!(token.len(), 43);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_eq!(table.resolve(&token).as_deref(), Some("alice"));
        assert!(table.issued_at(&token).is_some());
        assert_eq!(table.resolve("forged"), None);
    }

    #[test]
    fn test_relogin_replaces_token() {
        let table = SessionTable::new(32);
        let first = table.issue("alice");
        let second = table.issue("alice");
        assert_ne!(first, second);
        assert_eq!(table.resolve(&first), None);
        assert_eq!(table.resolve(&second).as_deref(), Some("alice"));
        assert_eq!(table.len(), 1);

        assert!(table.revoke_user("alice"));
        assert!(table.is_empty());
        assert!(!table.revoke_user("alice"));
    }

    #[test]
    fn test_concurrent_logins_keep_one_token_per_user() {
        let table = Arc::new(SessionTable::new(32));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        table.issue(if i % 2 == 0 { "alice" } else { "bob" });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(table.len(), 2);
    }
}
