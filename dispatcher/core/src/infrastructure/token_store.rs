// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Login Tokens
//
// Opaque tokens handed out at login. A token stays valid as long as it is
// used at least once per lifetime, so a client that loses its connection can
// log back in with `management.login_token` instead of credentials.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::domain::session::Principal;

struct Grant {
    principal: Principal,
    expires_at: Instant,
}

pub struct TokenStore {
    tokens: DashMap<String, Grant>,
    lifetime: Duration,
}

impl TokenStore {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            tokens: DashMap::new(),
            lifetime,
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    pub fn issue(&self, principal: Principal) -> String {
        self.purge_expired();
        let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        debug!(username = %principal.username, "Issued login token");
        self.tokens.insert(
            token.clone(),
            Grant {
                principal,
                expires_at: Instant::now() + self.lifetime,
            },
        );
        token
    }

    /// Principal behind a live token. Expired tokens are dropped on sight.
    pub fn lookup(&self, token: &str) -> Option<Principal> {
        let now = Instant::now();
        match self.tokens.get(token) {
            Some(grant) if grant.expires_at > now => return Some(grant.principal.clone()),
            Some(_) => {}
            None => return None,
        }
        self.tokens.remove(token);
        None
    }

    /// Push the expiry one lifetime into the future. False when the token
    /// is unknown or already expired.
    pub fn keepalive(&self, token: &str) -> bool {
        let now = Instant::now();
        match self.tokens.get_mut(token) {
            Some(mut grant) if grant.expires_at > now => {
                grant.expires_at = now + self.lifetime;
                true
            }
            _ => false,
        }
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.remove(token).is_some()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        self.tokens.retain(|_, grant| grant.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Principal {
        Principal {
            username: "root".into(),
            privileged: true,
        }
    }

    #[test]
    fn test_issued_token_resolves_until_revoked() {
        let store = TokenStore::new(Duration::from_secs(60));
        let token = store.issue(root());
        assert_eq!(token.len(), 64);
        assert_eq!(store.lookup(&token), Some(root()));
        assert!(store.keepalive(&token));

        assert!(store.revoke(&token));
        assert_eq!(store.lookup(&token), None);
        assert!(!store.keepalive(&token));
        assert!(!store.revoke(&token));
    }

    #[test]
    fn test_expired_token_is_dropped() {
        let store = TokenStore::new(Duration::ZERO);
        let token = store.issue(root());
        assert_eq!(store.lookup(&token), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_issue_purges_expired_tokens() {
        let store = TokenStore::new(Duration::from_millis(20));
        store.issue(root());
        store.issue(root());
        std::thread::sleep(Duration::from_millis(40));
        let fresh = store.issue(root());
        assert_eq!(store.len(), 1);
        assert!(store.lookup(&fresh).is_some());
    }

    #[test]
    fn test_keepalive_extends_lifetime() {
        let store = TokenStore::new(Duration::from_millis(80));
        let token = store.issue(root());
        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(40));
            assert!(store.keepalive(&token));
        }
        assert!(store.lookup(&token).is_some());
    }
}
