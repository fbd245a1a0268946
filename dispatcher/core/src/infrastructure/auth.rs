// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Session Authentication
//
// Users come from the `auth` section of the configuration. Passwords are
// stored as hex encoded SHA-256 digests.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::domain::node_config::{AuthConfig, UserConfig};
use crate::domain::session::Principal;

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns the principal for valid credentials
    async fn authenticate(&self, username: &str, password: &str) -> Option<Principal>;
}

pub struct StaticAuthenticator {
    users: Vec<UserConfig>,
}

impl StaticAuthenticator {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            users: config.users.clone(),
        }
    }

    pub fn hash_password(password: &str) -> String {
        hex::encode(Sha256::digest(password.as_bytes()))
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, username: &str, password: &str) -> Option<Principal> {
        let Some(user) = self.users.iter().find(|u| u.username == username) else {
            warn!(username = %username, "Login attempt for unknown user");
            return None;
        };

        let digest = Sha256::digest(password.as_bytes());
        let expected = hex::decode(&user.password_sha256).ok()?;
        let matches = expected.len() == digest.len()
            && expected
                .iter()
                .zip(digest.iter())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0;

        if matches {
            info!(username = %username, "User authenticated");
            Some(Principal {
                username: user.username.clone(),
                privileged: user.privileged,
            })
        } else {
            warn!(username = %username, "Invalid password");
            None
        }
    }
}
