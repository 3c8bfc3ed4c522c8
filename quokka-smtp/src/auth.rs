//! Authentication backends for SMTP AUTH.

use crate::error::{SmtpError, SmtpResult};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Decoded SASL PLAIN credentials (RFC 4616).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Authorization identity; empty when the client acts as itself.
    pub authzid: String,
    /// Authentication identity (the username).
    pub authcid: String,
    pub password: String,
}

impl Credentials {
    /// Splits a decoded PLAIN response `authzid NUL authcid NUL passwd`.
    pub fn from_plain(decoded: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(decoded).ok()?;
        let mut parts = text.split('\0');
        let authzid = parts.next()?;
        let authcid = parts.next()?;
        let password = parts.next()?;
        if parts.next().is_some() || authcid.is_empty() {
            return None;
        }

        Some(Self {
            authzid: authzid.to_string(),
            authcid: authcid.to_string(),
            password: password.to_string(),
        })
    }
}

/// Decides whether a set of credentials may use the server.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> bool;
}

/// Hashes a password into the Argon2id PHC string stored in config, e.g.
/// `$argon2id$v=19$m=19456,t=2,p=1$<salt>$<hash>`. Each call uses a fresh
/// random salt.
pub fn hash_password(password: &str) -> SmtpResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| SmtpError::PasswordHash(e.to_string()))
}

/// Whether `hash` is a PHC string for one of the Argon2 variants.
pub fn is_password_hash(hash: &str) -> bool {
    PasswordHash::new(hash).is_ok_and(|parsed| Algorithm::try_from(parsed.algorithm).is_ok())
}

/// Username to password-hash table loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    users: HashMap<String, Arc<str>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a user from an Argon2 PHC string. Returns `false` if the hash
    /// cannot be parsed.
    pub fn insert_hashed(&mut self, username: impl Into<String>, password_hash: &str) -> bool {
        if !is_password_hash(password_hash) {
            return false;
        }
        self.users.insert(username.into(), password_hash.into());
        true
    }

    pub fn with_user(mut self, username: impl Into<String>, password: &str) -> SmtpResult<Self> {
        let hash = hash_password(password)?;
        self.users.insert(username.into(), hash.into());
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

fn verify_password(password: &str, stored: &str) -> bool {
    let Ok(hash) = PasswordHash::new(stored) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &hash)
        .is_ok()
}

#[async_trait]
impl Authenticator for StaticCredentials {
    async fn authenticate(&self, credentials: &Credentials) -> bool {
        // Acting on behalf of another identity is not supported.
        if !credentials.authzid.is_empty() && credentials.authzid != credentials.authcid {
            return false;
        }

        let Some(stored) = self.users.get(&credentials.authcid).cloned() else {
            return false;
        };
        let password = credentials.password.clone();

        match tokio::task::spawn_blocking(move || verify_password(&password, &stored)).await {
            Ok(verified) => verified,
            Err(e) => {
                warn!("spawn_blocking panicked verifying password: {}", e);
                false
            }
        }
    }
}

/// Rejects every attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

#[async_trait]
impl Authenticator for DenyAll {
    async fn authenticate(&self, _credentials: &Credentials) -> bool {
        false
    }
}
