// SPDX-License-Identifier: Apache-2.0

//! Principal authentication
//!
//! The session service delegates credential checks to an [`Authenticator`].
//! [`PasswordAuthenticator`] is the built-in directory used when no external
//! identity provider is wired in.

use std::collections::HashMap;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tessera_core::{EngineError, EngineResult, LogonFailureKind, VdbRef};

use crate::observability::Sensitive;

/// What a client presents at logon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: Sensitive<String>,
    pub vdb_name: String,
    /// Latest deployed version when unset.
    #[serde(default)]
    pub vdb_version: Option<u32>,
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        vdb_name: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: Sensitive::new(password.into()),
            vdb_name: vdb_name.into(),
            vdb_version: None,
        }
    }

    pub fn with_vdb_version(mut self, version: u32) -> Self {
        self.vdb_version = Some(version);
        self
    }
}

/// A principal that passed authentication, bound to the VDB it asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub username: String,
    pub vdb: VdbRef,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Fails with `LogonFailure` for unknown, frozen or badly authenticated
    /// accounts and `ComponentUnavailable` when the provider cannot answer.
    async fn authenticate(&self, credentials: &Credentials) -> EngineResult<AuthenticatedUser>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    Active,
    Frozen,
}

struct Account {
    password_hash: String,
    state: AccountState,
}

/// In-memory user directory with Argon2 password hashes.
#[derive(Default)]
pub struct PasswordAuthenticator {
    accounts: RwLock<HashMap<String, Account>>,
    /// Deployed VDB name -> versions.
    vdbs: RwLock<HashMap<String, Vec<u32>>>,
}

impl PasswordAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, username: &str, password: &str) -> EngineResult<()> {
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| EngineError::internal(format!("Hashing error: {}", e)))?
            .to_string();

        self.accounts.write().insert(
            username.to_string(),
            Account {
                password_hash,
                state: AccountState::Active,
            },
        );
        Ok(())
    }

    pub fn remove_user(&self, username: &str) -> bool {
        self.accounts.write().remove(username).is_some()
    }

    pub fn set_state(&self, username: &str, state: AccountState) -> EngineResult<()> {
        let mut accounts = self.accounts.write();
        let account = accounts
            .get_mut(username)
            .ok_or_else(|| EngineError::invalid_argument(format!("unknown user {username}")))?;
        account.state = state;
        Ok(())
    }

    pub fn deploy_vdb(&self, name: &str, version: u32) {
        let mut vdbs = self.vdbs.write();
        let versions = vdbs.entry(name.to_string()).or_default();
        if !versions.contains(&version) {
            versions.push(version);
            versions.sort_unstable();
        }
    }

    fn resolve_vdb(&self, name: &str, version: Option<u32>) -> EngineResult<VdbRef> {
        let vdbs = self.vdbs.read();
        let versions = vdbs.get(name).map(Vec::as_slice).unwrap_or_default();
        let chosen = match version {
            Some(v) => versions.contains(&v).then_some(v),
            None => versions.last().copied(),
        };
        chosen.map(|v| VdbRef::new(name, v)).ok_or_else(|| {
            EngineError::logon_failure(
                LogonFailureKind::UnknownVdb,
                format!("VDB {name} is not deployed"),
            )
        })
    }
}

#[async_trait]
impl Authenticator for PasswordAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> EngineResult<AuthenticatedUser> {
        let (stored_hash, state) = {
            let accounts = self.accounts.read();
            let account = accounts.get(&credentials.username).ok_or_else(|| {
                EngineError::logon_failure(
                    LogonFailureKind::UnknownAccount,
                    format!("account {} does not exist", credentials.username),
                )
            })?;
            (account.password_hash.clone(), account.state)
        };

        let parsed_hash = PasswordHash::new(&stored_hash)
            .map_err(|e| EngineError::internal(format!("Invalid stored hash: {}", e)))?;
        if Argon2::default()
            .verify_password(credentials.password.expose().as_bytes(), &parsed_hash)
            .is_err()
        {
            return Err(EngineError::logon_failure(
                LogonFailureKind::BadCredentials,
                "the supplied credentials are not valid",
            ));
        }

        if state == AccountState::Frozen {
            return Err(EngineError::logon_failure(
                LogonFailureKind::AccountFrozen,
                format!("account {} is frozen", credentials.username),
            ));
        }

        let vdb = self.resolve_vdb(&credentials.vdb_name, credentials.vdb_version)?;
        Ok(AuthenticatedUser {
            username: credentials.username.clone(),
            vdb,
        })
    }
}
