//! Authentication and identity.
//!
//! Two parallel modes: dashboard cookie sessions (in memory, 12h TTL,
//! gone on restart) and bearer tokens (HMAC-hashed, durable). Every
//! resolved request carries an [`Identity`]; permission checks happen
//! against it at the surfaces.

use chrono::{DateTime, Duration, Utc};
use onlyboxes_db::{AccountRow, Database, TokenRow};
use onlyboxes_protocol::{AccountId, TokenId};
use onlyboxes_security::{
    generate_cookie, generate_secret, hash_password, mask_secret, verify_password, SecretHasher,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::info;

/// The account behind a resolved cookie or bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub account_id: AccountId,
    pub is_admin: bool,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("not authorized")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
struct DashboardSession {
    account_id: AccountId,
    expires_at: DateTime<Utc>,
}

pub struct AuthService {
    db: Database,
    hasher: Arc<SecretHasher>,
    sessions: Mutex<HashMap<String, DashboardSession>>,
    session_ttl: Duration,
    registration_enabled: bool,
}

impl AuthService {
    pub fn new(
        db: Database,
        hasher: Arc<SecretHasher>,
        session_ttl: Duration,
        registration_enabled: bool,
    ) -> Self {
        Self {
            db,
            hasher,
            sessions: Mutex::new(HashMap::new()),
            session_ttl,
            registration_enabled,
        }
    }

    /// Create the first admin account from config if no admin exists yet.
    pub async fn bootstrap_admin(&self, username: &str, password: &str) -> Result<(), AuthError> {
        if self.db.accounts().count_admins().await? > 0 {
            return Ok(());
        }
        let hash = hash_password(password).map_err(|e| AuthError::Store(e.into()))?;
        self.db
            .accounts()
            .insert(&AccountId::new(), username, &hash, true, Utc::now())
            .await?;
        info!(username, "Bootstrapped first admin account");
        Ok(())
    }

    // ========================================================================
    // Dashboard sessions (cookie)
    // ========================================================================

    pub async fn login(&self, username: &str, password: &str) -> Result<(String, AccountRow), AuthError> {
        let account = self
            .db
            .accounts()
            .get_by_username(username)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        if !verify_password(password, &account.password_hash) {
            return Err(AuthError::InvalidCredentials);
        }

        let cookie = generate_cookie();
        let account_id =
            AccountId::parse(&account.account_id).map_err(|e| AuthError::Store(anyhow::anyhow!(e)))?;
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        sessions.insert(
            cookie.clone(),
            DashboardSession {
                account_id,
                expires_at: Utc::now() + self.session_ttl,
            },
        );
        Ok((cookie, account))
    }

    pub fn logout(&self, cookie: &str) {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        sessions.remove(cookie);
    }

    /// Resolve a cookie to an identity. The account row is re-read so a
    /// deleted account or a changed admin flag takes effect immediately.
    pub async fn resolve_cookie(&self, cookie: &str) -> Result<Option<Identity>, AuthError> {
        let session = {
            let mut sessions = self.sessions.lock().expect("session lock poisoned");
            match sessions.get(cookie) {
                Some(session) if session.expires_at > Utc::now() => session.clone(),
                Some(_) => {
                    sessions.remove(cookie);
                    return Ok(None);
                }
                None => return Ok(None),
            }
        };
        let Some(account) = self.db.accounts().get(&session.account_id).await? else {
            self.logout(cookie);
            return Ok(None);
        };
        Ok(Some(Identity {
            account_id: session.account_id,
            is_admin: account.is_admin,
        }))
    }

    /// Change the caller's password; every session of that account is
    /// rotated out.
    pub async fn change_password(
        &self,
        account_id: &AccountId,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let account = self
            .db
            .accounts()
            .get(account_id)
            .await?
            .ok_or(AuthError::NotFound)?;
        if !verify_password(current_password, &account.password_hash) {
            return Err(AuthError::InvalidCredentials);
        }
        let hash = hash_password(new_password).map_err(|e| AuthError::Store(e.into()))?;
        self.db
            .accounts()
            .update_password(account_id, &hash, Utc::now())
            .await?;

        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        sessions.retain(|_, session| session.account_id != *account_id);
        Ok(())
    }

    // ========================================================================
    // Bearer tokens
    // ========================================================================

    /// Resolve `Authorization: Bearer <value>` by HMAC hash lookup.
    pub async fn resolve_bearer(&self, presented: &str) -> Result<Option<Identity>, AuthError> {
        let token_hash = self.hasher.hash(presented);
        let Some(token) = self.db.tokens().get_by_hash(&token_hash).await? else {
            return Ok(None);
        };
        let account_id =
            AccountId::parse(&token.account_id).map_err(|e| AuthError::Store(anyhow::anyhow!(e)))?;
        let Some(account) = self.db.accounts().get(&account_id).await? else {
            return Ok(None);
        };
        Ok(Some(Identity {
            account_id,
            is_admin: account.is_admin,
        }))
    }

    pub async fn list_tokens(&self, identity: &Identity) -> Result<Vec<TokenRow>, AuthError> {
        Ok(self.db.tokens().list_by_account(&identity.account_id).await?)
    }

    /// Mint a token. The plaintext in the return value is shown exactly
    /// once; only its HMAC and masked suffix are stored.
    pub async fn create_token(
        &self,
        identity: &Identity,
        name: &str,
    ) -> Result<(TokenRow, String), AuthError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AuthError::Conflict("token name is required".into()));
        }
        if self
            .db
            .tokens()
            .get_by_name(&identity.account_id, name)
            .await?
            .is_some()
        {
            return Err(AuthError::Conflict(format!(
                "token name '{name}' already exists"
            )));
        }

        let plaintext = generate_secret();
        let token_id = TokenId::new();
        self.db
            .tokens()
            .insert(
                &token_id,
                &identity.account_id,
                name,
                &self.hasher.hash(&plaintext),
                &mask_secret(&plaintext),
                Utc::now(),
            )
            .await?;
        let row = self
            .db
            .tokens()
            .get(&token_id)
            .await?
            .ok_or_else(|| AuthError::Store(anyhow::anyhow!("token vanished after insert")))?;
        Ok((row, plaintext))
    }

    pub async fn delete_token(
        &self,
        identity: &Identity,
        token_id: &TokenId,
    ) -> Result<bool, AuthError> {
        Ok(self.db.tokens().delete(token_id, &identity.account_id).await?)
    }

    // ========================================================================
    // Account administration
    // ========================================================================

    /// Admin registration of a new account, gated by the deploy flag.
    pub async fn register_account(
        &self,
        requester: &Identity,
        username: &str,
        password: &str,
        is_admin: bool,
    ) -> Result<AccountRow, AuthError> {
        if !requester.is_admin || !self.registration_enabled {
            return Err(AuthError::Forbidden);
        }
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::Conflict("username and password are required".into()));
        }
        if self.db.accounts().get_by_username(username).await?.is_some() {
            return Err(AuthError::Conflict(format!(
                "username '{username}' already exists"
            )));
        }
        let hash = hash_password(password).map_err(|e| AuthError::Store(e.into()))?;
        let account_id = AccountId::new();
        self.db
            .accounts()
            .insert(&account_id, username, &hash, is_admin, Utc::now())
            .await?;
        let row = self
            .db
            .accounts()
            .get(&account_id)
            .await?
            .ok_or_else(|| AuthError::Store(anyhow::anyhow!("account vanished after insert")))?;
        Ok(row)
    }

    pub async fn list_accounts(
        &self,
        requester: &Identity,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<AccountRow>, u64), AuthError> {
        if !requester.is_admin {
            return Err(AuthError::Forbidden);
        }
        Ok(self.db.accounts().list_page(page, page_size).await?)
    }

    /// Delete a non-admin account. Self-deletion and admin deletion are
    /// forbidden regardless of role.
    pub async fn delete_account(
        &self,
        requester: &Identity,
        target: &AccountId,
    ) -> Result<(), AuthError> {
        if !requester.is_admin {
            return Err(AuthError::Forbidden);
        }
        if requester.account_id == *target {
            return Err(AuthError::Conflict("cannot delete your own account".into()));
        }
        let Some(account) = self.db.accounts().get(target).await? else {
            return Err(AuthError::NotFound);
        };
        if account.is_admin {
            return Err(AuthError::Conflict("admin accounts cannot be deleted".into()));
        }
        if !self.db.accounts().delete_non_admin(target).await? {
            return Err(AuthError::NotFound);
        }

        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        sessions.retain(|_, session| session.account_id != *target);
        Ok(())
    }
}
