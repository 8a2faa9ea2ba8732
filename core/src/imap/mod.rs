/*
 * mod.rs
 * Copyright (C) 2026 The Mailboat Contributors
 *
 * This file is part of Mailboat, a self-hosted mail server.
 *
 * Mailboat is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Mailboat is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Mailboat.  If not, see <http://www.gnu.org/licenses/>.
 */

//! The IMAP backend binding: maps authenticated identities to mailbox
//! sets and satisfies a mail-user-agent session.
//!
//! Two authcid types are accepted: `login-token` (a token string whose
//! scope must cover `act_as_user` without being as broad as `mail`) and
//! plain password credentials, which mint a fresh `act_as_user` token.
//! `admin-token` is rejected outright: superuser tokens must not expose
//! other users' mailboxes.

pub mod filter;
pub mod mailbox;
pub mod server;

pub use filter::FilterSet;
pub use mailbox::{FlagsMode, ImapMailboxError, MailboxSet, SelectSummary};
pub use server::{ImapServer, ImapServerHandle};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::storage::{query, StorageError};
use crate::storagehub::StorageHub;
use crate::usrsys::auth::{AuthProvider, AuthRequest};
use crate::usrsys::storage::UserStorageError;
use crate::usrsys::tk::{TokenRecord, SCOPE_ACT_AS_USER};
use crate::usrsys::usr::UserRecord;

/// What the embedded IMAP front-end may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapability {
    pub idle: bool,
    pub object_id: bool,
    pub multi_append: bool,
}

/// Credentials as presented by the IMAP session layer.
#[derive(Debug, Clone)]
pub struct ImapCredentials {
    pub authcid: String,
    pub secret: Option<String>,
    pub authcid_type: Option<String>,
}

impl ImapCredentials {
    pub fn password(authcid: impl Into<String>, secret: impl Into<String>) -> Self {
        Self { authcid: authcid.into(), secret: Some(secret.into()), authcid_type: None }
    }

    pub fn login_token(token: impl Into<String>) -> Self {
        Self {
            authcid: token.into(),
            secret: None,
            authcid_type: Some("login-token".to_string()),
        }
    }
}

#[derive(Debug)]
pub enum ImapAuthError {
    /// Unknown user, bad password, or unusable token.
    InvalidAuth,
    /// The token exists but its scope is wrong for mailbox access.
    AuthorizationFailure,
    Backend(String),
}

impl std::fmt::Display for ImapAuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImapAuthError::InvalidAuth => write!(f, "invalid credentials"),
            ImapAuthError::AuthorizationFailure => write!(f, "authorization failure"),
            ImapAuthError::Backend(m) => write!(f, "backend failure: {}", m),
        }
    }
}

impl std::error::Error for ImapAuthError {}

impl From<StorageError> for ImapAuthError {
    fn from(e: StorageError) -> Self {
        Self::Backend(e.to_string())
    }
}

impl From<UserStorageError> for ImapAuthError {
    fn from(e: UserStorageError) -> Self {
        Self::Backend(e.to_string())
    }
}

/// The login half of the binding: authentication and the per-identity
/// (mailbox-set, filter-set) cache.
pub struct Login {
    auth_provider: Arc<AuthProvider>,
    storage_hub: Arc<StorageHub>,
    set_cache: AsyncMutex<HashMap<String, (Arc<MailboxSet>, Arc<FilterSet>)>>,
}

impl Login {
    pub fn new(auth_provider: Arc<AuthProvider>, storage_hub: Arc<StorageHub>) -> Self {
        Self { auth_provider, storage_hub, set_cache: AsyncMutex::new(HashMap::new()) }
    }

    pub fn backend_capability(&self) -> BackendCapability {
        BackendCapability { idle: true, object_id: true, multi_append: true }
    }

    async fn find_user_record(&self, profileid: &str) -> Result<Option<UserRecord>, StorageError> {
        self.storage_hub
            .user_records()
            .find_one(query([("profileid", profileid)]))
            .await
    }

    /// Authenticate `credentials` into an identity.
    pub async fn authenticate(
        self: &Arc<Self>,
        credentials: ImapCredentials,
    ) -> Result<Identity, ImapAuthError> {
        match credentials.authcid_type.as_deref() {
            Some("login-token") => {
                let token_record = self
                    .storage_hub
                    .token_records()
                    .find_token(&credentials.authcid)
                    .await?
                    .ok_or(ImapAuthError::InvalidAuth)?;
                if !token_record.is_available() {
                    return Err(ImapAuthError::InvalidAuth);
                }
                let user_record = self
                    .find_user_record(&token_record.profileid)
                    .await?
                    .ok_or(ImapAuthError::InvalidAuth)?;
                let scope = token_record.scope_object();
                if !scope.is_superset_of([SCOPE_ACT_AS_USER]) || scope.is_superset_of(["mail"]) {
                    return Err(ImapAuthError::AuthorizationFailure);
                }
                Ok(Identity::new(user_record, token_record, Arc::clone(self)))
            }
            None => {
                let secret = credentials.secret.ok_or(ImapAuthError::InvalidAuth)?;
                let answer = self
                    .auth_provider
                    .auth(AuthRequest::with_password(credentials.authcid.clone(), secret))
                    .await?;
                if !answer.handled || !answer.success {
                    return Err(ImapAuthError::InvalidAuth);
                }
                let user_record = self
                    .storage_hub
                    .user_records()
                    .find_user_by_username(&credentials.authcid)
                    .await?
                    .ok_or(ImapAuthError::InvalidAuth)?;
                let token_record = self.create_token_for_mail_access(&user_record, None).await?;
                Ok(Identity::new(user_record, token_record, Arc::clone(self)))
            }
            // no "admin-token": superusers are not shown other mailboxes
            Some(_) => Err(ImapAuthError::InvalidAuth),
        }
    }

    /// Mint an `act_as_user` token for mailbox access.
    async fn create_token_for_mail_access(
        &self,
        user_record: &UserRecord,
        expiration_offset_seconds: Option<i64>,
    ) -> Result<TokenRecord, ImapAuthError> {
        Ok(self
            .storage_hub
            .token_records()
            .create_token(
                &user_record.profileid,
                None,
                None,
                vec![SCOPE_ACT_AS_USER.to_string()],
                expiration_offset_seconds,
            )
            .await?)
    }

    async fn sets_for(&self, user: &UserRecord) -> (Arc<MailboxSet>, Arc<FilterSet>) {
        let mut cache = self.set_cache.lock().await;
        let entry = cache.entry(user.username.clone()).or_insert_with(|| {
            let mailbox_set = MailboxSet::new(
                user.clone(),
                self.storage_hub.mail_records(),
                self.storage_hub.mailstore(),
                self.storage_hub.mailbox_records(),
            );
            (Arc::new(mailbox_set), Arc::new(FilterSet::new()))
        });
        (Arc::clone(&entry.0), Arc::clone(&entry.1))
    }
}

/// An authenticated identity: the user plus the token the session runs
/// under.
pub struct Identity {
    user_record: UserRecord,
    token_record: TokenRecord,
    login: Arc<Login>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("user_record", &self.user_record)
            .field("token_record", &self.token_record)
            .finish()
    }
}

impl Identity {
    fn new(user_record: UserRecord, token_record: TokenRecord, login: Arc<Login>) -> Self {
        Self { user_record, token_record, login }
    }

    pub fn name(&self) -> &str {
        &self.user_record.username
    }

    pub fn user_record(&self) -> &UserRecord {
        &self.user_record
    }

    pub fn token(&self) -> &str {
        &self.token_record.token
    }

    /// Mint a further mail-access token. `None` when this identity's
    /// own token does not cover `act_as_user`.
    pub async fn new_token(
        &self,
        expiration_offset_seconds: Option<i64>,
    ) -> Result<Option<String>, ImapAuthError> {
        if !self
            .token_record
            .scope_object()
            .is_superset_of([SCOPE_ACT_AS_USER])
        {
            return Ok(None);
        }
        let record = self
            .login
            .create_token_for_mail_access(&self.user_record, expiration_offset_seconds)
            .await?;
        Ok(Some(record.token))
    }

    /// Open a session: the identity's cached mailbox and filter sets.
    /// Dropping the session releases them back to the cache.
    pub async fn new_session(&self) -> Result<Session, ImapAuthError> {
        let (mailbox_set, filter_set) = self.login.sets_for(&self.user_record).await;
        Ok(Session { owner: self.user_record.username.clone(), mailbox_set, filter_set })
    }
}

/// A live IMAP session's view of one identity's mail.
pub struct Session {
    owner: String,
    mailbox_set: Arc<MailboxSet>,
    filter_set: Arc<FilterSet>,
}

impl Session {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn mailbox_set(&self) -> &Arc<MailboxSet> {
        &self.mailbox_set
    }

    pub fn filter_set(&self) -> &Arc<FilterSet> {
        &self.filter_set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::engine::open_database;
    use crate::usrsys::tk::SCOPE_ACT_AS_USER;

    async fn login_fixture() -> (Arc<Login>, Arc<StorageHub>, UserRecord) {
        let hub = Arc::new(StorageHub::new(Arc::new(open_database(":mem:").unwrap())).unwrap());
        let user = hub.create_user("freeman", b"freemanpassword").await.unwrap();
        let provider = Arc::new(AuthProvider::new(hub.user_records(), hub.token_records()));
        (Arc::new(Login::new(provider, Arc::clone(&hub))), hub, user)
    }

    #[tokio::test]
    async fn password_login_mints_an_act_as_user_token() {
        let (login, hub, _user) = login_fixture().await;
        let identity = login
            .authenticate(ImapCredentials::password("freeman", "freemanpassword"))
            .await
            .unwrap();
        assert_eq!(identity.name(), "freeman");
        let stored = hub
            .token_records()
            .find_token(identity.token())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.scope, vec![SCOPE_ACT_AS_USER.to_string()]);

        let err = login
            .authenticate(ImapCredentials::password("freeman", "wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, ImapAuthError::InvalidAuth));
    }

    #[tokio::test]
    async fn token_login_enforces_scope_shape() {
        let (login, hub, user) = login_fixture().await;

        let narrow = hub
            .token_records()
            .create_token(&user.profileid, None, None, vec![SCOPE_ACT_AS_USER.to_string()], None)
            .await
            .unwrap();
        let identity = login
            .authenticate(ImapCredentials::login_token(narrow.token))
            .await
            .unwrap();
        assert_eq!(identity.name(), "freeman");

        // broader than required: the whole mail tree
        let broad = hub
            .token_records()
            .create_token(&user.profileid, None, None, vec!["mail".to_string()], None)
            .await
            .unwrap();
        let err = login
            .authenticate(ImapCredentials::login_token(broad.token))
            .await
            .unwrap_err();
        assert!(matches!(err, ImapAuthError::AuthorizationFailure));

        let err = login
            .authenticate(ImapCredentials::login_token("no-such-token"))
            .await
            .unwrap_err();
        assert!(matches!(err, ImapAuthError::InvalidAuth));
    }

    #[tokio::test]
    async fn admin_token_type_is_rejected() {
        let (login, hub, user) = login_fixture().await;
        let token = hub
            .token_records()
            .create_token(&user.profileid, None, None, vec![SCOPE_ACT_AS_USER.to_string()], None)
            .await
            .unwrap();
        let err = login
            .authenticate(ImapCredentials {
                authcid: token.token,
                secret: None,
                authcid_type: Some("admin-token".to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ImapAuthError::InvalidAuth));
    }

    #[tokio::test]
    async fn expired_token_is_unavailable() {
        let (login, hub, user) = login_fixture().await;
        let expired = hub
            .token_records()
            .create_token(
                &user.profileid,
                None,
                None,
                vec![SCOPE_ACT_AS_USER.to_string()],
                Some(-10),
            )
            .await
            .unwrap();
        let err = login
            .authenticate(ImapCredentials::login_token(expired.token))
            .await
            .unwrap_err();
        assert!(matches!(err, ImapAuthError::InvalidAuth));
    }

    #[tokio::test]
    async fn new_token_requires_act_as_user_and_sessions_share_the_cache() {
        let (login, _hub, _user) = login_fixture().await;
        let identity = login
            .authenticate(ImapCredentials::password("freeman", "freemanpassword"))
            .await
            .unwrap();
        let minted = identity.new_token(Some(3600)).await.unwrap();
        assert!(minted.is_some());

        let a = identity.new_session().await.unwrap();
        let b = identity.new_session().await.unwrap();
        assert!(Arc::ptr_eq(a.mailbox_set(), b.mailbox_set()));
        assert_eq!(a.owner(), "freeman");
    }
}
