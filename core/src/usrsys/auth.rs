/*
 * auth.rs
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

//! The authentication provider: turns a username/password pair or a
//! token into an authenticated answer, optionally minting a new token.

use super::storage::{TokenRecordStorage, UserRecordStorage, UserStorageError};

/// An authentication request. Passwords never appear in logs.
#[derive(Debug, Clone, Default)]
pub struct AuthRequest {
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub appid: Option<String>,
    /// Scope for a newly minted token; empty defaults to `[act_as_user]`.
    pub new_token_scope: Vec<String>,
    /// Mint and return a token on successful password auth.
    pub request_token: bool,
    /// Expiration offset in seconds for a minted token.
    pub token_expiration_offset: Option<i64>,
}

impl AuthRequest {
    pub fn with_password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            ..Self::default()
        }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self { token: Some(token.into()), ..Self::default() }
    }
}

/// The provider's answer. `handled` is false when the request carried
/// nothing this provider understands.
#[derive(Debug, Clone, Default)]
pub struct AuthAnswer {
    pub handled: bool,
    pub success: bool,
    pub required_second_factors: Vec<String>,
    pub scope: Vec<String>,
    pub token: Option<String>,
}

impl AuthAnswer {
    fn unhandled() -> Self {
        Self::default()
    }

    fn rejected() -> Self {
        Self { handled: true, ..Self::default() }
    }
}

pub struct AuthProvider {
    user_records: UserRecordStorage,
    token_records: TokenRecordStorage,
}

impl AuthProvider {
    pub fn new(user_records: UserRecordStorage, token_records: TokenRecordStorage) -> Self {
        Self { user_records, token_records }
    }

    /// Authenticate `request`.
    ///
    /// Username + password: the user is looked up and the password
    /// verified on the worker pool; with `request_token` set a fresh
    /// token is minted and its string returned in the answer.
    /// Token: the token must exist and be available; its scope is
    /// echoed back. Anything else is unhandled.
    pub async fn auth(&self, request: AuthRequest) -> Result<AuthAnswer, UserStorageError> {
        if let (Some(username), Some(password)) = (&request.username, &request.password) {
            let Some(user) = self.user_records.find_user_by_username(username).await? else {
                return Ok(AuthAnswer::rejected());
            };
            let good = self
                .user_records
                .check_user_password(username, password.as_bytes())
                .await?;
            if !good {
                return Ok(AuthAnswer::rejected());
            }
            let mut answer = AuthAnswer { handled: true, success: true, ..AuthAnswer::default() };
            if request.request_token {
                let token = self
                    .token_records
                    .create_token(
                        &user.profileid,
                        request.appid.as_deref(),
                        None,
                        request.new_token_scope.clone(),
                        request.token_expiration_offset,
                    )
                    .await?;
                answer.scope = token.scope.clone();
                answer.token = Some(token.token);
            }
            return Ok(answer);
        }
        if let Some(token) = &request.token {
            let Some(record) = self.token_records.find_token(token).await? else {
                return Ok(AuthAnswer::rejected());
            };
            if !record.is_available() {
                return Ok(AuthAnswer::rejected());
            }
            return Ok(AuthAnswer {
                handled: true,
                success: true,
                scope: record.scope.clone(),
                ..AuthAnswer::default()
            });
        }
        Ok(AuthAnswer::unhandled())
    }
}
