/*
 * storage.rs
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

//! Typed record storages for the user system. Each is the generic
//! record wrapper specialised to one record type, with the operations
//! that belong to that collection.

use crate::storage::{query, CommonStorageRecordWrapper, StorageError};
use crate::utils::passwords::{password_check, password_hashing, PasswordError};

use super::tk::TokenRecord;
use super::usr::{MailBoxRecord, MailRecord, ProfileRecord, UserRecord};

pub type UserRecordStorage = CommonStorageRecordWrapper<UserRecord>;
pub type ProfileRecordStorage = CommonStorageRecordWrapper<ProfileRecord>;
pub type MailBoxRecordStorage = CommonStorageRecordWrapper<MailBoxRecord>;
pub type MailRecordStorage = CommonStorageRecordWrapper<MailRecord>;
pub type TokenRecordStorage = CommonStorageRecordWrapper<TokenRecord>;

/// Failures from user-record operations that mix storage and password
/// hashing.
#[derive(Debug)]
pub enum UserStorageError {
    Storage(StorageError),
    Password(PasswordError),
}

impl std::fmt::Display for UserStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserStorageError::Storage(e) => write!(f, "{}", e),
            UserStorageError::Password(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for UserStorageError {}

impl From<StorageError> for UserStorageError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<PasswordError> for UserStorageError {
    fn from(e: PasswordError) -> Self {
        Self::Password(e)
    }
}

impl CommonStorageRecordWrapper<UserRecord> {
    pub async fn find_user_by_username(&self, username: &str) -> Result<Option<UserRecord>, StorageError> {
        self.find_one(query([("username", username)])).await
    }

    /// Verify `password` for `username`. Unknown users verify false.
    pub async fn check_user_password(
        &self,
        username: &str,
        password: &[u8],
    ) -> Result<bool, UserStorageError> {
        let Some(user) = self.find_user_by_username(username).await? else {
            return Ok(false);
        };
        Ok(password_check(password.to_vec(), user.password_b64hash).await?)
    }

    /// Hash `password` and store a fresh user linked to `profileid`.
    pub async fn create_new_user(
        &self,
        username: &str,
        password: &[u8],
        profileid: &str,
    ) -> Result<UserRecord, UserStorageError> {
        let hash = password_hashing(password.to_vec()).await?;
        Ok(self.store(&UserRecord::new(username, hash, profileid)).await?)
    }
}

impl CommonStorageRecordWrapper<ProfileRecord> {
    pub async fn create_new_profile(&self) -> Result<ProfileRecord, StorageError> {
        self.store(&ProfileRecord::new()).await
    }
}

impl CommonStorageRecordWrapper<MailBoxRecord> {
    pub async fn create_mailbox(&self) -> Result<MailBoxRecord, StorageError> {
        self.store(&MailBoxRecord::new()).await
    }
}

impl CommonStorageRecordWrapper<TokenRecord> {
    /// Mint and persist a token for `profileid`.
    pub async fn create_token(
        &self,
        profileid: &str,
        appid: Option<&str>,
        apprev: Option<&str>,
        scope: Vec<String>,
        expiration_offset_seconds: Option<i64>,
    ) -> Result<TokenRecord, StorageError> {
        self.store(&TokenRecord::new(profileid, appid, apprev, scope, expiration_offset_seconds))
            .await
    }

    pub async fn find_token(&self, token: &str) -> Result<Option<TokenRecord>, StorageError> {
        self.find_one(query([("token", token)])).await
    }
}
