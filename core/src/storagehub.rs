/*
 * storagehub.rs
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

//! The storage centre: one embedded database, named collections on top,
//! and the user-creation flow that touches several of them at once.
//!
//! The hub is the owned singleton of the star described in the design
//! notes; agents hold non-owning `Arc` references to it.

use std::sync::Arc;

use redb::Database;

use crate::mailstore::MailStore;
use crate::storage::engine::RedbStorage;
use crate::storage::{query, CommonStorage, CommonStorageRecordWrapper, StorageError};
use crate::usrsys::mailbox::MailBox;
use crate::usrsys::storage::{
    MailBoxRecordStorage, MailRecordStorage, ProfileRecordStorage, TokenRecordStorage,
    UserRecordStorage, UserStorageError,
};
use crate::usrsys::usr::{UserRecord, MAILBOX_DEFAULT_SETTING};

pub struct StorageHub {
    database: Arc<Database>,
    user_records: UserRecordStorage,
    profile_records: ProfileRecordStorage,
    mailbox_records: MailBoxRecordStorage,
    mail_records: MailRecordStorage,
    mailstore: MailStore,
    token_records: TokenRecordStorage,
}

impl StorageHub {
    /// Open the named collections over `database`.
    pub fn new(database: Arc<Database>) -> Result<Self, StorageError> {
        let open = |name: &str| -> Result<Arc<dyn CommonStorage>, StorageError> {
            Ok(Arc::new(RedbStorage::new(Arc::clone(&database), name)?))
        };
        Ok(Self {
            user_records: CommonStorageRecordWrapper::new(open("users")?),
            profile_records: CommonStorageRecordWrapper::new(open("profiles")?),
            mailbox_records: CommonStorageRecordWrapper::new(open("mailboxs")?),
            mail_records: CommonStorageRecordWrapper::new(open("mail_records")?),
            mailstore: MailStore::new(open("mails")?),
            token_records: CommonStorageRecordWrapper::new(open("tokens")?),
            database,
        })
    }

    /// Open an untyped collection with `name` (the transfer agent's
    /// queue lives in one of these).
    pub fn common_storage(&self, name: &str) -> Result<Arc<dyn CommonStorage>, StorageError> {
        Ok(Arc::new(RedbStorage::new(Arc::clone(&self.database), name)?))
    }

    pub fn user_records(&self) -> UserRecordStorage {
        self.user_records.clone()
    }

    pub fn profile_records(&self) -> ProfileRecordStorage {
        self.profile_records.clone()
    }

    pub fn mailbox_records(&self) -> MailBoxRecordStorage {
        self.mailbox_records.clone()
    }

    pub fn mail_records(&self) -> MailRecordStorage {
        self.mail_records.clone()
    }

    /// Mail content storage. Not to be confused with `mail_records`
    /// (placements) or `mailbox_records` (mailboxes): this one holds the
    /// mail itself.
    pub fn mailstore(&self) -> MailStore {
        self.mailstore.clone()
    }

    pub fn token_records(&self) -> TokenRecordStorage {
        self.token_records.clone()
    }

    /// Get the logic mailbox for `boxid`. `None` only when no record
    /// with that identity exists.
    pub async fn get_mailbox(&self, boxid: &str) -> Result<Option<MailBox>, StorageError> {
        if boxid.is_empty() {
            return Ok(None);
        }
        let Some(record) = self.mailbox_records.find_one(query([("identity", boxid)])).await? else {
            return Ok(None);
        };
        Ok(Some(MailBox::new(
            record,
            self.mail_records(),
            self.mailstore(),
            self.mailbox_records(),
        )))
    }

    /// Create a user with a fresh profile and the default mailbox set.
    pub async fn create_user(&self, username: &str, password: &[u8]) -> Result<UserRecord, UserStorageError> {
        let profile = self.profile_records.create_new_profile().await?;
        let mut user = self
            .user_records
            .create_new_user(username, password, &profile.identity)
            .await?;
        for name in MAILBOX_DEFAULT_SETTING {
            let mailbox = self.mailbox_records.create_mailbox().await?;
            user.mailboxes.insert(name.to_string(), mailbox.identity);
        }
        self.user_records
            .update_one(query([("profileid", user.profileid.as_str())]), &user)
            .await?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::engine::open_database;

    #[tokio::test]
    async fn create_user_sets_up_default_mailboxes() {
        let hub = StorageHub::new(Arc::new(open_database(":mem:").unwrap())).unwrap();
        let user = hub.create_user("alyx", b"alyxpassword").await.unwrap();

        assert_eq!(user.mailboxes.len(), MAILBOX_DEFAULT_SETTING.len());
        for name in MAILBOX_DEFAULT_SETTING {
            let boxid = user.mailboxes.get(name).expect("default mailbox present");
            assert!(hub.get_mailbox(boxid).await.unwrap().is_some());
        }

        let stored = hub
            .user_records()
            .find_user_by_username("alyx")
            .await
            .unwrap()
            .expect("user persisted");
        assert_eq!(stored.mailboxes, user.mailboxes);
        assert_eq!(stored.profileid, user.profileid);
    }

    #[tokio::test]
    async fn get_mailbox_of_unknown_identity_is_none() {
        let hub = StorageHub::new(Arc::new(open_database(":mem:").unwrap())).unwrap();
        assert!(hub.get_mailbox("").await.unwrap().is_none());
        assert!(hub.get_mailbox("no-such-box").await.unwrap().is_none());
    }
}
