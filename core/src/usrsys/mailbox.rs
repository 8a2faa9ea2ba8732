/*
 * mailbox.rs
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

//! The logic mailbox: places messages into (and removes them from) one
//! `MailBoxRecord`, keeping the mail store's reference counts straight.

use serde_json::Value;

use crate::mailstore::{MailStore, MailStoreError};
use crate::mime::MailMessage;
use crate::storage::{query, StorageError};

use super::storage::{MailBoxRecordStorage, MailRecordStorage};
use super::usr::{MailBoxRecord, MailRecord};

pub struct MailBox {
    mailbox_record: MailBoxRecord,
    mail_record_storage: MailRecordStorage,
    mail_store: MailStore,
    #[allow(dead_code)]
    mailbox_record_storage: MailBoxRecordStorage,
}

impl MailBox {
    pub fn new(
        mailbox_record: MailBoxRecord,
        mail_record_storage: MailRecordStorage,
        mail_store: MailStore,
        mailbox_record_storage: MailBoxRecordStorage,
    ) -> Self {
        Self { mailbox_record, mail_record_storage, mail_store, mailbox_record_storage }
    }

    pub fn id(&self) -> &str {
        &self.mailbox_record.identity
    }

    pub fn record(&self) -> &MailBoxRecord {
        &self.mailbox_record
    }

    /// Place `mail` into this mailbox: one reference in the mail store
    /// plus one index row.
    pub async fn append_mail(&self, mail: &MailMessage) -> Result<MailRecord, MailStoreError> {
        let stored = self.mail_store.store_mail(mail).await?;
        let row = MailRecord {
            mailbox_id: self.mailbox_record.identity.clone(),
            message_id: stored.message_id,
        };
        self.mail_record_storage.store(&row).await?;
        Ok(row)
    }

    /// Message ids placed in this mailbox, in placement order.
    pub async fn message_ids(&self) -> Result<Vec<String>, StorageError> {
        let rows = self
            .mail_record_storage
            .find(query([("mailbox_id", self.mailbox_record.identity.as_str())]))
            .await?
            .collect()
            .await?;
        Ok(rows.into_iter().map(|r| r.message_id).collect())
    }

    /// Remove one placement of `message_id` from this mailbox and drop
    /// its mail-store reference. Returns false when it was not placed
    /// here.
    pub async fn remove_mail(&self, message_id: &str) -> Result<bool, MailStoreError> {
        let removed = self
            .mail_record_storage
            .remove_one(query([
                ("mailbox_id", Value::from(self.mailbox_record.identity.as_str())),
                ("message_id", Value::from(message_id)),
            ]))
            .await
            .map_err(MailStoreError::from)?;
        if removed {
            self.mail_store.deref_mail_by_id(message_id).await?;
        }
        Ok(removed)
    }
}
