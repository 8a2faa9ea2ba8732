/*
 * mailstore.rs
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

//! The mail store keeps raw messages content-addressed by their
//! `Message-Id` header, reference-counted by the index rows (and queue
//! entries) that point at them. Nothing else may delete a stored mail.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::mime::MailMessage;
use crate::storage::{query, CommonStorage, CommonStorageRecordWrapper, StorageError};

/// A stored mail. `ref_count` equals the number of mailbox placements
/// (plus queue entries) referencing `message_id`; the record is deleted
/// when the count reaches zero on decrement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailStoreRecord {
    pub message_id: String,
    pub raw_mail: String,
    pub ref_count: i64,
}

#[derive(Debug)]
pub enum MailStoreError {
    /// The message has no `Message-Id` header to address it by.
    MissingMessageId,
    Storage(StorageError),
}

impl std::fmt::Display for MailStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailStoreError::MissingMessageId => write!(f, "message has no Message-Id header"),
            MailStoreError::Storage(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for MailStoreError {}

impl From<StorageError> for MailStoreError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

/// Interface for storing mail itself (not to be confused with the mail
/// index rows or mailbox records).
#[derive(Clone)]
pub struct MailStore {
    records: CommonStorageRecordWrapper<MailStoreRecord>,
}

impl MailStore {
    pub fn new(common_storage: Arc<dyn CommonStorage>) -> Self {
        Self { records: CommonStorageRecordWrapper::new(common_storage) }
    }

    /// Store `mail` under its message id: a first placement stores the
    /// raw text with `ref_count` 1, further placements only bump the
    /// count.
    pub async fn store_mail(&self, mail: &MailMessage) -> Result<MailStoreRecord, MailStoreError> {
        let message_id = mail.header("Message-Id").ok_or(MailStoreError::MissingMessageId)?;
        if let Some(mut record) = self.find_mail_by_id(message_id).await? {
            record.ref_count += 1;
            self.records
                .update_one(query([("message_id", message_id)]), &record)
                .await?;
            return Ok(record);
        }
        let record = MailStoreRecord {
            message_id: message_id.to_string(),
            raw_mail: mail.to_wire_string(),
            ref_count: 1,
        };
        self.records.store(&record).await?;
        Ok(record)
    }

    pub async fn find_mail_by_id(&self, message_id: &str) -> Result<Option<MailStoreRecord>, MailStoreError> {
        Ok(self.records.find_one(query([("message_id", message_id)])).await?)
    }

    /// Drop one reference to `message_id`. When the count reaches zero
    /// the record is deleted. Returns `None` only when the message is
    /// not stored at all.
    pub async fn deref_mail_by_id(&self, message_id: &str) -> Result<Option<MailStoreRecord>, MailStoreError> {
        let Some(mut record) = self.find_mail_by_id(message_id).await? else {
            return Ok(None);
        };
        record.ref_count -= 1;
        if record.ref_count <= 0 {
            self.records.remove_one(query([("message_id", message_id)])).await?;
        } else {
            self.records
                .update_one(query([("message_id", message_id)]), &record)
                .await?;
        }
        Ok(Some(record))
    }
}
