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

//! Mailbox views for an IMAP session: record-backed message lists with
//! session flags and recent tracking.
//!
//! `MailRecord` rows are the durable truth for which message sits in
//! which mailbox; flags and `\Recent` live in this per-identity view,
//! refreshed from the records on every select so deliveries that
//! happened after the view was built are picked up.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};

use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::mailstore::{MailStore, MailStoreError};
use crate::mime::MailMessage;
use crate::storage::{query, StorageError};
use crate::usrsys::storage::{MailBoxRecordStorage, MailRecordStorage};
use crate::usrsys::usr::UserRecord;

#[derive(Debug)]
pub enum ImapMailboxError {
    NoSuchMailbox(String),
    Storage(StorageError),
    MailStore(MailStoreError),
}

impl std::fmt::Display for ImapMailboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImapMailboxError::NoSuchMailbox(name) => write!(f, "no such mailbox: {}", name),
            ImapMailboxError::Storage(e) => write!(f, "{}", e),
            ImapMailboxError::MailStore(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ImapMailboxError {}

impl From<StorageError> for ImapMailboxError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<MailStoreError> for ImapMailboxError {
    fn from(e: MailStoreError) -> Self {
        Self::MailStore(e)
    }
}

struct MessageEntry {
    message_id: String,
    uid: u32,
    flags: BTreeSet<String>,
    recent: bool,
    raw: String,
}

struct MailboxData {
    mailbox_id: String,
    readonly: bool,
    permanent_flags: Vec<String>,
    next_uid: u32,
    messages: Vec<MessageEntry>,
}

/// What SELECT reports about a mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectSummary {
    pub exists: u32,
    pub recent: u32,
    pub uidvalidity: u32,
    pub uidnext: u32,
    pub unseen: Option<u32>,
    pub flags: Vec<String>,
    pub readonly: bool,
}

/// How STORE changes flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagsMode {
    Add,
    Remove,
    Replace,
}

/// The mailbox views of one authenticated identity.
pub struct MailboxSet {
    user: UserRecord,
    mail_records: MailRecordStorage,
    mail_store: MailStore,
    mailbox_records: MailBoxRecordStorage,
    boxes: AsyncMutex<HashMap<String, MailboxData>>,
}

impl MailboxSet {
    pub fn new(
        user: UserRecord,
        mail_records: MailRecordStorage,
        mail_store: MailStore,
        mailbox_records: MailBoxRecordStorage,
    ) -> Self {
        Self {
            user,
            mail_records,
            mail_store,
            mailbox_records,
            boxes: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Mailbox names of this user, sorted for stable LIST output.
    pub fn mailbox_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.user.mailboxes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Canonical name for `requested` (IMAP clients say INBOX in any
    /// case).
    pub fn resolve_name(&self, requested: &str) -> Option<String> {
        self.user
            .mailboxes
            .keys()
            .find(|name| name.eq_ignore_ascii_case(requested))
            .cloned()
    }

    async fn load_or_refresh<'a>(
        &self,
        boxes: &'a mut HashMap<String, MailboxData>,
        name: &str,
    ) -> Result<&'a mut MailboxData, ImapMailboxError> {
        let canonical = self
            .resolve_name(name)
            .ok_or_else(|| ImapMailboxError::NoSuchMailbox(name.to_string()))?;
        let mailbox_id = self.user.mailboxes[&canonical].clone();
        let data = match boxes.entry(canonical) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let record = self
                    .mailbox_records
                    .find_one(query([("identity", mailbox_id.as_str())]))
                    .await?
                    .ok_or_else(|| ImapMailboxError::NoSuchMailbox(name.to_string()))?;
                entry.insert(MailboxData {
                    mailbox_id,
                    readonly: record.readonly,
                    permanent_flags: record.permanent_flags.iter().cloned().collect(),
                    next_uid: 1,
                    messages: Vec::new(),
                })
            }
        };

        // pick up placements that happened after the view was built
        let rows = self
            .mail_records
            .find(query([("mailbox_id", data.mailbox_id.as_str())]))
            .await?
            .collect()
            .await?;
        for row in rows {
            if data.messages.iter().any(|m| m.message_id == row.message_id) {
                continue;
            }
            let Some(stored) = self.mail_store.find_mail_by_id(&row.message_id).await? else {
                warn!(message_id = %row.message_id, "mail record points at missing mail");
                continue;
            };
            let uid = data.next_uid;
            data.next_uid += 1;
            data.messages.push(MessageEntry {
                message_id: row.message_id,
                uid,
                flags: BTreeSet::new(),
                recent: true,
                raw: stored.raw_mail,
            });
        }
        Ok(data)
    }

    /// Open `name`: refresh the view and report counts. Recent messages
    /// are claimed by this select and not reported again.
    pub async fn select(&self, name: &str) -> Result<SelectSummary, ImapMailboxError> {
        let mut boxes = self.boxes.lock().await;
        let data = self.load_or_refresh(&mut boxes, name).await?;
        let recent = data.messages.iter().filter(|m| m.recent).count() as u32;
        let unseen = data
            .messages
            .iter()
            .position(|m| !m.flags.contains("\\Seen"))
            .map(|i| i as u32 + 1);
        let summary = SelectSummary {
            exists: data.messages.len() as u32,
            recent,
            uidvalidity: 1,
            uidnext: data.next_uid,
            unseen,
            flags: data.permanent_flags.clone(),
            readonly: data.readonly,
        };
        for message in &mut data.messages {
            message.recent = false;
        }
        Ok(summary)
    }

    /// Sequence numbers (1-based) of messages whose From header
    /// contains `needle`.
    pub async fn search_from(&self, name: &str, needle: &str) -> Result<Vec<u32>, ImapMailboxError> {
        let mut boxes = self.boxes.lock().await;
        let data = self.load_or_refresh(&mut boxes, name).await?;
        let mut hits = Vec::new();
        for (i, entry) in data.messages.iter().enumerate() {
            let from = MailMessage::parse(&entry.raw).header("From").map(str::to_string);
            if from.is_some_and(|f| f.contains(needle)) {
                hits.push(i as u32 + 1);
            }
        }
        Ok(hits)
    }

    /// Raw message text by sequence number.
    pub async fn fetch_raw(&self, name: &str, seq: u32) -> Result<Option<String>, ImapMailboxError> {
        if seq == 0 {
            return Ok(None);
        }
        let mut boxes = self.boxes.lock().await;
        let data = self.load_or_refresh(&mut boxes, name).await?;
        Ok(data.messages.get(seq as usize - 1).map(|m| m.raw.clone()))
    }

    /// Change flags of the message at `seq`; returns the flags after
    /// the change, or `None` for an out-of-range sequence number.
    pub async fn store_flags(
        &self,
        name: &str,
        seq: u32,
        mode: FlagsMode,
        flags: &[String],
    ) -> Result<Option<Vec<String>>, ImapMailboxError> {
        if seq == 0 {
            return Ok(None);
        }
        let mut boxes = self.boxes.lock().await;
        let data = self.load_or_refresh(&mut boxes, name).await?;
        let Some(entry) = data.messages.get_mut(seq as usize - 1) else {
            return Ok(None);
        };
        match mode {
            FlagsMode::Add => entry.flags.extend(flags.iter().cloned()),
            FlagsMode::Remove => {
                for flag in flags {
                    entry.flags.remove(flag);
                }
            }
            FlagsMode::Replace => {
                entry.flags = flags.iter().cloned().collect();
            }
        }
        Ok(Some(entry.flags.iter().cloned().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::engine::open_database;
    use crate::storagehub::StorageHub;
    use std::sync::Arc;

    async fn set_with_one_mail() -> (MailboxSet, StorageHub) {
        let hub = StorageHub::new(Arc::new(open_database(":mem:").unwrap())).unwrap();
        let user = hub.create_user("freeman", b"freemanpassword").await.unwrap();
        let inbox_id = user.mailboxes["Inbox"].clone();
        let inbox = hub.get_mailbox(&inbox_id).await.unwrap().unwrap();
        let mail = MailMessage::parse(
            "Message-Id: <hello@foo.bar>\r\nFrom: alyx@foo.bar\r\nTo: freeman@foo.bar\r\n\r\nhi\r\n",
        );
        inbox.append_mail(&mail).await.unwrap();
        let set = MailboxSet::new(
            user,
            hub.mail_records(),
            hub.mailstore(),
            hub.mailbox_records(),
        );
        (set, hub)
    }

    #[tokio::test]
    async fn select_reports_recent_once() {
        let (set, _hub) = set_with_one_mail().await;
        let first = set.select("INBOX").await.unwrap();
        assert_eq!(first.exists, 1);
        assert_eq!(first.recent, 1);
        let second = set.select("Inbox").await.unwrap();
        assert_eq!(second.exists, 1);
        assert_eq!(second.recent, 0);
    }

    #[tokio::test]
    async fn select_sees_deliveries_after_the_view_was_built() {
        let (set, hub) = set_with_one_mail().await;
        set.select("Inbox").await.unwrap();

        let inbox_id = set.user.mailboxes["Inbox"].clone();
        let inbox = hub.get_mailbox(&inbox_id).await.unwrap().unwrap();
        let mail = MailMessage::parse("Message-Id: <late@foo.bar>\r\nFrom: barney@foo.bar\r\n\r\nyo\r\n");
        inbox.append_mail(&mail).await.unwrap();

        let summary = set.select("Inbox").await.unwrap();
        assert_eq!(summary.exists, 2);
        assert_eq!(summary.recent, 1);
    }

    #[tokio::test]
    async fn search_fetch_and_store_flags() {
        let (set, _hub) = set_with_one_mail().await;
        set.select("Inbox").await.unwrap();

        assert_eq!(set.search_from("Inbox", "alyx@foo.bar").await.unwrap(), vec![1]);
        assert!(set.search_from("Inbox", "gman@foo.bar").await.unwrap().is_empty());

        let raw = set.fetch_raw("Inbox", 1).await.unwrap().unwrap();
        assert!(raw.contains("hi"));
        assert!(set.fetch_raw("Inbox", 2).await.unwrap().is_none());

        let flags = set
            .store_flags("Inbox", 1, FlagsMode::Add, &["\\Seen".to_string()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(flags, vec!["\\Seen".to_string()]);
        let summary = set.select("Inbox").await.unwrap();
        assert_eq!(summary.unseen, None);
    }

    #[tokio::test]
    async fn unknown_mailbox_is_an_error() {
        let (set, _hub) = set_with_one_mail().await;
        assert!(matches!(
            set.select("NoSuchBox").await,
            Err(ImapMailboxError::NoSuchMailbox(_))
        ));
    }
}
