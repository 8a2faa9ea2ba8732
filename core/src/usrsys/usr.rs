/*
 * usr.rs
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

//! Persistent user-system records: users, profiles, mailboxes and the
//! mail index rows that place messages into mailboxes.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mailboxes every user gets at registration.
pub const MAILBOX_DEFAULT_SETTING: [&str; 6] =
    ["Inbox", "Drafts", "Sent", "Archives", "Junk", "Deleted"];

/// Flags a fresh mailbox may store permanently.
pub const DEFAULT_PERMANENT_FLAGS: [&str; 5] =
    ["\\Answered", "\\Flagged", "\\Deleted", "\\Seen", "\\Draft"];

/// A registered user. `username` and `profileid` are immutable after
/// creation; `mailboxes` maps mailbox names to `MailBoxRecord` ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub nickname: String,
    pub password_b64hash: String,
    pub profileid: String,
    pub mailboxes: HashMap<String, String>,
    #[serde(default)]
    pub email_address: Option<String>,
}

impl UserRecord {
    pub fn new(
        username: impl Into<String>,
        password_b64hash: impl Into<String>,
        profileid: impl Into<String>,
    ) -> Self {
        let username = username.into();
        Self {
            nickname: username.clone(),
            username,
            password_b64hash: password_b64hash.into(),
            profileid: profileid.into(),
            mailboxes: HashMap::new(),
            email_address: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhysicalSex {
    Male,
    Female,
}

/// Profile data, 1:1 with a `UserRecord`. `identity` is an immutable
/// UUID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub identity: String,
    #[serde(default)]
    pub member_no: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub physical_sex: Option<PhysicalSex>,
}

impl ProfileRecord {
    pub fn new() -> Self {
        Self {
            identity: Uuid::new_v4().to_string(),
            member_no: None,
            name: None,
            age: None,
            physical_sex: None,
        }
    }
}

impl Default for ProfileRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// A mailbox. Messages are not stored here; `MailRecord` rows reference
/// this record's `identity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailBoxRecord {
    pub identity: String,
    pub readonly: bool,
    pub permanent_flags: BTreeSet<String>,
    pub session_flags: BTreeSet<String>,
}

impl MailBoxRecord {
    pub fn new() -> Self {
        Self {
            identity: Uuid::new_v4().to_string(),
            readonly: false,
            permanent_flags: DEFAULT_PERMANENT_FLAGS.iter().map(|s| s.to_string()).collect(),
            session_flags: BTreeSet::new(),
        }
    }
}

impl Default for MailBoxRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// One placement of a message into a mailbox. Many mailboxes may
/// reference the same stored message; the mail store's reference count
/// tracks the total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailRecord {
    pub mailbox_id: String,
    pub message_id: String,
}
