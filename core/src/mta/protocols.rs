/*
 * protocols.rs
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

//! The contracts between the transfer agent and its collaborators: the
//! email queue, the local delivery handler and the SMTP auth handler.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::mime::MailMessage;
use crate::storage::StorageError;

use super::smtpd::{AuthResult, LoginPassword};

#[derive(Debug)]
pub enum QueueError {
    Storage(StorageError),
    /// The queued document lost its message payload.
    Corrupt(String),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Storage(e) => write!(f, "{}", e),
            QueueError::Corrupt(m) => write!(f, "corrupt queue entry: {}", m),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<StorageError> for QueueError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

/// A FIFO queue of pending messages with stable ids.
///
/// `get` blocks cooperatively until an entry is available. An entry is
/// handed off only when the consumer calls `remove(id)` after its
/// delivery attempt completes; entries still present at startup are
/// replayed.
#[async_trait]
pub trait EmailQueue: Send + Sync {
    async fn get(&self) -> Result<(MailMessage, u64), QueueError>;

    /// Idempotent: removing an id twice leaves the queue as after the
    /// first call.
    async fn remove(&self, id: u64) -> Result<(), QueueError>;

    /// Returns once the message is durably enqueued.
    async fn put(&self, message: MailMessage) -> Result<(), QueueError>;
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Delivers a message to a local mailbox.
pub type LocalDeliveryHandler = Arc<
    dyn Fn(MailMessage) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>
        + Send
        + Sync,
>;

/// Answers SMTP AUTH attempts. The first parameter is the mechanism
/// ("login" or "plain"); the credentials are raw bytes as decoded from
/// the wire.
pub type SmtpAuthHandler = Arc<
    dyn Fn(&'static str, LoginPassword) -> Pin<Box<dyn Future<Output = AuthResult> + Send>>
        + Send
        + Sync,
>;

/// An auth handler that rejects every attempt. Useful in tests and as a
/// safe default.
pub fn smtpd_auth_rejectall() -> SmtpAuthHandler {
    Arc::new(|_method, _credentials| {
        Box::pin(async { AuthResult { success: false, handled: true } })
    })
}
