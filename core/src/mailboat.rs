/*
 * mailboat.rs
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

//! The entry object: wires the storage hub, transfer agent, auth
//! provider, IMAP backend and HTTP gateway together and owns their
//! lifecycles.

use std::io;
use std::sync::{Arc, Mutex};

use tracing::{error, info};

use crate::apigate::HttpApiGateway;
use crate::config::{ConfigError, MailboatConfig};
use crate::imap::{ImapServer, ImapServerHandle, Login};
use crate::mime::{generate_message_id, parse_address_list, MailMessage};
use crate::mta::protocols::{HandlerError, QueueError, SmtpAuthHandler};
use crate::mta::smtpd::{AuthResult, SmtpdError};
use crate::mta::{DurableEmailQueue, EmailQueue, TransferAgent, TransferAgentConfig};
use crate::net;
use crate::storage::engine::open_database;
use crate::storage::{query, StorageError};
use crate::storagehub::StorageHub;
use crate::usrsys::auth::{AuthProvider, AuthRequest};
use crate::usrsys::storage::UserStorageError;
use crate::usrsys::usr::UserRecord;

#[derive(Debug)]
pub enum MailboatError {
    Config(ConfigError),
    Storage(StorageError),
    Queue(QueueError),
    User(UserStorageError),
    Smtpd(SmtpdError),
    Io(io::Error),
}

impl std::fmt::Display for MailboatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailboatError::Config(e) => write!(f, "configuration: {}", e),
            MailboatError::Storage(e) => write!(f, "{}", e),
            MailboatError::Queue(e) => write!(f, "queue: {}", e),
            MailboatError::User(e) => write!(f, "user system: {}", e),
            MailboatError::Smtpd(e) => write!(f, "smtp server: {}", e),
            MailboatError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for MailboatError {}

impl From<ConfigError> for MailboatError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<StorageError> for MailboatError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<QueueError> for MailboatError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}

impl From<UserStorageError> for MailboatError {
    fn from(e: UserStorageError) -> Self {
        Self::User(e)
    }
}

impl From<SmtpdError> for MailboatError {
    fn from(e: SmtpdError) -> Self {
        Self::Smtpd(e)
    }
}

impl From<io::Error> for MailboatError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

pub struct Mailboat {
    config: MailboatConfig,
    storage_hub: Arc<StorageHub>,
    auth_provider: Arc<AuthProvider>,
    transfer_agent: Arc<TransferAgent>,
    imap_login: Arc<Login>,
    imap_server: ImapServer,
    imap_handle: Mutex<Option<ImapServerHandle>>,
    http_api_gate: HttpApiGateway,
}

impl Mailboat {
    /// Wire a mailboat instance. Nothing listens until `start`.
    pub async fn new(config: MailboatConfig) -> Result<Self, MailboatError> {
        config.validate()?;
        net::install_crypto_provider();

        let database = Arc::new(open_database(&config.database_path)?);
        let storage_hub = Arc::new(StorageHub::new(database)?);
        let auth_provider = Arc::new(AuthProvider::new(
            storage_hub.user_records(),
            storage_hub.token_records(),
        ));

        let self_name = format!("transfer_agent.{}", config.hostname);
        let queue_storage = storage_hub.common_storage(&format!("{}.queue", self_name))?;
        let queue: Arc<dyn EmailQueue> = Arc::new(DurableEmailQueue::open(queue_storage).await?);

        let transfer_agent = Arc::new(TransferAgent::new(
            TransferAgentConfig {
                mydomains: config.mydomains.clone(),
                hostname: config.hostname.clone(),
                self_name,
                smtpd_port: config.smtpd_port,
                auth_require_tls: config.auth_require_tls,
                tls: config.tls.clone().map(net::tls_acceptor),
                ..TransferAgentConfig::default()
            },
            queue,
            local_delivery_handler(Arc::clone(&storage_hub)),
            smtpd_auth_handler(Arc::clone(&auth_provider)),
        ));

        let imap_login = Arc::new(Login::new(Arc::clone(&auth_provider), Arc::clone(&storage_hub)));
        let imap_server = ImapServer::new(Arc::clone(&imap_login));
        let http_api_gate = HttpApiGateway::new(config.http_api_gate_binds.clone());

        Ok(Self {
            config,
            storage_hub,
            auth_provider,
            transfer_agent,
            imap_login,
            imap_server,
            imap_handle: Mutex::new(None),
            http_api_gate,
        })
    }

    /// Start the SMTP and IMAP listeners and the HTTP gateway.
    pub async fn start(&self) -> Result<(), MailboatError> {
        self.transfer_agent.start().await?;
        let imap_handle = self
            .imap_server
            .start(&self.config.hostname, self.config.imapd_port)
            .await?;
        *self.imap_handle.lock().unwrap() = Some(imap_handle);
        self.http_api_gate.start().await?;
        info!(
            hostname = %self.config.hostname,
            smtpd_port = self.smtpd_port(),
            imapd_port = self.imapd_port(),
            "mailboat started"
        );
        Ok(())
    }

    pub async fn stop(&self) {
        self.transfer_agent.destroy();
        if let Some(handle) = self.imap_handle.lock().unwrap().take() {
            handle.stop();
        }
        self.http_api_gate.stop().await;
    }

    pub fn smtpd_port(&self) -> Option<u16> {
        self.transfer_agent.smtpd_port()
    }

    pub fn imapd_port(&self) -> Option<u16> {
        self.imap_handle.lock().unwrap().as_ref().map(|h| h.port())
    }

    pub fn auth_require_tls(&self) -> bool {
        self.transfer_agent.auth_require_tls()
    }

    pub fn storage_hub(&self) -> &Arc<StorageHub> {
        &self.storage_hub
    }

    pub fn auth_provider(&self) -> &Arc<AuthProvider> {
        &self.auth_provider
    }

    pub fn transfer_agent(&self) -> &Arc<TransferAgent> {
        &self.transfer_agent
    }

    pub fn imap_login(&self) -> &Arc<Login> {
        &self.imap_login
    }

    pub fn http_api_gate(&self) -> &HttpApiGateway {
        &self.http_api_gate
    }

    /// Register a user with the default mailbox set.
    pub async fn new_user(
        &self,
        username: &str,
        nickname: &str,
        email_address: &str,
        password: &str,
    ) -> Result<UserRecord, MailboatError> {
        let mut user = self
            .storage_hub
            .create_user(username, password.as_bytes())
            .await?;
        user.nickname = nickname.to_string();
        user.email_address = Some(email_address.to_string());
        self.storage_hub
            .user_records()
            .update_one(query([("profileid", user.profileid.as_str())]), &user)
            .await
            .map_err(UserStorageError::from)?;
        Ok(user)
    }

    /// Submit a message from inside this process (no SMTP session). A
    /// missing Message-Id is filled in with this host's name.
    pub async fn send_mail(&self, mut message: MailMessage) -> Result<(), MailboatError> {
        if !message.has_header("Message-Id") {
            message.set_header("Message-Id", &generate_message_id(&self.config.hostname));
        }
        self.transfer_agent.handle_message(&message, true).await?;
        Ok(())
    }
}

/// Local delivery: parse Delivered-To, find the user, append to their
/// Inbox.
fn local_delivery_handler(storage_hub: Arc<StorageHub>) -> crate::mta::LocalDeliveryHandler {
    Arc::new(move |message| {
        let storage_hub = Arc::clone(&storage_hub);
        Box::pin(async move { handle_local_delivering(storage_hub, message).await })
    })
}

async fn handle_local_delivering(
    storage_hub: Arc<StorageHub>,
    message: MailMessage,
) -> Result<(), HandlerError> {
    let delivered_to = message
        .header("Delivered-To")
        .ok_or("message has no Delivered-To header")?;
    let Some(recipient) = parse_address_list(delivered_to).into_iter().next() else {
        return Err(format!("Delivered-To does not parse: {}", delivered_to).into());
    };
    let address = recipient.address();
    let users = storage_hub.user_records();
    let user = match users
        .find_one(query([("email_address", address.as_str())]))
        .await?
    {
        Some(user) => user,
        None => users
            .find_user_by_username(recipient.local_part())
            .await?
            .ok_or_else(|| format!("no local user for {}", address))?,
    };
    let inbox_id = user
        .mailboxes
        .get("Inbox")
        .ok_or_else(|| format!("user {} has no Inbox", user.username))?;
    let mailbox = storage_hub
        .get_mailbox(inbox_id)
        .await?
        .ok_or_else(|| format!("mailbox record {} is missing", inbox_id))?;
    mailbox.append_mail(&message).await?;
    info!(recipient = %address, "delivered locally");
    Ok(())
}

/// Bridge SMTP AUTH to the auth provider: UTF-8 decode, then a password
/// check. Undecodable bytes are a handled failure.
fn smtpd_auth_handler(auth_provider: Arc<AuthProvider>) -> SmtpAuthHandler {
    Arc::new(move |method, credentials| {
        let auth_provider = Arc::clone(&auth_provider);
        Box::pin(async move {
            if method != "login" && method != "plain" {
                return AuthResult { success: false, handled: false };
            }
            let (Ok(username), Ok(password)) = (
                String::from_utf8(credentials.login),
                String::from_utf8(credentials.password),
            ) else {
                return AuthResult { success: false, handled: true };
            };
            match auth_provider
                .auth(AuthRequest::with_password(username, password))
                .await
            {
                Ok(answer) => AuthResult { success: answer.success, handled: answer.handled },
                Err(e) => {
                    error!(error = %e, "auth provider failed");
                    AuthResult { success: false, handled: true }
                }
            }
        })
    })
}
