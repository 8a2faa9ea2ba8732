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

//! The mail transfer agent: accepts parsed messages from the SMTP
//! front-end, fans them out into per-recipient envelopes on the queue,
//! and runs the delivery worker that dispatches each envelope locally
//! or over outgoing SMTP with TLS escalation.

pub mod client;
pub mod protocols;
pub mod queue;
pub mod smtpd;

pub use protocols::{smtpd_auth_rejectall, EmailQueue, LocalDeliveryHandler, SmtpAuthHandler};
pub use queue::{DurableEmailQueue, MemoryEmailQueue};

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use mail_auth::MessageAuthenticator;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::mime::{parse_address_list, EmailAddress, MailMessage};

use client::{OutgoingEnvelope, SmtpSendError, TlsMode};
use protocols::{HandlerError, QueueError};
use smtpd::{Smtpd, SmtpdError, SmtpdHandle, SmtpdMessageHandler};

/// Trace headers stripped from outgoing copies before remote delivery.
const OUTGOING_STRIP_HEADERS: [&str; 4] = ["X-Peer", "X-MailFrom", "X-RcptTo", "Delivered-To"];

const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum DeliveryError {
    /// The envelope's Delivered-To did not parse as a mailbox address.
    BadRecipient(String),
    Local(HandlerError),
    Remote(SmtpSendError),
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::BadRecipient(addr) => write!(f, "bad recipient address: {}", addr),
            DeliveryError::Local(e) => write!(f, "local delivery: {}", e),
            DeliveryError::Remote(e) => write!(f, "remote delivery: {}", e),
        }
    }
}

impl std::error::Error for DeliveryError {}

pub struct TransferAgentConfig {
    /// Domains this instance is authoritative for.
    pub mydomains: Vec<String>,
    /// Server name for the SMTP greeting and the listener bind address.
    pub hostname: String,
    /// Instance name; the durable queue collection is `<self_name>.queue`.
    pub self_name: String,
    pub smtpd_port: u16,
    pub auth_require_tls: bool,
    pub tls: Option<TlsAcceptor>,
    /// Remote deliveries are retried with exponential backoff up to this
    /// many attempts, then dropped.
    pub max_delivery_attempts: u32,
    /// Bound on concurrently running delivery tasks.
    pub max_inflight_deliveries: usize,
}

impl Default for TransferAgentConfig {
    fn default() -> Self {
        Self {
            mydomains: Vec::new(),
            hostname: "localhost".to_string(),
            self_name: "mailboat.transfer_agent".to_string(),
            smtpd_port: 8025,
            auth_require_tls: true,
            tls: None,
            max_delivery_attempts: 5,
            max_inflight_deliveries: 16,
        }
    }
}

struct AgentInner {
    mydomains: Vec<String>,
    hostname: String,
    queue: Arc<dyn EmailQueue>,
    local_delivery_handler: LocalDeliveryHandler,
    max_delivery_attempts: u32,
    inflight: Arc<Semaphore>,
    resolver: OnceLock<Option<MessageAuthenticator>>,
}

/// Owns the SMTP listener, the queue and the delivery worker. The
/// worker starts at construction; `start` only binds the listener.
pub struct TransferAgent {
    inner: Arc<AgentInner>,
    smtpd: Arc<Smtpd>,
    name: String,
    bind_host: String,
    configured_port: u16,
    auth_require_tls: bool,
    handle: Mutex<Option<SmtpdHandle>>,
    worker: JoinHandle<()>,
}

impl TransferAgent {
    pub fn new(
        config: TransferAgentConfig,
        queue: Arc<dyn EmailQueue>,
        local_delivery_handler: LocalDeliveryHandler,
        smtpd_auth_handler: SmtpAuthHandler,
    ) -> Self {
        let inner = Arc::new(AgentInner {
            mydomains: config.mydomains.iter().map(|d| d.to_lowercase()).collect(),
            hostname: config.hostname.clone(),
            queue,
            local_delivery_handler,
            max_delivery_attempts: config.max_delivery_attempts.max(1),
            inflight: Arc::new(Semaphore::new(config.max_inflight_deliveries.max(1))),
            resolver: OnceLock::new(),
        });

        let message_handler: SmtpdMessageHandler = {
            let inner = Arc::clone(&inner);
            Arc::new(move |message| {
                let inner = Arc::clone(&inner);
                Box::pin(async move {
                    if let Err(e) = inner.handle_message(message, false).await {
                        error!(error = %e, "failed to enqueue received message");
                    }
                })
            })
        };
        let smtpd = Arc::new(Smtpd::new(
            config.hostname.clone(),
            config.auth_require_tls,
            config.tls,
            smtpd_auth_handler,
            message_handler,
        ));

        let worker = tokio::spawn(AgentInner::run_deliveryman(Arc::clone(&inner)));

        Self {
            inner,
            smtpd,
            name: config.self_name,
            bind_host: config.hostname,
            configured_port: config.smtpd_port,
            auth_require_tls: config.auth_require_tls,
            handle: Mutex::new(None),
            worker,
        }
    }

    /// Instance name; the durable queue collection carries it.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the SMTP listener.
    pub async fn start(&self) -> Result<(), SmtpdError> {
        let handle = self.smtpd.start(&self.bind_host, self.configured_port).await?;
        info!(name = %self.name, port = handle.port(), "smtp listener started");
        *self.handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop the listener and cancel the delivery worker. In-flight
    /// SMTP dialogs and deliveries are not drained; durable queue
    /// entries not yet removed replay on the next start.
    pub fn destroy(&self) {
        debug!(name = %self.name, reason = "transfer agent destroy", "cancelling delivery worker");
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.stop();
        }
        self.worker.abort();
    }

    /// The bound SMTP port, once `start` has run.
    pub fn smtpd_port(&self) -> Option<u16> {
        self.handle.lock().unwrap().as_ref().map(|h| h.port())
    }

    pub fn auth_require_tls(&self) -> bool {
        self.auth_require_tls
    }

    /// Classify the recipients of `message` and enqueue one envelope
    /// per recipient this instance should deliver. Messages without a
    /// Message-Id are dropped silently.
    pub async fn handle_message(&self, message: &MailMessage, internal: bool) -> Result<(), QueueError> {
        self.inner.handle_message(message.clone(), internal).await
    }
}

impl AgentInner {
    fn is_local_domain(&self, domain: &str) -> bool {
        let domain = domain.to_lowercase();
        self.mydomains.iter().any(|d| *d == domain)
    }

    /// Loopback submitters may relay to foreign domains.
    fn peer_is_loopback(message: &MailMessage) -> bool {
        message.header("X-Peer").is_some_and(|peer| {
            peer.starts_with("127.0.0.1") || peer.starts_with("::1") || peer.starts_with("localhost")
        })
    }

    async fn handle_message(&self, message: MailMessage, internal: bool) -> Result<(), QueueError> {
        let Some(message_id) = message.header("Message-Id").map(str::to_string) else {
            debug!("dropping message without Message-Id header");
            return Ok(());
        };
        let relay_allowed = internal || Self::peer_is_loopback(&message);
        let mut deliver_to: Vec<String> = Vec::new();
        for header in ["To", "Cc", "Bcc"] {
            let Some(value) = message.header(header) else { continue };
            for addr in parse_address_list(value) {
                if self.is_local_domain(addr.hostname()) || relay_allowed {
                    deliver_to.push(addr.address());
                } else {
                    debug!(recipient = %addr.address(), "refusing relay for foreign recipient");
                }
            }
        }
        for recipient in &deliver_to {
            let mut envelope = message.clone();
            envelope.set_header("Delivered-To", recipient);
            self.queue.put(envelope).await?;
        }
        info!(message_id = %message_id, recipients = deliver_to.len(), "handled message");
        Ok(())
    }

    /// The delivery worker: dequeue forever, one envelope at a time,
    /// dispatching each into a bounded delivery task. No envelope may
    /// crash the loop.
    async fn run_deliveryman(inner: Arc<AgentInner>) {
        loop {
            let (mut message, id) = match inner.queue.get().await {
                Ok(entry) => entry,
                Err(e) => {
                    error!(error = %e, "queue get failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            let Some(delivered_to) = message.header("Delivered-To").map(str::to_string) else {
                warn!(id, "dropping queued message without Delivered-To");
                if let Err(e) = inner.queue.remove(id).await {
                    error!(error = %e, "queue remove failed");
                }
                continue;
            };
            // each recipient sees only its own Bcc entry
            if message.has_header("Bcc") {
                message.set_header("Bcc", &delivered_to);
            }
            let permit = match Arc::clone(&inner.inflight).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let _permit = permit;
                inner.deliver_envelope(message, id, delivered_to).await;
            });
        }
    }

    async fn deliver_envelope(&self, message: MailMessage, id: u64, delivered_to: String) {
        let message_id = message.header("Message-Id").unwrap_or("<unknown>").to_string();
        if let Err(e) = self.dispatch(&message, &delivered_to).await {
            error!(message_id = %message_id, error = %e, "delivery failed, dropping envelope");
        }
        if let Err(e) = self.queue.remove(id).await {
            error!(message_id = %message_id, error = %e, "queue remove failed");
        }
    }

    async fn dispatch(&self, message: &MailMessage, delivered_to: &str) -> Result<(), DeliveryError> {
        let Some(recipient) = parse_address_list(delivered_to).into_iter().next() else {
            return Err(DeliveryError::BadRecipient(delivered_to.to_string()));
        };
        if self.is_local_domain(recipient.hostname()) {
            return (self.local_delivery_handler)(message.clone())
                .await
                .map_err(DeliveryError::Local);
        }
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.remote_deliver(message, &recipient).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_terminal() => return Err(DeliveryError::Remote(e)),
                Err(e) if attempt >= self.max_delivery_attempts => {
                    return Err(DeliveryError::Remote(e))
                }
                Err(e) => {
                    let delay = RETRY_BASE_DELAY
                        .saturating_mul(1 << (attempt - 1).min(16))
                        .min(RETRY_MAX_DELAY);
                    warn!(
                        recipient = %recipient.address(),
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "remote delivery failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One full escalation pass: implicit TLS, then opportunistic
    /// STARTTLS, then plaintext; fresh connection per attempt. An auth
    /// rejection anywhere ends the escalation.
    async fn remote_deliver(
        &self,
        message: &MailMessage,
        recipient: &EmailAddress,
    ) -> Result<(), SmtpSendError> {
        let mail_from = message
            .header("X-MailFrom")
            .map(str::to_string)
            .or_else(|| {
                message
                    .header("From")
                    .and_then(|v| parse_address_list(v).into_iter().next())
                    .map(|a| a.address())
            })
            .unwrap_or_default();
        let mut outgoing = message.clone();
        for header in OUTGOING_STRIP_HEADERS {
            outgoing.remove_header(header);
        }
        let raw = outgoing.to_wire_string();
        let rcpt_to = recipient.address();
        let envelope = OutgoingEnvelope { mail_from: &mail_from, rcpt_to: &rcpt_to };

        let hosts = self.resolve_mx(recipient.hostname()).await;
        let mut last_error = None;
        for mode in [TlsMode::Implicit, TlsMode::Opportunistic, TlsMode::Plain] {
            for host in &hosts {
                match client::deliver(host, mode, &self.hostname, &envelope, &raw).await {
                    Ok(()) => {
                        info!(recipient = %rcpt_to, host = %host, ?mode, "delivered remotely");
                        return Ok(());
                    }
                    Err(e) if e.is_terminal() => return Err(e),
                    Err(e) => {
                        debug!(host = %host, ?mode, error = %e, "delivery attempt failed");
                        last_error = Some(e);
                    }
                }
            }
        }
        Err(last_error.unwrap_or(SmtpSendError::Protocol {
            code: 0,
            message: "no delivery hosts".to_string(),
        }))
    }

    /// MX hosts for `domain` in preference order; the domain itself is
    /// the RFC 5321 implicit fallback.
    async fn resolve_mx(&self, domain: &str) -> Vec<String> {
        let resolver = self.resolver.get_or_init(|| MessageAuthenticator::new_system_conf().ok());
        let Some(resolver) = resolver else {
            return vec![domain.to_string()];
        };
        match resolver
            .mx_lookup(domain, None::<&mail_auth::common::cache::NoCache<String, _>>)
            .await
        {
            Ok(mx) => {
                let mut records: Vec<_> = mx.iter().collect();
                records.sort_by_key(|r| r.preference);
                let hosts: Vec<String> = records
                    .iter()
                    .flat_map(|r| r.exchanges.iter())
                    .map(|e| e.trim_end_matches('.').to_string())
                    .filter(|e| !e.is_empty())
                    .collect();
                if hosts.is_empty() {
                    vec![domain.to_string()]
                } else {
                    hosts
                }
            }
            Err(_) => vec![domain.to_string()],
        }
    }
}
