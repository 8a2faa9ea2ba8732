/*
 * smtpd.rs
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

//! The RFC 5321 server front-end: per-connection session tasks
//! accepting EHLO/HELO, STARTTLS, AUTH LOGIN/PLAIN, MAIL FROM, RCPT TO,
//! DATA, RSET, NOOP and QUIT. Received messages are annotated with
//! X-Peer / X-MailFrom / X-RcptTo trace headers and handed to the
//! transfer agent.
//!
//! Protocol and auth errors are answered with 5xx codes and the session
//! continues; only I/O failures end a connection early.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::mime::MailMessage;

use super::protocols::SmtpAuthHandler;

/// Outcome of one AUTH exchange, as reported by the auth handler.
/// `handled=false` means the handler did not recognise the attempt
/// (e.g. the client aborted the challenge).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthResult {
    pub success: bool,
    pub handled: bool,
}

/// Credentials as decoded from the wire; byte strings until the auth
/// callback decides on an encoding.
#[derive(Clone)]
pub struct LoginPassword {
    pub login: Vec<u8>,
    pub password: Vec<u8>,
}

impl std::fmt::Debug for LoginPassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never expose the password, even in debug output
        f.debug_struct("LoginPassword")
            .field("login", &String::from_utf8_lossy(&self.login))
            .finish_non_exhaustive()
    }
}

/// Receives every fully parsed message the server accepts.
pub type SmtpdMessageHandler =
    Arc<dyn Fn(MailMessage) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug)]
pub struct SmtpdError {
    pub message: String,
}

impl SmtpdError {
    fn new(msg: impl Into<String>) -> Self {
        Self { message: msg.into() }
    }
}

impl std::fmt::Display for SmtpdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SmtpdError {}

impl From<io::Error> for SmtpdError {
    fn from(e: io::Error) -> Self {
        Self::new(e.to_string())
    }
}

/// The SMTP server. One accept loop; one task per connection.
pub struct Smtpd {
    hostname: String,
    auth_require_tls: bool,
    tls: Option<TlsAcceptor>,
    auth_handler: SmtpAuthHandler,
    message_handler: SmtpdMessageHandler,
}

/// Handle to a started listener; dropping it does not stop the server,
/// `stop` does.
pub struct SmtpdHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl SmtpdHandle {
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections. In-flight sessions are not drained.
    pub fn stop(&self) {
        self.task.abort();
    }
}

enum SessionEnd<S> {
    Closed,
    StartTls(BufReader<S>),
}

async fn write_line<S>(reader: &mut BufReader<S>, line: &str) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    reader.get_mut().write_all(line.as_bytes()).await?;
    reader.get_mut().write_all(b"\r\n").await?;
    reader.get_mut().flush().await
}

impl Smtpd {
    pub fn new(
        hostname: impl Into<String>,
        auth_require_tls: bool,
        tls: Option<TlsAcceptor>,
        auth_handler: SmtpAuthHandler,
        message_handler: SmtpdMessageHandler,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            auth_require_tls,
            tls,
            auth_handler,
            message_handler,
        }
    }

    /// Bind `bind_host:port` (port 0 picks a free one) and start the
    /// accept loop.
    pub async fn start(self: &Arc<Self>, bind_host: &str, port: u16) -> Result<SmtpdHandle, SmtpdError> {
        let listener = TcpListener::bind((bind_host, port)).await?;
        let local_addr = listener.local_addr()?;
        let smtpd = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let smtpd = Arc::clone(&smtpd);
                        tokio::spawn(async move {
                            if let Err(e) = smtpd.serve_connection(stream, peer).await {
                                debug!(peer = %peer, error = %e, "smtp session ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "smtp accept failed");
                    }
                }
            }
        });
        Ok(SmtpdHandle { local_addr, task })
    }

    async fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let reader = BufReader::new(stream);
        match self.run_session(reader, peer.ip(), false).await? {
            SessionEnd::Closed => Ok(()),
            SessionEnd::StartTls(reader) => {
                let acceptor = match self.tls.clone() {
                    Some(a) => a,
                    None => return Ok(()),
                };
                let tls_stream = acceptor
                    .accept(reader.into_inner())
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                match self.run_session(BufReader::new(tls_stream), peer.ip(), true).await? {
                    SessionEnd::Closed => Ok(()),
                    // a second STARTTLS is answered inside the session
                    SessionEnd::StartTls(_) => Ok(()),
                }
            }
        }
    }

    fn auth_allowed(&self, tls_active: bool) -> bool {
        tls_active || !self.auth_require_tls
    }

    async fn run_session<S>(
        &self,
        mut reader: BufReader<S>,
        peer: IpAddr,
        tls_active: bool,
    ) -> io::Result<SessionEnd<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        write_line(&mut reader, &format!("220 {} ESMTP Mailboat", self.hostname)).await?;

        let mut mail_from: Option<String> = None;
        let mut rcpt_to: Vec<String> = Vec::new();
        let mut authenticated = false;

        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(SessionEnd::Closed);
            }
            let line = line.trim_end_matches(['\r', '\n']);
            let (verb, args) = match line.split_once(' ') {
                Some((v, a)) => (v.to_ascii_uppercase(), a.trim()),
                None => (line.to_ascii_uppercase(), ""),
            };

            match verb.as_str() {
                "EHLO" => {
                    mail_from = None;
                    rcpt_to.clear();
                    let mut extensions = vec!["8BITMIME".to_string()];
                    if self.tls.is_some() && !tls_active {
                        extensions.push("STARTTLS".to_string());
                    }
                    if self.auth_allowed(tls_active) {
                        extensions.push("AUTH LOGIN PLAIN".to_string());
                    }
                    write_line(&mut reader, &format!("250-{}", self.hostname)).await?;
                    let last = extensions.len() - 1;
                    for (i, ext) in extensions.iter().enumerate() {
                        let sep = if i == last { ' ' } else { '-' };
                        write_line(&mut reader, &format!("250{}{}", sep, ext)).await?;
                    }
                }
                "HELO" => {
                    mail_from = None;
                    rcpt_to.clear();
                    write_line(&mut reader, &format!("250 {}", self.hostname)).await?;
                }
                "STARTTLS" => {
                    if tls_active {
                        write_line(&mut reader, "503 5.5.1 TLS already active").await?;
                    } else if self.tls.is_none() {
                        write_line(&mut reader, "454 4.7.0 TLS not available").await?;
                    } else {
                        write_line(&mut reader, "220 2.0.0 Ready to start TLS").await?;
                        return Ok(SessionEnd::StartTls(reader));
                    }
                }
                "AUTH" => {
                    if !self.auth_allowed(tls_active) {
                        write_line(
                            &mut reader,
                            "538 5.7.11 Encryption required for requested authentication mechanism",
                        )
                        .await?;
                        continue;
                    }
                    if authenticated {
                        write_line(&mut reader, "503 5.5.1 Already authenticated").await?;
                        continue;
                    }
                    let (mechanism, initial) = match args.split_once(' ') {
                        Some((m, rest)) => (m.to_ascii_uppercase(), Some(rest.trim())),
                        None => (args.to_ascii_uppercase(), None),
                    };
                    let result = match mechanism.as_str() {
                        "LOGIN" => self.auth_login(&mut reader, initial).await?,
                        "PLAIN" => self.auth_plain(&mut reader, initial).await?,
                        _ => {
                            write_line(&mut reader, "504 5.5.4 Unrecognized authentication type")
                                .await?;
                            continue;
                        }
                    };
                    match result {
                        Some(result) if result.handled && result.success => {
                            authenticated = true;
                            write_line(&mut reader, "235 2.7.0 Authentication successful").await?;
                        }
                        Some(_) => {
                            write_line(&mut reader, "535 5.7.8 Authentication credentials invalid")
                                .await?;
                        }
                        // challenge aborted or undecodable; already answered
                        None => {}
                    }
                }
                "MAIL" => {
                    if mail_from.is_some() {
                        write_line(&mut reader, "503 5.5.1 Error: nested MAIL command").await?;
                        continue;
                    }
                    match parse_path(args, "FROM") {
                        Some(path) => {
                            mail_from = Some(path);
                            write_line(&mut reader, "250 2.1.0 OK").await?;
                        }
                        None => write_line(&mut reader, "501 5.5.2 Syntax: MAIL FROM:<address>").await?,
                    }
                }
                "RCPT" => {
                    if mail_from.is_none() {
                        write_line(&mut reader, "503 5.5.1 Error: need MAIL command").await?;
                        continue;
                    }
                    match parse_path(args, "TO") {
                        Some(path) if !path.is_empty() => {
                            rcpt_to.push(path);
                            write_line(&mut reader, "250 2.1.5 OK").await?;
                        }
                        _ => write_line(&mut reader, "501 5.5.2 Syntax: RCPT TO:<address>").await?,
                    }
                }
                "DATA" => {
                    if rcpt_to.is_empty() {
                        write_line(&mut reader, "503 5.5.1 Error: need RCPT command").await?;
                        continue;
                    }
                    write_line(&mut reader, "354 End data with <CR><LF>.<CR><LF>").await?;
                    let raw = read_data(&mut reader).await?;
                    let mut message = MailMessage::parse(&raw);
                    // client-supplied trace headers must not survive
                    message.remove_header("X-Peer");
                    message.remove_header("X-MailFrom");
                    message.remove_header("X-RcptTo");
                    message.prepend_header("X-RcptTo", &rcpt_to.join(", "));
                    message.prepend_header("X-MailFrom", mail_from.as_deref().unwrap_or(""));
                    message.prepend_header("X-Peer", &peer.to_string());
                    (self.message_handler)(message).await;
                    mail_from = None;
                    rcpt_to.clear();
                    write_line(&mut reader, "250 2.0.0 OK").await?;
                }
                "RSET" => {
                    mail_from = None;
                    rcpt_to.clear();
                    write_line(&mut reader, "250 2.0.0 OK").await?;
                }
                "NOOP" => {
                    write_line(&mut reader, "250 2.0.0 OK").await?;
                }
                "QUIT" => {
                    write_line(&mut reader, &format!("221 {} Bye", self.hostname)).await?;
                    return Ok(SessionEnd::Closed);
                }
                _ => {
                    write_line(&mut reader, "500 5.5.2 Error: command not recognized").await?;
                }
            }
        }
    }

    /// AUTH LOGIN: challenge for the username and the password, each
    /// base64-encoded. `None` means the exchange already got its reply.
    async fn auth_login<S>(
        &self,
        reader: &mut BufReader<S>,
        initial: Option<&str>,
    ) -> io::Result<Option<AuthResult>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let login = match initial {
            Some(arg) => arg.to_string(),
            None => {
                // base64("Username:")
                write_line(reader, "334 VXNlcm5hbWU6").await?;
                match self.read_challenge_reply(reader).await? {
                    Some(reply) => reply,
                    None => return Ok(None),
                }
            }
        };
        let Ok(login) = BASE64.decode(login.trim().as_bytes()) else {
            write_line(reader, "501 5.5.2 Can't decode base64").await?;
            return Ok(None);
        };
        // base64("Password:")
        write_line(reader, "334 UGFzc3dvcmQ6").await?;
        let Some(password) = self.read_challenge_reply(reader).await? else {
            return Ok(None);
        };
        let Ok(password) = BASE64.decode(password.trim().as_bytes()) else {
            write_line(reader, "501 5.5.2 Can't decode base64").await?;
            return Ok(None);
        };
        let result = (self.auth_handler)("login", LoginPassword { login, password }).await;
        Ok(Some(result))
    }

    /// AUTH PLAIN: `[authzid] NUL authcid NUL password`, either inline
    /// or via an empty challenge.
    async fn auth_plain<S>(
        &self,
        reader: &mut BufReader<S>,
        initial: Option<&str>,
    ) -> io::Result<Option<AuthResult>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let payload = match initial {
            Some(arg) => arg.to_string(),
            None => {
                write_line(reader, "334 ").await?;
                match self.read_challenge_reply(reader).await? {
                    Some(reply) => reply,
                    None => return Ok(None),
                }
            }
        };
        let Ok(decoded) = BASE64.decode(payload.trim().as_bytes()) else {
            write_line(reader, "501 5.5.2 Can't decode base64").await?;
            return Ok(None);
        };
        let mut parts: Vec<&[u8]> = decoded.split(|b| *b == 0).collect();
        if let Some(first) = parts.first() {
            if first.is_empty() {
                parts.remove(0);
            }
        }
        if parts.len() != 2 || parts.iter().any(|p| p.is_empty()) {
            return Ok(Some(AuthResult { success: false, handled: true }));
        }
        let credentials = LoginPassword { login: parts[0].to_vec(), password: parts[1].to_vec() };
        Ok(Some((self.auth_handler)("plain", credentials).await))
    }

    /// Read one challenge reply line. `*` aborts the exchange (answered
    /// with 501, reported as an unhandled attempt).
    async fn read_challenge_reply<S>(&self, reader: &mut BufReader<S>) -> io::Result<Option<String>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line == "*" {
            write_line(reader, "501 5.7.0 Auth aborted").await?;
            return Ok(None);
        }
        Ok(Some(line.to_string()))
    }
}

/// Parse `FROM:<addr>` / `TO:<addr>` arguments; returns the bare
/// address (which may be empty for a null reverse-path).
fn parse_path(args: &str, keyword: &str) -> Option<String> {
    let rest = args
        .strip_prefix(keyword)
        .or_else(|| args.strip_prefix(&keyword.to_ascii_lowercase()))?;
    let rest = rest.trim_start().strip_prefix(':')?.trim();
    // ignore esmtp parameters after the path
    let path = rest.split_whitespace().next().unwrap_or("");
    let path = path.strip_prefix('<').unwrap_or(path);
    let path = path.strip_suffix('>').unwrap_or(path);
    Some(path.to_string())
}

/// Read the DATA payload until the lone-dot terminator, undoing dot
/// stuffing.
async fn read_data<S>(reader: &mut BufReader<S>) -> io::Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut raw = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed in DATA"));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed == "." {
            return Ok(raw);
        }
        // RFC 5321 section 4.5.2: drop the first character when it is a dot
        let content = trimmed.strip_prefix('.').unwrap_or(trimmed);
        raw.push_str(content);
        raw.push_str("\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_parsing_accepts_angle_and_bare_forms() {
        assert_eq!(parse_path("FROM:<a@b>", "FROM"), Some("a@b".to_string()));
        assert_eq!(parse_path("FROM: <a@b>", "FROM"), Some("a@b".to_string()));
        assert_eq!(parse_path("TO:c@d", "TO"), Some("c@d".to_string()));
        assert_eq!(parse_path("FROM:<>", "FROM"), Some(String::new()));
        assert_eq!(parse_path("FROM:<a@b> SIZE=100", "FROM"), Some("a@b".to_string()));
        assert_eq!(parse_path("BADKEY:<a@b>", "FROM"), None);
    }

    #[test]
    fn debug_of_credentials_hides_the_password() {
        let creds = LoginPassword { login: b"alyx".to_vec(), password: b"secret".to_vec() };
        let debug = format!("{:?}", creds);
        assert!(debug.contains("alyx"));
        assert!(!debug.contains("secret"));
    }
}
