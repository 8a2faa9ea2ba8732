/*
 * client.rs
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

//! Outgoing SMTP: one connection per attempt, greeting, EHLO, MAIL
//! FROM, RCPT TO, DATA with dot stuffing, QUIT. The caller picks the
//! TLS mode; escalation across modes lives in the transfer agent.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::net::{connect_implicit_tls, connect_plain};

/// Errors from one outgoing delivery attempt.
#[derive(Debug)]
pub enum SmtpSendError {
    Io(io::Error),
    /// The remote rejected a command (non-auth 4xx/5xx).
    Protocol { code: u16, message: String },
    /// The remote demands or rejected authentication. Terminal: the
    /// envelope must not be retried with a weaker TLS mode.
    Auth { code: u16, message: String },
    /// STARTTLS was required for this mode but the remote lacks it.
    TlsUnavailable,
}

impl std::fmt::Display for SmtpSendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SmtpSendError::Io(e) => write!(f, "{}", e),
            SmtpSendError::Protocol { code, message } => write!(f, "{} {}", code, message),
            SmtpSendError::Auth { code, message } => {
                write!(f, "authentication rejected: {} {}", code, message)
            }
            SmtpSendError::TlsUnavailable => write!(f, "remote does not offer STARTTLS"),
        }
    }
}

impl std::error::Error for SmtpSendError {}

impl From<io::Error> for SmtpSendError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl SmtpSendError {
    /// Auth failures end the whole escalation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SmtpSendError::Auth { .. })
    }
}

/// TLS escalation mode for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Implicit TLS on port 465.
    Implicit,
    /// Plain connect on port 25; upgrade when STARTTLS is offered.
    Opportunistic,
    /// Plain connect on port 25, no upgrade.
    Plain,
}

impl TlsMode {
    pub fn port(self) -> u16 {
        match self {
            TlsMode::Implicit => 465,
            TlsMode::Opportunistic | TlsMode::Plain => 25,
        }
    }
}

/// One envelope for one attempt: single recipient per queue design.
pub struct OutgoingEnvelope<'a> {
    pub mail_from: &'a str,
    pub rcpt_to: &'a str,
}

/// Parsed SMTP reply (code plus the final line's text).
struct SmtpResponse {
    code: u16,
    message: String,
}

impl SmtpResponse {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    fn into_error(self) -> SmtpSendError {
        match self.code {
            530 | 534 | 535 | 538 => SmtpSendError::Auth { code: self.code, message: self.message },
            _ => SmtpSendError::Protocol { code: self.code, message: self.message },
        }
    }
}

/// Read one (possibly multi-line) SMTP reply.
async fn read_response<S>(reader: &mut BufReader<S>) -> Result<SmtpResponse, SmtpSendError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed").into());
        }
        let line = line.trim_end().to_string();
        if line.len() < 3 {
            return Err(SmtpSendError::Protocol { code: 0, message: line });
        }
        let code: u16 = line[..3]
            .parse()
            .map_err(|_| SmtpSendError::Protocol { code: 0, message: line.clone() })?;
        let continuation = line.as_bytes().get(3) == Some(&b'-');
        lines.push(line.get(4..).unwrap_or("").to_string());
        if !continuation {
            return Ok(SmtpResponse { code, message: lines.pop().unwrap_or_default() });
        }
    }
}

async fn write_line<S>(reader: &mut BufReader<S>, line: &str) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    reader.get_mut().write_all(line.as_bytes()).await?;
    reader.get_mut().write_all(b"\r\n").await?;
    reader.get_mut().flush().await
}

async fn expect<S>(reader: &mut BufReader<S>, ok: u16) -> Result<SmtpResponse, SmtpSendError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let response = read_response(reader).await?;
    if response.code == ok {
        Ok(response)
    } else {
        Err(response.into_error())
    }
}

/// Send EHLO; returns whether STARTTLS was advertised.
async fn ehlo<S>(reader: &mut BufReader<S>, hostname: &str) -> Result<bool, SmtpSendError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    reader.get_mut().write_all(format!("EHLO {}\r\n", hostname).as_bytes()).await?;
    reader.get_mut().flush().await?;
    let mut starttls = false;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed").into());
        }
        let line = line.trim_end();
        if line.len() < 4 {
            return Err(SmtpSendError::Protocol { code: 0, message: line.to_string() });
        }
        let code: u16 = line[..3].parse().unwrap_or(0);
        if code != 250 {
            return Err(SmtpSendError::Protocol { code, message: line[4..].to_string() });
        }
        if line[4..].trim().eq_ignore_ascii_case("STARTTLS") {
            starttls = true;
        }
        if line.as_bytes()[3] != b'-' {
            return Ok(starttls);
        }
    }
}

/// Dot-stuff `message` for the DATA phase: normalise line endings to
/// CRLF, double leading dots, and close with `CRLF . CRLF`.
pub fn dot_stuff(message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 64);
    for line in message.split_inclusive('\n') {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.starts_with('.') {
            out.push(b'.');
        }
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

async fn send_transaction<S>(
    reader: &mut BufReader<S>,
    envelope: &OutgoingEnvelope<'_>,
    message: &str,
) -> Result<(), SmtpSendError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_line(reader, &format!("MAIL FROM:<{}>", envelope.mail_from)).await?;
    expect(reader, 250).await?;
    write_line(reader, &format!("RCPT TO:<{}>", envelope.rcpt_to)).await?;
    let rcpt = read_response(reader).await?;
    if !rcpt.is_success() && rcpt.code != 251 && rcpt.code != 252 {
        return Err(rcpt.into_error());
    }
    write_line(reader, "DATA").await?;
    expect(reader, 354).await?;
    reader.get_mut().write_all(&dot_stuff(message)).await?;
    reader.get_mut().flush().await?;
    expect(reader, 250).await?;
    write_line(reader, "QUIT").await?;
    let _ = read_response(reader).await;
    Ok(())
}

async fn run_session<S>(
    mut reader: BufReader<S>,
    ehlo_hostname: &str,
    envelope: &OutgoingEnvelope<'_>,
    message: &str,
) -> Result<(), SmtpSendError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    expect(&mut reader, 220).await?;
    ehlo(&mut reader, ehlo_hostname).await?;
    send_transaction(&mut reader, envelope, message).await
}

/// Deliver `message` to `host` using `mode`. Each call is a fresh
/// connection.
pub async fn deliver(
    host: &str,
    mode: TlsMode,
    ehlo_hostname: &str,
    envelope: &OutgoingEnvelope<'_>,
    message: &str,
) -> Result<(), SmtpSendError> {
    match mode {
        TlsMode::Implicit => {
            let stream = connect_implicit_tls(host, mode.port()).await?;
            run_session(BufReader::new(stream), ehlo_hostname, envelope, message).await
        }
        TlsMode::Opportunistic => {
            let stream = connect_plain(host, mode.port()).await?;
            let mut reader = BufReader::new(stream);
            expect(&mut reader, 220).await?;
            let starttls = ehlo(&mut reader, ehlo_hostname).await?;
            if !starttls {
                return Err(SmtpSendError::TlsUnavailable);
            }
            write_line(&mut reader, "STARTTLS").await?;
            expect(&mut reader, 220).await?;
            let tls = reader.into_inner().upgrade_to_tls(host).await?;
            let mut reader = BufReader::new(tls);
            ehlo(&mut reader, ehlo_hostname).await?;
            send_transaction(&mut reader, envelope, message).await
        }
        TlsMode::Plain => {
            let stream = connect_plain(host, mode.port()).await?;
            run_session(BufReader::new(stream), ehlo_hostname, envelope, message).await
        }
    }
}
