/*
 * server.rs
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

//! The embedded IMAP4rev1 front-end: a per-connection command loop over
//! the backend binding. It speaks the subset a mail-user-agent session
//! needs (LOGIN, CAPABILITY, LIST, SELECT, SEARCH FROM, FETCH with
//! counted literals, STORE, LOGOUT).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::mailbox::FlagsMode;
use super::{ImapAuthError, ImapCredentials, Login, Session};

pub struct ImapServer {
    login: Arc<Login>,
}

pub struct ImapServerHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ImapServerHandle {
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn stop(&self) {
        self.task.abort();
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

/// Split IMAP command arguments into atoms, unquoting quoted strings
/// and capturing parenthesised groups as single tokens.
fn tokenize(input: &str) -> Vec<String> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' => i += 1,
            b'"' => {
                i += 1;
                let start = i;
                while i < bytes.len() && bytes[i] != b'"' {
                    i += 1;
                }
                tokens.push(input[start..i].to_string());
                i += 1;
            }
            b'(' => {
                i += 1;
                let start = i;
                let mut depth = 1;
                while i < bytes.len() && depth > 0 {
                    match bytes[i] {
                        b'(' => depth += 1,
                        b')' => depth -= 1,
                        _ => {}
                    }
                    if depth > 0 {
                        i += 1;
                    }
                }
                tokens.push(input[start..i].to_string());
                i += 1;
            }
            _ => {
                let start = i;
                while i < bytes.len() && !matches!(bytes[i], b' ' | b'\t') {
                    i += 1;
                }
                tokens.push(input[start..i].to_string());
            }
        }
    }
    tokens
}

impl ImapServer {
    pub fn new(login: Arc<Login>) -> Self {
        Self { login }
    }

    fn capability_line(&self) -> String {
        let capability = self.login.backend_capability();
        let mut line = String::from("CAPABILITY IMAP4rev1");
        if capability.idle {
            line.push_str(" IDLE");
        }
        if capability.object_id {
            line.push_str(" OBJECTID");
        }
        if capability.multi_append {
            line.push_str(" MULTIAPPEND");
        }
        line
    }

    /// Bind and start accepting IMAP connections.
    pub async fn start(&self, bind_host: &str, port: u16) -> Result<ImapServerHandle, io::Error> {
        let listener = TcpListener::bind((bind_host, port)).await?;
        let local_addr = listener.local_addr()?;
        let login = Arc::clone(&self.login);
        let capability = self.capability_line();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let login = Arc::clone(&login);
                        let capability = capability.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, login, capability).await {
                                debug!(peer = %peer, error = %e, "imap session ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "imap accept failed");
                    }
                }
            }
        });
        Ok(ImapServerHandle { local_addr, task })
    }
}

async fn serve_connection(
    stream: TcpStream,
    login: Arc<Login>,
    capability: String,
) -> io::Result<()> {
    let mut reader = BufReader::new(stream);
    write_line(&mut reader, &format!("* OK [{}] Mailboat ready", capability)).await?;

    let mut session: Option<Session> = None;
    let mut selected: Option<String> = None;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let line = line.trim_end_matches(['\r', '\n']);
        let Some((tag, rest)) = line.split_once(' ') else {
            write_line(&mut reader, "* BAD Missing tag").await?;
            continue;
        };
        let (verb, args) = match rest.split_once(' ') {
            Some((v, a)) => (v.to_ascii_uppercase(), a),
            None => (rest.to_ascii_uppercase(), ""),
        };
        // our uids and sequence numbers coincide, so UID commands share
        // the plain handlers
        let (verb, args) = if verb == "UID" {
            match args.split_once(' ') {
                Some((v, a)) => (v.to_ascii_uppercase(), a),
                None => (args.to_ascii_uppercase(), ""),
            }
        } else {
            (verb, args)
        };
        let tokens = tokenize(args);

        match verb.as_str() {
            "CAPABILITY" => {
                write_line(&mut reader, &format!("* {}", capability)).await?;
                write_line(&mut reader, &format!("{} OK CAPABILITY completed", tag)).await?;
            }
            "NOOP" => {
                write_line(&mut reader, &format!("{} OK NOOP completed", tag)).await?;
            }
            "LOGOUT" => {
                write_line(&mut reader, "* BYE Mailboat logging out").await?;
                write_line(&mut reader, &format!("{} OK LOGOUT completed", tag)).await?;
                return Ok(());
            }
            "LOGIN" => {
                let (Some(username), Some(password)) = (tokens.first(), tokens.get(1)) else {
                    write_line(&mut reader, &format!("{} BAD LOGIN needs a name and a password", tag))
                        .await?;
                    continue;
                };
                match login
                    .authenticate(ImapCredentials::password(username.clone(), password.clone()))
                    .await
                {
                    Ok(identity) => match identity.new_session().await {
                        Ok(new_session) => {
                            session = Some(new_session);
                            selected = None;
                            write_line(&mut reader, &format!("{} OK LOGIN completed", tag)).await?;
                        }
                        Err(e) => {
                            error!(error = %e, "session setup failed");
                            write_line(&mut reader, &format!("{} NO server failure", tag)).await?;
                        }
                    },
                    Err(ImapAuthError::AuthorizationFailure) => {
                        write_line(&mut reader, &format!("{} NO authorization failure", tag)).await?;
                    }
                    Err(ImapAuthError::InvalidAuth) => {
                        write_line(
                            &mut reader,
                            &format!("{} NO [AUTHENTICATIONFAILED] Invalid credentials", tag),
                        )
                        .await?;
                    }
                    Err(e) => {
                        error!(error = %e, "authentication failed");
                        write_line(&mut reader, &format!("{} NO server failure", tag)).await?;
                    }
                }
            }
            "LIST" => {
                let Some(active) = session.as_ref() else {
                    write_line(&mut reader, &format!("{} NO Not authenticated", tag)).await?;
                    continue;
                };
                for name in active.mailbox_set().mailbox_names() {
                    write_line(
                        &mut reader,
                        &format!("* LIST (\\HasNoChildren) \"/\" \"{}\"", name),
                    )
                    .await?;
                }
                write_line(&mut reader, &format!("{} OK LIST completed", tag)).await?;
            }
            "SELECT" | "EXAMINE" => {
                let Some(active) = session.as_ref() else {
                    write_line(&mut reader, &format!("{} NO Not authenticated", tag)).await?;
                    continue;
                };
                let Some(name) = tokens.first() else {
                    write_line(&mut reader, &format!("{} BAD SELECT needs a mailbox", tag)).await?;
                    continue;
                };
                match active.mailbox_set().select(name).await {
                    Ok(summary) => {
                        write_line(
                            &mut reader,
                            &format!("* FLAGS ({})", summary.flags.join(" ")),
                        )
                        .await?;
                        write_line(&mut reader, &format!("* {} EXISTS", summary.exists)).await?;
                        write_line(&mut reader, &format!("* {} RECENT", summary.recent)).await?;
                        write_line(
                            &mut reader,
                            &format!("* OK [UIDVALIDITY {}]", summary.uidvalidity),
                        )
                        .await?;
                        write_line(&mut reader, &format!("* OK [UIDNEXT {}]", summary.uidnext))
                            .await?;
                        if let Some(unseen) = summary.unseen {
                            write_line(&mut reader, &format!("* OK [UNSEEN {}]", unseen)).await?;
                        }
                        let mode = if summary.readonly || verb == "EXAMINE" {
                            "READ-ONLY"
                        } else {
                            "READ-WRITE"
                        };
                        selected = Some(name.clone());
                        write_line(
                            &mut reader,
                            &format!("{} OK [{}] {} completed", tag, mode, verb),
                        )
                        .await?;
                    }
                    Err(e) => {
                        debug!(mailbox = %name, error = %e, "select failed");
                        write_line(&mut reader, &format!("{} NO No such mailbox", tag)).await?;
                    }
                }
            }
            "SEARCH" => {
                let (Some(active), Some(mailbox)) = (session.as_ref(), selected.as_ref()) else {
                    write_line(&mut reader, &format!("{} NO No mailbox selected", tag)).await?;
                    continue;
                };
                let hits = match tokens.first().map(|t| t.to_ascii_uppercase()).as_deref() {
                    Some("FROM") => {
                        let Some(needle) = tokens.get(1) else {
                            write_line(&mut reader, &format!("{} BAD SEARCH FROM needs a value", tag))
                                .await?;
                            continue;
                        };
                        match active.mailbox_set().search_from(mailbox, needle).await {
                            Ok(hits) => hits,
                            Err(e) => {
                                error!(error = %e, "search failed");
                                write_line(&mut reader, &format!("{} NO server failure", tag)).await?;
                                continue;
                            }
                        }
                    }
                    Some("ALL") | None => {
                        match active.mailbox_set().select(mailbox).await {
                            Ok(summary) => (1..=summary.exists).collect(),
                            Err(e) => {
                                error!(error = %e, "search failed");
                                write_line(&mut reader, &format!("{} NO server failure", tag)).await?;
                                continue;
                            }
                        }
                    }
                    Some(other) => {
                        write_line(
                            &mut reader,
                            &format!("{} BAD SEARCH key {} not supported", tag, other),
                        )
                        .await?;
                        continue;
                    }
                };
                let mut response = String::from("* SEARCH");
                for hit in &hits {
                    response.push_str(&format!(" {}", hit));
                }
                write_line(&mut reader, &response).await?;
                write_line(&mut reader, &format!("{} OK SEARCH completed", tag)).await?;
            }
            "FETCH" => {
                let (Some(active), Some(mailbox)) = (session.as_ref(), selected.as_ref()) else {
                    write_line(&mut reader, &format!("{} NO No mailbox selected", tag)).await?;
                    continue;
                };
                let Some(seq) = tokens.first().and_then(|t| t.parse::<u32>().ok()) else {
                    write_line(&mut reader, &format!("{} BAD FETCH needs a message number", tag))
                        .await?;
                    continue;
                };
                match active.mailbox_set().fetch_raw(mailbox, seq).await {
                    Ok(Some(raw)) => {
                        let header =
                            format!("* {} FETCH (BODY[] {{{}}}\r\n", seq, raw.len());
                        reader.get_mut().write_all(header.as_bytes()).await?;
                        reader.get_mut().write_all(raw.as_bytes()).await?;
                        reader.get_mut().write_all(b")\r\n").await?;
                        reader.get_mut().flush().await?;
                        write_line(&mut reader, &format!("{} OK FETCH completed", tag)).await?;
                    }
                    Ok(None) => {
                        write_line(&mut reader, &format!("{} NO No such message", tag)).await?;
                    }
                    Err(e) => {
                        error!(error = %e, "fetch failed");
                        write_line(&mut reader, &format!("{} NO server failure", tag)).await?;
                    }
                }
            }
            "STORE" => {
                let (Some(active), Some(mailbox)) = (session.as_ref(), selected.as_ref()) else {
                    write_line(&mut reader, &format!("{} NO No mailbox selected", tag)).await?;
                    continue;
                };
                let (Some(seq), Some(item)) = (
                    tokens.first().and_then(|t| t.parse::<u32>().ok()),
                    tokens.get(1),
                ) else {
                    write_line(&mut reader, &format!("{} BAD STORE needs a number and an item", tag))
                        .await?;
                    continue;
                };
                let item = item.to_ascii_uppercase();
                let silent = item.ends_with(".SILENT");
                let mode = match item.trim_end_matches(".SILENT") {
                    "+FLAGS" => FlagsMode::Add,
                    "-FLAGS" => FlagsMode::Remove,
                    "FLAGS" => FlagsMode::Replace,
                    _ => {
                        write_line(&mut reader, &format!("{} BAD Unknown STORE item", tag)).await?;
                        continue;
                    }
                };
                let flags: Vec<String> = tokens
                    .get(2)
                    .map(|group| group.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default();
                match active.mailbox_set().store_flags(mailbox, seq, mode, &flags).await {
                    Ok(Some(after)) => {
                        if !silent {
                            write_line(
                                &mut reader,
                                &format!("* {} FETCH (FLAGS ({}))", seq, after.join(" ")),
                            )
                            .await?;
                        }
                        write_line(&mut reader, &format!("{} OK STORE completed", tag)).await?;
                    }
                    Ok(None) => {
                        write_line(&mut reader, &format!("{} NO No such message", tag)).await?;
                    }
                    Err(e) => {
                        error!(error = %e, "store failed");
                        write_line(&mut reader, &format!("{} NO server failure", tag)).await?;
                    }
                }
            }
            _ => {
                write_line(&mut reader, &format!("{} BAD Unknown command", tag)).await?;
            }
        }
    }
}
