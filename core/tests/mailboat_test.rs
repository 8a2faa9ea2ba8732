/*
 * mailboat_test.rs
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

//! Full-stack scenarios: SMTP submission to IMAP readback, the TLS
//! gate on AUTH, token scopes, and the HTTP liveness endpoint.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use mailboat_core::imap::{ImapAuthError, ImapCredentials};
use mailboat_core::usrsys::tk::SCOPE_ACT_AS_USER;
use mailboat_core::{Mailboat, MailboatConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

fn test_config(auth_require_tls: bool) -> MailboatConfig {
    let mut config = MailboatConfig::new("localhost", vec!["foo.bar".to_string()], ":mem:");
    config.smtpd_port = 0;
    config.imapd_port = 0;
    config.auth_require_tls = auth_require_tls;
    config
}

async fn smtp_reply(reader: &mut BufReader<TcpStream>) -> String {
    let mut all = String::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.expect("read smtp reply");
        all.push_str(&line);
        if line.len() < 4 || line.as_bytes()[3] != b'-' {
            return all;
        }
    }
}

async fn smtp_command(reader: &mut BufReader<TcpStream>, command: &str) -> String {
    reader
        .get_mut()
        .write_all(format!("{}\r\n", command).as_bytes())
        .await
        .expect("write smtp command");
    smtp_reply(reader).await
}

async fn imap_command(reader: &mut BufReader<TcpStream>, tag: &str, command: &str) -> String {
    reader
        .get_mut()
        .write_all(format!("{} {}\r\n", tag, command).as_bytes())
        .await
        .expect("write imap command");
    let mut all = String::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.expect("read imap reply");
        all.push_str(&line);
        if line.starts_with(&format!("{} ", tag)) {
            return all;
        }
    }
}

fn imap_untagged_value(reply: &str, key: &str) -> Option<String> {
    for line in reply.lines() {
        let parts: Vec<&str> = line.trim().split(' ').collect();
        if parts.len() == 3 && parts[0] == "*" && parts[2].eq_ignore_ascii_case(key) {
            return Some(parts[1].to_string());
        }
    }
    None
}

/// Alyx signs up, mails Freeman, and Freeman reads it over IMAP.
#[tokio::test]
async fn sending_and_receiving_email() {
    let mailboat = Mailboat::new(test_config(false)).await.unwrap();
    mailboat.start().await.unwrap();
    mailboat
        .new_user("alyx", "Alyx", "alyx@foo.bar", "alyxpassword")
        .await
        .unwrap();
    mailboat
        .new_user("freeman", "Freeman", "freeman@foo.bar", "freemanpassword")
        .await
        .unwrap();

    // Alyx submits her hello mail, authenticating with AUTH PLAIN.
    let stream = TcpStream::connect(("localhost", mailboat.smtpd_port().unwrap()))
        .await
        .unwrap();
    let mut smtp = BufReader::new(stream);
    assert!(smtp_reply(&mut smtp).await.starts_with("220"));
    let ehlo = smtp_command(&mut smtp, "EHLO alyx-laptop").await;
    assert!(ehlo.contains("AUTH"), "plaintext AUTH should be offered in this test setup");
    let credentials = BASE64.encode(b"\0alyx\0alyxpassword");
    let auth = smtp_command(&mut smtp, &format!("AUTH PLAIN {}", credentials)).await;
    assert!(auth.starts_with("235"), "AUTH PLAIN reply was {}", auth);
    assert!(smtp_command(&mut smtp, "MAIL FROM:<alyx@foo.bar>").await.starts_with("250"));
    assert!(smtp_command(&mut smtp, "RCPT TO:<freeman@foo.bar>").await.starts_with("250"));
    assert!(smtp_command(&mut smtp, "DATA").await.starts_with("354"));
    let body = "I am writing to you and I am using mailboat's server now.";
    let reply = smtp_command(
        &mut smtp,
        &format!(
            "From: alyx@foo.bar\r\nTo: freeman@foo.bar\r\nSubject: Hello, Freeman! I am using mailboat.\r\nMessage-Id: <hello-1@foo.bar>\r\n\r\n{}\r\n.",
            body
        ),
    )
    .await;
    assert!(reply.starts_with("250"), "DATA end reply was {}", reply);
    smtp_command(&mut smtp, "QUIT").await;

    // Freeman signs in to his IMAP mailbox.
    let stream = TcpStream::connect(("localhost", mailboat.imapd_port().unwrap()))
        .await
        .unwrap();
    let mut imap = BufReader::new(stream);
    let mut greeting = String::new();
    imap.read_line(&mut greeting).await.unwrap();
    assert!(greeting.starts_with("* OK"));
    let login = imap_command(&mut imap, "a1", "LOGIN freeman freemanpassword").await;
    assert!(login.contains("a1 OK"), "LOGIN reply was {}", login);

    // Delivery is asynchronous: select until the new mail shows up.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let mut tag_counter = 1;
    let recent = loop {
        tag_counter += 1;
        let tag = format!("a{}", tag_counter);
        let select = imap_command(&mut imap, &tag, "SELECT Inbox").await;
        assert!(select.contains(&format!("{} OK", tag)), "SELECT reply was {}", select);
        let recent = imap_untagged_value(&select, "RECENT").unwrap_or_default();
        if recent == "1" {
            break recent;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "mail never arrived; last RECENT was {:?}",
            recent
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    };
    assert_eq!(recent, "1", "Freeman's inbox should have exactly one new mail");

    let search = imap_command(&mut imap, "s1", "SEARCH FROM \"alyx@foo.bar\"").await;
    let hits: Vec<&str> = search
        .lines()
        .find(|l| l.starts_with("* SEARCH"))
        .map(|l| l["* SEARCH".len()..].split_whitespace().collect())
        .unwrap_or_default();
    assert_eq!(hits.len(), 1, "SEARCH FROM should match one message: {}", search);
    let seq = hits[0];

    let fetch = imap_command(&mut imap, "f1", &format!("FETCH {} BODY.PEEK[]", seq)).await;
    assert!(fetch.contains("f1 OK"), "FETCH reply was {}", fetch);
    assert!(fetch.contains(body), "fetched message should carry the original body");
    assert!(fetch.contains("Subject: Hello, Freeman! I am using mailboat."));

    let store = imap_command(&mut imap, "st1", &format!("STORE {} +FLAGS (\\Seen)", seq)).await;
    assert!(store.contains("st1 OK"), "STORE reply was {}", store);

    imap_command(&mut imap, "z1", "LOGOUT").await;
    mailboat.stop().await;
}

/// With auth_require_tls (the default) a plaintext session gets neither
/// the AUTH advertisement nor a usable AUTH command.
#[tokio::test]
async fn auth_is_refused_on_plaintext_sessions() {
    let mailboat = Mailboat::new(test_config(true)).await.unwrap();
    mailboat.start().await.unwrap();
    assert!(mailboat.auth_require_tls());

    let stream = TcpStream::connect(("localhost", mailboat.smtpd_port().unwrap()))
        .await
        .unwrap();
    let mut smtp = BufReader::new(stream);
    smtp_reply(&mut smtp).await;
    let ehlo = smtp_command(&mut smtp, "EHLO tester").await;
    assert!(!ehlo.contains("AUTH"), "plaintext EHLO must not advertise AUTH: {}", ehlo);
    let auth = smtp_command(&mut smtp, "AUTH LOGIN").await;
    assert!(auth.starts_with("538"), "AUTH on plaintext should get 538, got {}", auth);
    smtp_command(&mut smtp, "QUIT").await;

    mailboat.stop().await;
}

/// An `act_as_user` token opens the mailbox; a broader `mail` token is
/// an authorization failure.
#[tokio::test]
async fn token_scope_gates_imap_access() {
    let mailboat = Mailboat::new(test_config(false)).await.unwrap();
    let user = mailboat
        .new_user("alyx", "Alyx", "alyx@foo.bar", "alyxpassword")
        .await
        .unwrap();
    let tokens = mailboat.storage_hub().token_records();

    let narrow = tokens
        .create_token(&user.profileid, None, None, vec![SCOPE_ACT_AS_USER.to_string()], None)
        .await
        .unwrap();
    let identity = mailboat
        .imap_login()
        .authenticate(ImapCredentials::login_token(narrow.token))
        .await
        .unwrap();
    assert_eq!(identity.name(), "alyx");

    let broad = tokens
        .create_token(&user.profileid, None, None, vec!["mail".to_string()], None)
        .await
        .unwrap();
    let rejected = mailboat
        .imap_login()
        .authenticate(ImapCredentials::login_token(broad.token))
        .await
        .unwrap_err();
    assert!(matches!(rejected, ImapAuthError::AuthorizationFailure));

    mailboat.stop().await;
}

/// The liveness endpoint answers 204 and binds a loopback port when no
/// binds are configured.
#[tokio::test]
async fn http_gateway_serves_generate204() {
    let mailboat = Mailboat::new(test_config(false)).await.unwrap();
    mailboat.start().await.unwrap();

    let addrs = mailboat.http_api_gate().local_addrs();
    assert_eq!(addrs.len(), 1, "an empty bind list falls back to one loopback port");
    assert!(addrs[0].ip().is_loopback());

    let mut stream = TcpStream::connect(addrs[0]).await.unwrap();
    stream
        .write_all(b"GET /generate204 HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut reader = BufReader::new(stream);
    let mut status = String::new();
    reader.read_line(&mut status).await.unwrap();
    assert!(status.starts_with("HTTP/1.1 204"), "status line was {}", status);

    let mut stream = TcpStream::connect(addrs[0]).await.unwrap();
    stream
        .write_all(b"GET /elsewhere HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut reader = BufReader::new(stream);
    let mut status = String::new();
    reader.read_line(&mut status).await.unwrap();
    assert!(status.starts_with("HTTP/1.1 404"), "status line was {}", status);

    mailboat.stop().await;
}
