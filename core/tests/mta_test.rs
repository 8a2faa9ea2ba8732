/*
 * mta_test.rs
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

//! Transfer-agent integration: a real SMTP dialog into a local delivery
//! handler, plus the relay-protection and Bcc-privacy behaviours.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mailboat_core::mime::MailMessage;
use mailboat_core::mta::{
    smtpd_auth_rejectall, EmailQueue, LocalDeliveryHandler, MemoryEmailQueue, TransferAgent,
    TransferAgentConfig,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

type VirtualBox = Arc<Mutex<Vec<MailMessage>>>;

fn collecting_handler(virtual_box: VirtualBox) -> LocalDeliveryHandler {
    Arc::new(move |message| {
        let virtual_box = Arc::clone(&virtual_box);
        Box::pin(async move {
            virtual_box.lock().unwrap().push(message);
            Ok(())
        })
    })
}

fn local_agent(queue: Arc<MemoryEmailQueue>, virtual_box: VirtualBox) -> TransferAgent {
    TransferAgent::new(
        TransferAgentConfig {
            mydomains: vec!["localhost".to_string()],
            hostname: "localhost".to_string(),
            smtpd_port: 0,
            auth_require_tls: false,
            ..TransferAgentConfig::default()
        },
        queue as Arc<dyn EmailQueue>,
        collecting_handler(virtual_box),
        smtpd_auth_rejectall(),
    )
}

async fn read_reply(reader: &mut BufReader<TcpStream>) -> String {
    let mut all = String::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.expect("read smtp reply");
        all.push_str(&line);
        // the last line of a reply has a space after the code
        if line.len() < 4 || line.as_bytes()[3] != b'-' {
            return all;
        }
    }
}

async fn send_command(reader: &mut BufReader<TcpStream>, command: &str) -> String {
    reader
        .get_mut()
        .write_all(format!("{}\r\n", command).as_bytes())
        .await
        .expect("write smtp command");
    read_reply(reader).await
}

async fn wait_for_deliveries(virtual_box: &VirtualBox, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if virtual_box.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("delivery did not happen in time");
}

#[tokio::test]
async fn local_delivery_through_a_real_smtp_session() {
    let virtual_box: VirtualBox = Arc::new(Mutex::new(Vec::new()));
    let queue = Arc::new(MemoryEmailQueue::new());
    let agent = local_agent(Arc::clone(&queue), Arc::clone(&virtual_box));
    agent.start().await.unwrap();
    let port = agent.smtpd_port().unwrap();

    let stream = TcpStream::connect(("localhost", port)).await.unwrap();
    let mut reader = BufReader::new(stream);
    assert!(read_reply(&mut reader).await.starts_with("220"));
    assert!(send_command(&mut reader, "EHLO tester").await.starts_with("250"));
    assert!(send_command(&mut reader, "MAIL FROM:<qa@localhost>").await.starts_with("250"));
    assert!(send_command(&mut reader, "RCPT TO:<user@localhost>").await.starts_with("250"));
    assert!(send_command(&mut reader, "DATA").await.starts_with("354"));
    let reply = send_command(
        &mut reader,
        "Message-Id: <test1@localhost>\r\nTo: user@localhost\r\nFrom: qa@localhost\r\n\r\nhello there\r\n.",
    )
    .await;
    assert!(reply.starts_with("250"), "DATA end reply was {}", reply);
    assert!(send_command(&mut reader, "QUIT").await.starts_with("221"));

    wait_for_deliveries(&virtual_box, 1).await;
    let delivered = virtual_box.lock().unwrap();
    let message = &delivered[0];
    assert_eq!(message.header("Message-Id"), Some("<test1@localhost>"));
    assert_eq!(message.header("To"), Some("user@localhost"));
    assert_eq!(message.header("From"), Some("qa@localhost"));
    assert_eq!(message.header("Delivered-To"), Some("user@localhost"));
    assert_eq!(message.header("X-MailFrom"), Some("qa@localhost"));
    assert!(message
        .header("X-Peer")
        .is_some_and(|peer| peer.starts_with("127.0.0.1") || peer.starts_with("::1")));
    drop(delivered);

    agent.destroy();
}

#[tokio::test]
async fn foreign_submitters_cannot_relay_to_foreign_domains() {
    let virtual_box: VirtualBox = Arc::new(Mutex::new(Vec::new()));
    let queue = Arc::new(MemoryEmailQueue::new());
    let agent = local_agent(Arc::clone(&queue), Arc::clone(&virtual_box));

    let message = MailMessage::parse(
        "Message-Id: <relay@attacker>\r\nX-Peer: 10.0.0.5\r\nTo: external@example.org\r\n\r\nspam\r\n",
    );
    agent.handle_message(&message, false).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.len(), 0, "no envelope may be enqueued for the relay attempt");
    assert!(virtual_box.lock().unwrap().is_empty());

    agent.destroy();
}

#[tokio::test]
async fn each_bcc_recipient_sees_only_its_own_entry() {
    let virtual_box: VirtualBox = Arc::new(Mutex::new(Vec::new()));
    let queue = Arc::new(MemoryEmailQueue::new());
    let agent = local_agent(Arc::clone(&queue), Arc::clone(&virtual_box));

    let message = MailMessage::parse(
        "Message-Id: <bcc@localhost>\r\nX-Peer: 127.0.0.1\r\nTo: a@localhost\r\nBcc: b@localhost\r\n\r\nprivate\r\n",
    );
    agent.handle_message(&message, false).await.unwrap();
    wait_for_deliveries(&virtual_box, 2).await;

    let delivered = virtual_box.lock().unwrap();
    for envelope in delivered.iter() {
        let own = envelope.header("Delivered-To").unwrap().to_string();
        assert_eq!(
            envelope.header("Bcc"),
            Some(own.as_str()),
            "the Bcc header must be rewritten to the envelope recipient"
        );
        assert_eq!(envelope.headers().filter(|(n, _)| n.eq_ignore_ascii_case("Bcc")).count(), 1);
    }
    drop(delivered);

    agent.destroy();
}

#[tokio::test]
async fn messages_without_message_id_are_accepted_then_dropped() {
    let virtual_box: VirtualBox = Arc::new(Mutex::new(Vec::new()));
    let queue = Arc::new(MemoryEmailQueue::new());
    let agent = local_agent(Arc::clone(&queue), Arc::clone(&virtual_box));
    agent.start().await.unwrap();
    let port = agent.smtpd_port().unwrap();

    let stream = TcpStream::connect(("localhost", port)).await.unwrap();
    let mut reader = BufReader::new(stream);
    read_reply(&mut reader).await;
    send_command(&mut reader, "HELO tester").await;
    send_command(&mut reader, "MAIL FROM:<qa@localhost>").await;
    send_command(&mut reader, "RCPT TO:<user@localhost>").await;
    send_command(&mut reader, "DATA").await;
    let reply = send_command(
        &mut reader,
        "To: user@localhost\r\nFrom: qa@localhost\r\n\r\nno id\r\n.",
    )
    .await;
    // the client still gets its 250; the message is dropped silently
    assert!(reply.starts_with("250"), "DATA end reply was {}", reply);
    send_command(&mut reader, "QUIT").await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.len(), 0);
    assert!(virtual_box.lock().unwrap().is_empty());

    agent.destroy();
}

#[tokio::test]
async fn rset_clears_the_transaction_and_rcpt_requires_mail() {
    let virtual_box: VirtualBox = Arc::new(Mutex::new(Vec::new()));
    let queue = Arc::new(MemoryEmailQueue::new());
    let agent = local_agent(Arc::clone(&queue), Arc::clone(&virtual_box));
    agent.start().await.unwrap();
    let port = agent.smtpd_port().unwrap();

    let stream = TcpStream::connect(("localhost", port)).await.unwrap();
    let mut reader = BufReader::new(stream);
    read_reply(&mut reader).await;
    send_command(&mut reader, "EHLO tester").await;

    assert!(send_command(&mut reader, "RCPT TO:<user@localhost>").await.starts_with("503"));
    assert!(send_command(&mut reader, "DATA").await.starts_with("503"));
    assert!(send_command(&mut reader, "MAIL FROM:<qa@localhost>").await.starts_with("250"));
    assert!(send_command(&mut reader, "MAIL FROM:<qa@localhost>").await.starts_with("503"));
    assert!(send_command(&mut reader, "RSET").await.starts_with("250"));
    assert!(send_command(&mut reader, "MAIL FROM:<qa@localhost>").await.starts_with("250"));
    assert!(send_command(&mut reader, "NOOP").await.starts_with("250"));
    assert!(send_command(&mut reader, "BOGUS").await.starts_with("500"));
    send_command(&mut reader, "QUIT").await;

    agent.destroy();
}
