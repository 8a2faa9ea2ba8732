/*
 * queue_test.rs
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

//! Durable-queue behaviour against a real database file: entries that
//! were enqueued but never removed survive a full close-and-reopen.

use std::path::PathBuf;
use std::sync::Arc;

use mailboat_core::mime::MailMessage;
use mailboat_core::mta::{DurableEmailQueue, EmailQueue};
use mailboat_core::storage::engine::{open_database, RedbStorage};
use uuid::Uuid;

struct TempDatabase {
    path: PathBuf,
}

impl TempDatabase {
    fn new() -> Self {
        let path = std::env::temp_dir().join(format!("mailboat-queue-{}.redb", Uuid::new_v4()));
        Self { path }
    }

    fn path(&self) -> &str {
        self.path.to_str().expect("temp path is utf-8")
    }
}

impl Drop for TempDatabase {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn message(n: u32) -> MailMessage {
    MailMessage::parse(&format!(
        "Message-Id: <{}@queue-test>\r\nSubject: {}\r\nDelivered-To: user@foo.bar\r\n\r\npayload {}\r\n",
        n, n, n
    ))
}

#[tokio::test]
async fn queue_survives_a_process_restart() {
    let temp = TempDatabase::new();

    {
        let database = Arc::new(open_database(temp.path()).unwrap());
        let storage = Arc::new(RedbStorage::new(database, "transfer_agent.queue").unwrap());
        let queue = DurableEmailQueue::open(storage).await.unwrap();
        queue.put(message(1)).await.unwrap();
        queue.put(message(2)).await.unwrap();
        queue.put(message(3)).await.unwrap();
        // one delivery completes before the "crash"
        let (_m, id) = queue.get().await.unwrap();
        queue.remove(id).await.unwrap();
    }

    // reopen the same file, as a restarted process would
    {
        let database = Arc::new(open_database(temp.path()).unwrap());
        let storage = Arc::new(RedbStorage::new(database, "transfer_agent.queue").unwrap());
        let queue = DurableEmailQueue::open(storage).await.unwrap();
        assert_eq!(queue.pending(), 2);

        let (m2, id2) = queue.get().await.unwrap();
        assert_eq!(m2.header("Subject"), Some("2"));
        queue.remove(id2).await.unwrap();
        let (m3, id3) = queue.get().await.unwrap();
        assert_eq!(m3.header("Subject"), Some("3"));
        queue.remove(id3).await.unwrap();
    }

    let database = Arc::new(open_database(temp.path()).unwrap());
    let storage = Arc::new(RedbStorage::new(database, "transfer_agent.queue").unwrap());
    let queue = DurableEmailQueue::open(storage).await.unwrap();
    assert_eq!(queue.pending(), 0, "fully drained queue should stay empty across restarts");
}
