/*
 * queue.rs
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

//! The two `EmailQueue` implementations: a process-local map for tests
//! and small setups, and the durable record-store queue the transfer
//! agent uses by default.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::mime::MailMessage;
use crate::storage::{query, CommonStorage, ID_FIELD};

use super::protocols::{EmailQueue, QueueError};

/// In-process queue: monotonically-assigned ids over a map. Strict FIFO
/// of insertion; concurrent consumers are serialised by a lock around
/// the read pointer.
pub struct MemoryEmailQueue {
    state: Mutex<MemoryQueueState>,
    getting: AsyncMutex<()>,
    notify: Notify,
}

struct MemoryQueueState {
    container: HashMap<u64, MailMessage>,
    next_read_id: u64,
    next_set_id: u64,
}

impl MemoryEmailQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryQueueState {
                container: HashMap::new(),
                next_read_id: 0,
                next_set_id: 0,
            }),
            getting: AsyncMutex::new(()),
            notify: Notify::new(),
        }
    }

    /// Entries currently held (queued and not yet removed).
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().container.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_next(&self) -> Option<(MailMessage, u64)> {
        let mut state = self.state.lock().unwrap();
        while state.next_read_id < state.next_set_id {
            let id = state.next_read_id;
            state.next_read_id += 1;
            if let Some(message) = state.container.get(&id) {
                return Some((message.clone(), id));
            }
            // removed before it was read; skip to the next id
        }
        None
    }
}

impl Default for MemoryEmailQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmailQueue for MemoryEmailQueue {
    async fn get(&self) -> Result<(MailMessage, u64), QueueError> {
        let _guard = self.getting.lock().await;
        loop {
            let notified = self.notify.notified();
            if let Some(entry) = self.try_next() {
                return Ok(entry);
            }
            notified.await;
        }
    }

    async fn remove(&self, id: u64) -> Result<(), QueueError> {
        self.state.lock().unwrap().container.remove(&id);
        Ok(())
    }

    async fn put(&self, message: MailMessage) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().unwrap();
            let id = state.next_set_id;
            state.container.insert(id, message);
            state.next_set_id += 1;
        }
        self.notify.notify_one();
        Ok(())
    }
}

/// Durable queue over a record-store collection. Raw message text is
/// the only payload; ids are the engine's. On open the collection is
/// scanned so entries enqueued before a crash are replayed.
pub struct DurableEmailQueue {
    storage: Arc<dyn CommonStorage>,
    ids: Mutex<VecDeque<u64>>,
    notify: Notify,
}

impl DurableEmailQueue {
    pub async fn open(storage: Arc<dyn CommonStorage>) -> Result<Self, QueueError> {
        let mut ids = VecDeque::new();
        let mut stream = storage.find(query::<&str, Value, _>([])).await?;
        while let Some(doc) = stream.next().await {
            if let Some(id) = doc?.get(ID_FIELD).and_then(Value::as_u64) {
                ids.push_back(id);
            }
        }
        Ok(Self { storage, ids: Mutex::new(ids), notify: Notify::new() })
    }

    /// Ids currently waiting in memory (fetched-but-unremoved entries
    /// are not counted).
    pub fn pending(&self) -> usize {
        self.ids.lock().unwrap().len()
    }
}

#[async_trait]
impl EmailQueue for DurableEmailQueue {
    async fn get(&self) -> Result<(MailMessage, u64), QueueError> {
        loop {
            let notified = self.notify.notified();
            let id = self.ids.lock().unwrap().pop_front();
            match id {
                Some(id) => {
                    let Some(doc) = self.storage.find_one(query([(ID_FIELD, Value::from(id))])).await? else {
                        // removed out from under us; take the next entry
                        continue;
                    };
                    let Some(raw) = doc.get("message").and_then(Value::as_str) else {
                        return Err(QueueError::Corrupt(format!("entry {} has no message field", id)));
                    };
                    return Ok((MailMessage::parse(raw), id));
                }
                None => notified.await,
            }
        }
    }

    async fn remove(&self, id: u64) -> Result<(), QueueError> {
        self.storage.remove(query([(ID_FIELD, Value::from(id))])).await?;
        Ok(())
    }

    async fn put(&self, message: MailMessage) -> Result<(), QueueError> {
        let doc = query([("message", message.to_wire_string())]);
        let stored = self.storage.store(doc).await?;
        let id = stored
            .get(ID_FIELD)
            .and_then(Value::as_u64)
            .ok_or_else(|| QueueError::Corrupt("store returned no id".to_string()))?;
        self.ids.lock().unwrap().push_back(id);
        self.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::engine::{open_database, RedbStorage};
    use std::time::Duration;

    fn message(n: u32) -> MailMessage {
        MailMessage::parse(&format!("Message-Id: <{}@q>\r\nSubject: {}\r\n\r\nbody\r\n", n, n))
    }

    #[tokio::test]
    async fn memory_queue_is_fifo_with_distinct_ids() {
        let queue = MemoryEmailQueue::new();
        for n in 0..3 {
            queue.put(message(n)).await.unwrap();
        }
        let (m0, id0) = queue.get().await.unwrap();
        let (m1, id1) = queue.get().await.unwrap();
        let (m2, id2) = queue.get().await.unwrap();
        assert_eq!(m0.header("Subject"), Some("0"));
        assert_eq!(m1.header("Subject"), Some("1"));
        assert_eq!(m2.header("Subject"), Some("2"));
        assert!(id0 != id1 && id1 != id2 && id2 != id0);
    }

    #[tokio::test]
    async fn memory_queue_get_waits_for_put() {
        let queue = Arc::new(MemoryEmailQueue::new());
        let getter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.put(message(7)).await.unwrap();
        let (got, _) = tokio::time::timeout(Duration::from_secs(1), getter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.header("Subject"), Some("7"));
    }

    #[tokio::test]
    async fn memory_queue_remove_is_idempotent() {
        let queue = MemoryEmailQueue::new();
        queue.put(message(1)).await.unwrap();
        let (_m, id) = queue.get().await.unwrap();
        queue.remove(id).await.unwrap();
        let len_after_first = queue.len();
        queue.remove(id).await.unwrap();
        assert_eq!(queue.len(), len_after_first);
    }

    #[tokio::test]
    async fn durable_queue_round_trips_messages() {
        let database = Arc::new(open_database(":mem:").unwrap());
        let storage = Arc::new(RedbStorage::new(database, "q.queue").unwrap());
        let queue = DurableEmailQueue::open(storage).await.unwrap();

        queue.put(message(1)).await.unwrap();
        queue.put(message(2)).await.unwrap();
        let (m1, id1) = queue.get().await.unwrap();
        assert_eq!(m1.header("Subject"), Some("1"));
        queue.remove(id1).await.unwrap();
        queue.remove(id1).await.unwrap(); // idempotent
        let (m2, _id2) = queue.get().await.unwrap();
        assert_eq!(m2.header("Subject"), Some("2"));
    }

    #[tokio::test]
    async fn durable_queue_recovers_pending_entries_on_open() {
        let database = Arc::new(open_database(":mem:").unwrap());
        let storage: Arc<dyn CommonStorage> =
            Arc::new(RedbStorage::new(Arc::clone(&database), "q.queue").unwrap());

        {
            let queue = DurableEmailQueue::open(Arc::clone(&storage)).await.unwrap();
            queue.put(message(1)).await.unwrap();
            queue.put(message(2)).await.unwrap();
            // simulate a crash: in-memory id list is dropped without remove()
        }

        let recovered = DurableEmailQueue::open(storage).await.unwrap();
        assert_eq!(recovered.pending(), 2);
        let (m1, _) = recovered.get().await.unwrap();
        let (m2, _) = recovered.get().await.unwrap();
        assert_eq!(m1.header("Subject"), Some("1"));
        assert_eq!(m2.header("Subject"), Some("2"));
    }
}
