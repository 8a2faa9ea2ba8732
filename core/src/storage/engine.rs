/*
 * engine.rs
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

//! redb-backed `CommonStorage`.
//!
//! One redb table per named collection, keyed by the engine-assigned
//! `u64` id and holding the document as JSON text. redb is synchronous,
//! so every call runs on the blocking worker pool; the scheduler task
//! never touches the engine directly. Writes go through redb's single
//! write transaction; each `find` opens a fresh read transaction so
//! concurrent queries cannot interfere.

use std::sync::Arc;

use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task;

use super::{doc_matches, CommonStorage, Document, DocumentStream, StorageError, ID_FIELD};

/// Capacity of the channel between the engine iteration task and the
/// consumer of a `find` stream.
const FIND_CHANNEL_CAPACITY: usize = 16;

impl From<redb::DatabaseError> for StorageError {
    fn from(e: redb::DatabaseError) -> Self {
        StorageError::Engine(e.to_string())
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(e: redb::TransactionError) -> Self {
        StorageError::Engine(e.to_string())
    }
}

impl From<redb::TableError> for StorageError {
    fn from(e: redb::TableError) -> Self {
        StorageError::Engine(e.to_string())
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(e: redb::StorageError) -> Self {
        StorageError::Engine(e.to_string())
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(e: redb::CommitError) -> Self {
        StorageError::Engine(e.to_string())
    }
}

impl From<task::JoinError> for StorageError {
    fn from(e: task::JoinError) -> Self {
        StorageError::Engine(format!("worker pool: {}", e))
    }
}

/// Open the embedded database at `path`; the `:mem:` sentinel yields a
/// process-local in-memory database.
pub fn open_database(path: &str) -> Result<Database, StorageError> {
    if path == ":mem:" {
        Ok(Database::builder().create_with_backend(InMemoryBackend::new())?)
    } else {
        Ok(Database::create(path)?)
    }
}

fn table_def(name: &str) -> TableDefinition<'_, u64, &'static str> {
    TableDefinition::new(name)
}

/// A named collection stored in one redb table.
pub struct RedbStorage {
    database: Arc<Database>,
    collection_name: String,
}

impl RedbStorage {
    /// Open (and create if missing) the collection `collection_name`.
    pub fn new(database: Arc<Database>, collection_name: impl Into<String>) -> Result<Self, StorageError> {
        let collection_name = collection_name.into();
        let txn = database.begin_write()?;
        txn.open_table(table_def(&collection_name))?;
        txn.commit()?;
        Ok(Self { database, collection_name })
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    fn write_document(&self, id: u64, doc: &Document) -> Result<(), StorageError> {
        let mut doc = doc.clone();
        doc.remove(ID_FIELD);
        let text = serde_json::to_string(&doc)?;
        let txn = self.database.begin_write()?;
        {
            let mut table = txn.open_table(table_def(&self.collection_name))?;
            table.insert(id, text.as_str())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn delete_ids(&self, ids: &[u64]) -> Result<(), StorageError> {
        let txn = self.database.begin_write()?;
        {
            let mut table = txn.open_table(table_def(&self.collection_name))?;
            for id in ids {
                table.remove(*id)?;
            }
        }
        txn.commit()?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl CommonStorage for RedbStorage {
    async fn store(&self, mut record: Document) -> Result<Document, StorageError> {
        record.remove(ID_FIELD);
        let database = Arc::clone(&self.database);
        let name = self.collection_name.clone();
        task::spawn_blocking(move || {
            let text = serde_json::to_string(&record)?;
            let txn = database.begin_write()?;
            let id;
            {
                let mut table = txn.open_table(table_def(&name))?;
                id = table.last()?.map(|(k, _)| k.value() + 1).unwrap_or(1);
                table.insert(id, text.as_str())?;
            }
            txn.commit()?;
            record.insert(ID_FIELD.to_string(), Value::from(id));
            Ok(record)
        })
        .await?
    }

    async fn find(&self, query: Document) -> Result<DocumentStream, StorageError> {
        let (tx, rx) = mpsc::channel(FIND_CHANNEL_CAPACITY);
        let database = Arc::clone(&self.database);
        let name = self.collection_name.clone();
        task::spawn_blocking(move || {
            let iterate = || -> Result<(), StorageError> {
                let txn = database.begin_read()?;
                let table = match txn.open_table(table_def(&name)) {
                    Ok(table) => table,
                    Err(redb::TableError::TableDoesNotExist(_)) => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                for item in table.iter()? {
                    let (key, value) = item?;
                    let mut doc: Document = serde_json::from_str(value.value())?;
                    doc.insert(ID_FIELD.to_string(), Value::from(key.value()));
                    if !doc_matches(&doc, &query) {
                        continue;
                    }
                    if tx.blocking_send(Ok(doc)).is_err() {
                        // consumer abandoned the stream
                        return Ok(());
                    }
                }
                Ok(())
            };
            if let Err(e) = iterate() {
                let _ = tx.blocking_send(Err(e));
            }
        });
        Ok(DocumentStream::new(rx))
    }

    async fn find_one(&self, query: Document) -> Result<Option<Document>, StorageError> {
        let database = Arc::clone(&self.database);
        let name = self.collection_name.clone();
        task::spawn_blocking(move || {
            let txn = database.begin_read()?;
            let table = match txn.open_table(table_def(&name)) {
                Ok(table) => table,
                Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            for item in table.iter()? {
                let (key, value) = item?;
                let mut doc: Document = serde_json::from_str(value.value())?;
                doc.insert(ID_FIELD.to_string(), Value::from(key.value()));
                if doc_matches(&doc, &query) {
                    return Ok(Some(doc));
                }
            }
            Ok(None)
        })
        .await?
    }

    async fn update_one(
        &self,
        query: Document,
        mut updated: Document,
        upsert: bool,
    ) -> Result<Option<Document>, StorageError> {
        let existing = self.find_one(query).await?;
        match existing {
            Some(doc) => {
                let id = doc
                    .get(ID_FIELD)
                    .and_then(Value::as_u64)
                    .ok_or_else(|| StorageError::engine("document is missing its internal id"))?;
                let database = Arc::clone(&self.database);
                let name = self.collection_name.clone();
                let to_write = updated.clone();
                task::spawn_blocking(move || {
                    RedbStorage { database, collection_name: name }.write_document(id, &to_write)
                })
                .await??;
                updated.insert(ID_FIELD.to_string(), Value::from(id));
                Ok(Some(updated))
            }
            None if upsert => Ok(Some(self.store(updated).await?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, query: Document) -> Result<usize, StorageError> {
        let mut stream = self.find(query).await?;
        let mut ids = Vec::new();
        while let Some(doc) = stream.next().await {
            if let Some(id) = doc?.get(ID_FIELD).and_then(Value::as_u64) {
                ids.push(id);
            }
        }
        if ids.is_empty() {
            return Ok(0);
        }
        let database = Arc::clone(&self.database);
        let name = self.collection_name.clone();
        let count = ids.len();
        task::spawn_blocking(move || {
            RedbStorage { database, collection_name: name }.delete_ids(&ids)
        })
        .await??;
        Ok(count)
    }

    async fn remove_one(&self, query: Document) -> Result<bool, StorageError> {
        let Some(doc) = self.find_one(query).await? else {
            return Ok(false);
        };
        let Some(id) = doc.get(ID_FIELD).and_then(Value::as_u64) else {
            return Err(StorageError::engine("document is missing its internal id"));
        };
        let database = Arc::clone(&self.database);
        let name = self.collection_name.clone();
        task::spawn_blocking(move || {
            RedbStorage { database, collection_name: name }.delete_ids(&[id])
        })
        .await??;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::query;

    fn mem_collection(name: &str) -> RedbStorage {
        let database = Arc::new(open_database(":mem:").unwrap());
        RedbStorage::new(database, name).unwrap()
    }

    fn doc(name: &str, count: u64) -> Document {
        query([("name", Value::from(name)), ("count", Value::from(count))])
    }

    #[tokio::test]
    async fn store_assigns_monotonic_ids() {
        let coll = mem_collection("t");
        let a = coll.store(doc("a", 1)).await.unwrap();
        let b = coll.store(doc("b", 2)).await.unwrap();
        let id_a = a.get(ID_FIELD).and_then(Value::as_u64).unwrap();
        let id_b = b.get(ID_FIELD).and_then(Value::as_u64).unwrap();
        assert!(id_b > id_a);
    }

    #[tokio::test]
    async fn find_matches_all_query_keys() {
        let coll = mem_collection("t");
        coll.store(doc("a", 1)).await.unwrap();
        coll.store(doc("a", 2)).await.unwrap();
        coll.store(doc("b", 1)).await.unwrap();

        let matches = {
            let mut stream = coll.find(query([("name", "a")])).await.unwrap();
            let mut out = Vec::new();
            while let Some(d) = stream.next().await {
                out.push(d.unwrap());
            }
            out
        };
        assert_eq!(matches.len(), 2);

        let narrow = coll
            .find_one(query([("name", Value::from("a")), ("count", Value::from(2u64))]))
            .await
            .unwrap();
        assert!(narrow.is_some());
        let none = coll.find_one(query([("nothing", "a")])).await.unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn find_by_internal_id() {
        let coll = mem_collection("t");
        let stored = coll.store(doc("a", 1)).await.unwrap();
        let id = stored.get(ID_FIELD).and_then(Value::as_u64).unwrap();
        let found = coll.find_one(query([(ID_FIELD, Value::from(id))])).await.unwrap();
        assert_eq!(found.unwrap().get("name"), Some(&Value::from("a")));
    }

    #[tokio::test]
    async fn update_one_preserves_id_and_upsert_inserts() {
        let coll = mem_collection("t");
        let stored = coll.store(doc("a", 1)).await.unwrap();
        let id = stored.get(ID_FIELD).and_then(Value::as_u64).unwrap();

        let updated = coll
            .update_one(query([("name", "a")]), doc("a", 7), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.get(ID_FIELD).and_then(Value::as_u64), Some(id));
        let reread = coll.find_one(query([("name", "a")])).await.unwrap().unwrap();
        assert_eq!(reread.get("count"), Some(&Value::from(7u64)));

        let missed = coll
            .update_one(query([("name", "zz")]), doc("zz", 1), false)
            .await
            .unwrap();
        assert!(missed.is_none());
        let upserted = coll
            .update_one(query([("name", "zz")]), doc("zz", 1), true)
            .await
            .unwrap();
        assert!(upserted.is_some());
    }

    #[tokio::test]
    async fn remove_counts_and_remove_one_reports() {
        let coll = mem_collection("t");
        coll.store(doc("a", 1)).await.unwrap();
        coll.store(doc("a", 2)).await.unwrap();
        coll.store(doc("b", 3)).await.unwrap();

        assert_eq!(coll.remove(query([("name", "a")])).await.unwrap(), 2);
        assert_eq!(coll.remove(query([("name", "a")])).await.unwrap(), 0);
        assert!(coll.remove_one(query([("name", "b")])).await.unwrap());
        assert!(!coll.remove_one(query([("name", "b")])).await.unwrap());
    }

    #[tokio::test]
    async fn abandoned_stream_stops_the_producer() {
        let coll = mem_collection("t");
        for i in 0..100 {
            coll.store(doc("a", i)).await.unwrap();
        }
        let mut stream = coll.find(query([("name", "a")])).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.get("name"), Some(&Value::from("a")));
        drop(stream);
        // a subsequent write must not deadlock on the old read cursor
        coll.store(doc("b", 0)).await.unwrap();
    }
}
