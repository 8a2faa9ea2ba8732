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

//! The abstract storage layer: collection-oriented CRUD over
//! dictionary-shaped documents, plus the adapter that gives every call
//! site a strongly typed view.
//!
//! Documents are JSON objects; the engine assigns an integer id exposed
//! as `__id`. Queries are equality-only: every key in the query must be
//! present in the document with an equal value.

pub mod engine;

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// The dictionary form every collection persists.
pub type Document = serde_json::Map<String, Value>;

/// Key under which the engine-assigned integer id appears in documents.
pub const ID_FIELD: &str = "__id";

/// Errors from the storage layer. Fatal to the calling operation;
/// corruption is not recovered automatically.
#[derive(Debug)]
pub enum StorageError {
    /// Underlying engine failure (I/O, transaction, table).
    Engine(String),
    /// Document could not be encoded or decoded.
    Codec(String),
}

impl StorageError {
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Engine(m) => write!(f, "storage engine: {}", m),
            StorageError::Codec(m) => write!(f, "document codec: {}", m),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

/// Build an equality query from key/value pairs.
pub fn query<K, V, I>(pairs: I) -> Document
where
    K: Into<String>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}

/// True when every key of `query` is present in `doc` with an equal
/// value. A key missing from the document is a non-match.
pub fn doc_matches(doc: &Document, query: &Document) -> bool {
    query.iter().all(|(k, v)| doc.get(k) == Some(v))
}

/// Streamed `find` results. Backed by a bounded channel; dropping the
/// stream cancels the producing engine task.
pub struct DocumentStream {
    rx: mpsc::Receiver<Result<Document, StorageError>>,
}

impl DocumentStream {
    pub fn new(rx: mpsc::Receiver<Result<Document, StorageError>>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<Result<Document, StorageError>> {
        self.rx.recv().await
    }
}

/// A named collection of dictionary documents.
#[async_trait]
pub trait CommonStorage: Send + Sync {
    /// Persist `record`, assigning an internal id; returns the stored
    /// document with `__id` filled in.
    async fn store(&self, record: Document) -> Result<Document, StorageError>;

    /// Every document matching `query`, streamed lazily.
    async fn find(&self, query: Document) -> Result<DocumentStream, StorageError>;

    async fn find_one(&self, query: Document) -> Result<Option<Document>, StorageError>;

    /// Replace the first match in place (preserving its internal id).
    /// With `upsert`, insert when there is no match.
    async fn update_one(
        &self,
        query: Document,
        updated: Document,
        upsert: bool,
    ) -> Result<Option<Document>, StorageError>;

    /// Remove every match; returns the count removed.
    async fn remove(&self, query: Document) -> Result<usize, StorageError>;

    async fn remove_one(&self, query: Document) -> Result<bool, StorageError>;
}

/// Transforms between a record type and the persisted dictionary form.
pub trait CommonStorageAdapter<T>: Send + Sync {
    fn record2dict(&self, record: &T) -> Result<Document, StorageError>;
    fn dict2record(&self, dict: Document) -> Result<T, StorageError>;
}

/// The default adapter: structural field introspection through serde.
/// Strips the engine-internal `__id` on read and rebuilds the record by
/// name-keyed construction.
pub struct SerdeStorageAdapter<T> {
    _record: PhantomData<fn() -> T>,
}

impl<T> SerdeStorageAdapter<T> {
    pub fn new() -> Self {
        Self { _record: PhantomData }
    }
}

impl<T> Default for SerdeStorageAdapter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CommonStorageAdapter<T> for SerdeStorageAdapter<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn record2dict(&self, record: &T) -> Result<Document, StorageError> {
        match serde_json::to_value(record)? {
            Value::Object(map) => Ok(map),
            other => Err(StorageError::Codec(format!(
                "record serialised to {} instead of an object",
                json_kind(&other)
            ))),
        }
    }

    fn dict2record(&self, mut dict: Document) -> Result<T, StorageError> {
        dict.remove(ID_FIELD);
        Ok(serde_json::from_value(Value::Object(dict))?)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Typed wrapper over a `CommonStorage`: reads and writes records
/// directly, converting through the adapter at the boundary.
pub struct CommonStorageRecordWrapper<T> {
    common_storage: Arc<dyn CommonStorage>,
    adapter: SerdeStorageAdapter<T>,
}

impl<T> Clone for CommonStorageRecordWrapper<T> {
    fn clone(&self) -> Self {
        Self {
            common_storage: Arc::clone(&self.common_storage),
            adapter: SerdeStorageAdapter::new(),
        }
    }
}

impl<T> CommonStorageRecordWrapper<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(common_storage: Arc<dyn CommonStorage>) -> Self {
        Self { common_storage, adapter: SerdeStorageAdapter::new() }
    }

    pub async fn store(&self, record: &T) -> Result<T, StorageError> {
        let dict = self.adapter.record2dict(record)?;
        let stored = self.common_storage.store(dict).await?;
        self.adapter.dict2record(stored)
    }

    pub async fn find(&self, query: Document) -> Result<RecordStream<T>, StorageError> {
        let docs = self.common_storage.find(query).await?;
        Ok(RecordStream { docs, adapter: SerdeStorageAdapter::new() })
    }

    pub async fn find_one(&self, query: Document) -> Result<Option<T>, StorageError> {
        match self.common_storage.find_one(query).await? {
            Some(doc) => Ok(Some(self.adapter.dict2record(doc)?)),
            None => Ok(None),
        }
    }

    pub async fn update_one(&self, query: Document, updated: &T) -> Result<Option<T>, StorageError> {
        let dict = self.adapter.record2dict(updated)?;
        match self.common_storage.update_one(query, dict, false).await? {
            Some(doc) => Ok(Some(self.adapter.dict2record(doc)?)),
            None => Ok(None),
        }
    }

    /// `update_one` that inserts the record when nothing matches.
    pub async fn upsert_one(&self, query: Document, updated: &T) -> Result<Option<T>, StorageError> {
        let dict = self.adapter.record2dict(updated)?;
        match self.common_storage.update_one(query, dict, true).await? {
            Some(doc) => Ok(Some(self.adapter.dict2record(doc)?)),
            None => Ok(None),
        }
    }

    pub async fn remove(&self, query: Document) -> Result<usize, StorageError> {
        self.common_storage.remove(query).await
    }

    pub async fn remove_one(&self, query: Document) -> Result<bool, StorageError> {
        self.common_storage.remove_one(query).await
    }
}

/// Streamed typed `find` results.
pub struct RecordStream<T> {
    docs: DocumentStream,
    adapter: SerdeStorageAdapter<T>,
}

impl<T> RecordStream<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub async fn next(&mut self) -> Option<Result<T, StorageError>> {
        match self.docs.next().await? {
            Ok(doc) => Some(self.adapter.dict2record(doc)),
            Err(e) => Some(Err(e)),
        }
    }

    /// Drain the stream into a vector.
    pub async fn collect(mut self) -> Result<Vec<T>, StorageError> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item?);
        }
        Ok(out)
    }
}
