//! Cursor implementation for iterating over query results.

use crate::db::Database;
use crate::error::{MongoError, Result};
use crate::transport::numeric;
use bson::{doc, Bson, Document};
use futures::Stream;
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::marker::PhantomData;

/// Internal cursor state.
#[derive(Debug)]
pub(crate) struct CursorState {
    /// Cursor ID from the server; 0 once the server has nothing more.
    pub cursor_id: i64,
    /// Buffered documents.
    pub buffer: VecDeque<Document>,
    /// The namespace (db.collection).
    pub namespace: String,
    /// Batch size for `getMore`.
    pub batch_size: Option<u32>,
}

impl CursorState {
    /// Create a cursor state with initial data.
    pub fn with_data(namespace: String, data: Vec<Document>, cursor_id: i64) -> Self {
        Self {
            cursor_id,
            buffer: data.into(),
            namespace,
            batch_size: None,
        }
    }

    fn exhausted(&self) -> bool {
        self.cursor_id == 0 && self.buffer.is_empty()
    }

    fn collection_name(&self) -> &str {
        self.namespace
            .split_once('.')
            .map(|(_, coll)| coll)
            .unwrap_or(&self.namespace)
    }
}

/// A cursor for iterating over query results.
///
/// The first batch comes with the reply that opened the cursor; further
/// batches are fetched with `getMore` as the buffer drains.
///
/// # Example
///
/// ```ignore
/// let mut cursor = collection.find(doc! { "status": "active" }).await?;
/// while let Some(doc) = cursor.try_next().await? {
///     println!("{:?}", doc);
/// }
/// ```
pub struct Cursor<T> {
    pub(crate) state: CursorState,
    pub(crate) db: Database,
    _marker: PhantomData<T>,
}

impl<T> Cursor<T> {
    /// Build a cursor from a reply carrying `cursor: {firstBatch, id, ns}`.
    pub(crate) fn from_reply(db: Database, reply: &Document) -> Result<Self> {
        let cursor = reply.get_document("cursor")?;
        let batch = cursor
            .get_array("firstBatch")?
            .iter()
            .map(|doc| match doc {
                Bson::Document(doc) => Ok(doc.clone()),
                other => Err(MongoError::Deserialization(format!(
                    "expected document in cursor batch, got {}",
                    other
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        let id = numeric(cursor, "id").unwrap_or(0);
        let namespace = cursor.get_str("ns").unwrap_or_default().to_string();
        Ok(Self {
            state: CursorState::with_data(namespace, batch, id),
            db,
            _marker: PhantomData,
        })
    }

    pub(crate) fn with_batch_size(mut self, batch_size: Option<u32>) -> Self {
        self.state.batch_size = batch_size;
        self
    }

    /// Check if the cursor is exhausted.
    pub fn is_exhausted(&self) -> bool {
        self.state.exhausted()
    }

    /// Get the server cursor ID, if one is still open.
    pub fn cursor_id(&self) -> Option<i64> {
        Some(self.state.cursor_id).filter(|id| *id != 0)
    }

    /// Close the cursor, releasing any server-side state.
    pub async fn close(mut self) -> Result<()> {
        self.state.buffer.clear();
        if self.state.cursor_id != 0 {
            let id = std::mem::replace(&mut self.state.cursor_id, 0);
            self.db
                .run_command(doc! {
                    "killCursors": self.state.collection_name(),
                    "cursors": [id],
                })
                .await?;
        }
        Ok(())
    }

    async fn fetch_more(&mut self) -> Result<()> {
        let mut command = doc! {
            "getMore": self.state.cursor_id,
            "collection": self.state.collection_name(),
        };
        if let Some(size) = self.state.batch_size {
            command.insert("batchSize", i64::from(size));
        }

        let reply = match self.db.run_command(command).await {
            Ok(reply) => reply,
            Err(e) => {
                self.state.cursor_id = 0;
                return Err(e);
            }
        };
        let cursor = reply.get_document("cursor")?;
        for doc in cursor.get_array("nextBatch")? {
            if let Bson::Document(doc) = doc {
                self.state.buffer.push_back(doc.clone());
            }
        }
        self.state.cursor_id = numeric(cursor, "id").unwrap_or(0);
        Ok(())
    }
}

impl<T: DeserializeOwned + Send + Unpin + 'static> Cursor<T> {
    /// Try to get the next document.
    pub async fn try_next(&mut self) -> Result<Option<T>> {
        while self.state.buffer.is_empty() && self.state.cursor_id != 0 {
            self.fetch_more().await?;
        }

        match self.state.buffer.pop_front() {
            Some(doc) => bson::from_document(doc)
                .map(Some)
                .map_err(|e| MongoError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Collect all documents into a vector.
    pub async fn collect(mut self) -> Result<Vec<T>> {
        let mut results = Vec::new();
        while let Some(doc) = self.try_next().await? {
            results.push(doc);
        }
        Ok(results)
    }

    /// Turn the cursor into a `Stream` of documents.
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> {
        futures::stream::try_unfold(self, |mut cursor| async move {
            Ok(cursor.try_next().await?.map(|doc| (doc, cursor)))
        })
    }
}
