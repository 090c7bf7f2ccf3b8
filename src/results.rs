//! Contains the types of results returned by document store operations.

use std::collections::VecDeque;

use serde::Serialize;

use crate::{
    bson::{Bson, Document},
    store::Namespace,
};

/// The result of a [`DocumentStore::insert_one`](crate::store::DocumentStore::insert_one)
/// operation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct InsertOneResult {
    /// The `_id` field of the document inserted.
    pub inserted_id: Bson,
}

/// The result of a [`DocumentStore::replace_one`](crate::store::DocumentStore::replace_one) or
/// [`DocumentStore::update_one`](crate::store::DocumentStore::update_one) operation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct UpdateResult {
    /// The number of documents that matched the filter.
    pub matched_count: u64,
    /// The number of documents that were modified by the operation.
    pub modified_count: u64,
    /// The `_id` field of the upserted document.
    pub upserted_id: Option<Bson>,
}

/// The result of a [`DocumentStore::delete_many`](crate::store::DocumentStore::delete_many)
/// operation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct DeleteResult {
    /// The number of documents deleted by the operation.
    pub deleted_count: u64,
}

/// The first batch of a query along with the server-side cursor that can produce the rest.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CursorReply {
    /// The namespace the cursor iterates.
    pub ns: Namespace,
    /// The server-side cursor id. 0 means no further batches exist.
    pub id: i64,
    /// The documents returned with the reply.
    pub first_batch: VecDeque<Document>,
}

impl CursorReply {
    pub fn new(ns: Namespace, id: i64, first_batch: impl IntoIterator<Item = Document>) -> Self {
        Self {
            ns,
            id,
            first_batch: first_batch.into_iter().collect(),
        }
    }

    /// Parses the `{ cursor: { id, ns, firstBatch } }` reply of a cursor-producing command.
    pub(crate) fn from_command_reply(reply: &Document) -> crate::error::Result<Self> {
        let cursor = reply.get_document("cursor")?;
        let ns = Namespace::from_str(cursor.get_str("ns")?).ok_or_else(|| {
            crate::error::Error::invalid_response("cursor namespace must be db.coll")
        })?;
        let id = cursor.get_i64("id")?;
        let first_batch = cursor
            .get_array("firstBatch")?
            .iter()
            .map(|value| match value {
                Bson::Document(doc) => Ok(doc.clone()),
                other => Err(crate::error::Error::invalid_response(format!(
                    "expected document in firstBatch, got {other}"
                ))),
            })
            .collect::<crate::error::Result<VecDeque<_>>>()?;
        Ok(Self { ns, id, first_batch })
    }
}

/// The result of a [`DocumentStore::get_more`](crate::store::DocumentStore::get_more)
/// operation.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct GetMoreResult {
    /// The next batch of documents. May be empty for tailable cursors.
    pub batch: VecDeque<Document>,
    /// Whether the server-side cursor has no further documents.
    pub exhausted: bool,
}

impl GetMoreResult {
    pub fn new(batch: impl IntoIterator<Item = Document>, exhausted: bool) -> Self {
        Self {
            batch: batch.into_iter().collect(),
            exhausted,
        }
    }
}
