//! The document store this crate is layered on.
//!
//! Chunked files and cursors only ever talk to the database through [`DocumentStore`]. Wire
//! protocol, connection pooling and authentication live behind it; [`MemoryStore`] is an
//! in-process implementation suitable for tests and embedding.

mod memory;
#[cfg(test)]
mod test;

use std::{fmt, time::Duration};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

pub use memory::{FailPoint, MemoryStore};

use crate::{
    bson::{Bson, Document},
    concern::WriteConcern,
    error::Result,
    index::IndexModel,
    results::{CursorReply, DeleteResult, GetMoreResult, InsertOneResult, UpdateResult},
};

/// A struct modeling the canonical name for a collection in the document store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    /// The name of the database associated with this namespace.
    pub db: String,

    /// The name of the collection this namespace corresponds to.
    pub coll: String,
}

impl Namespace {
    /// Construct a `Namespace` with the given database and collection.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    pub(crate) fn from_str(s: &str) -> Option<Self> {
        let mut parts = s.split('.');

        let db = parts.next();
        let coll = parts.collect::<Vec<_>>().join(".");

        match (db, coll) {
            (Some(db), coll) if !coll.is_empty() => Some(Self {
                db: db.to_string(),
                coll,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}.{}", self.db, self.coll)
    }
}

/// The shape of a find query as sent to the store.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Deserialize, Serialize, TypedBuilder, PartialEq)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct FindOptions {
    /// The number of documents the store should return per batch.
    pub batch_size: Option<u32>,

    /// The maximum number of documents to return. A negative value asks for a single batch of
    /// at most `-limit` documents after which the server-side cursor is closed.
    pub limit: Option<i64>,

    /// The number of documents to skip before returning.
    pub skip: Option<u64>,

    /// The order in which to return matching documents.
    pub sort: Option<Document>,

    /// Limits the fields of the document being returned.
    pub projection: Option<Document>,

    /// Keep the cursor open after the last document so that documents inserted later can be
    /// returned by subsequent fetches.
    pub tailable: Option<bool>,

    /// Return the query plan instead of the matching documents.
    pub explain: Option<bool>,

    /// The maximum amount of time the store may spend on the query.
    #[serde(skip)]
    pub max_time: Option<Duration>,
}

/// The document-collection API consumed by this crate.
///
/// Every method is a single round trip. Mutating methods receive the caller's write concern,
/// which an implementation either honors or rejects.
pub trait DocumentStore: Send + Sync {
    /// Runs a query and returns its first batch along with a server-side cursor id.
    fn find<'a>(
        &'a self,
        ns: &'a Namespace,
        filter: Document,
        options: FindOptions,
    ) -> BoxFuture<'a, Result<CursorReply>>;

    /// Fetches the next batch of an open server-side cursor.
    fn get_more<'a>(
        &'a self,
        ns: &'a Namespace,
        cursor_id: i64,
        batch_size: Option<u32>,
    ) -> BoxFuture<'a, Result<GetMoreResult>>;

    /// Releases a server-side cursor.
    fn kill_cursor<'a>(&'a self, ns: &'a Namespace, cursor_id: i64) -> BoxFuture<'a, Result<()>>;

    /// Inserts a single document, generating an `_id` if it has none.
    fn insert_one<'a>(
        &'a self,
        ns: &'a Namespace,
        document: Document,
        write_concern: Option<&'a WriteConcern>,
    ) -> BoxFuture<'a, Result<InsertOneResult>>;

    /// Replaces the first document matching `filter`, inserting `replacement` instead when
    /// nothing matches and `upsert` is set.
    fn replace_one<'a>(
        &'a self,
        ns: &'a Namespace,
        filter: Document,
        replacement: Document,
        upsert: bool,
        write_concern: Option<&'a WriteConcern>,
    ) -> BoxFuture<'a, Result<UpdateResult>>;

    /// Applies an update document (`$set`, `$unset`) to the first document matching `filter`.
    fn update_one<'a>(
        &'a self,
        ns: &'a Namespace,
        filter: Document,
        update: Document,
        write_concern: Option<&'a WriteConcern>,
    ) -> BoxFuture<'a, Result<UpdateResult>>;

    /// Removes every document matching `filter`.
    fn delete_many<'a>(
        &'a self,
        ns: &'a Namespace,
        filter: Document,
        write_concern: Option<&'a WriteConcern>,
    ) -> BoxFuture<'a, Result<DeleteResult>>;

    /// Creates an index. Creating an index that already exists is not an error.
    fn create_index<'a>(
        &'a self,
        ns: &'a Namespace,
        index: IndexModel,
        write_concern: Option<&'a WriteConcern>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Lists the indexes of a collection. A missing collection has no indexes.
    fn list_indexes<'a>(&'a self, ns: &'a Namespace) -> BoxFuture<'a, Result<Vec<IndexModel>>>;

    /// Drops a collection along with its indexes.
    fn drop_collection<'a>(
        &'a self,
        ns: &'a Namespace,
        write_concern: Option<&'a WriteConcern>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Runs a database command such as `count`, `aggregate` or `filemd5`.
    fn run_command<'a>(&'a self, db: &'a str, command: Document)
        -> BoxFuture<'a, Result<Document>>;
}

/// Pulls `_id` out of a filter of the form `{ "_id": <value> }`.
pub(crate) fn id_from_filter(filter: &Document) -> Option<Bson> {
    match filter.get("_id") {
        Some(Bson::Document(inner)) if crate::bson_util::first_key(inner)
            .is_some_and(|key| key.starts_with('$')) =>
        {
            None
        }
        Some(value) => Some(value.clone()),
        None => None,
    }
}
