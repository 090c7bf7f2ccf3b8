//! Chunked file storage and streaming cursors layered on a document database.
//!
//! A file stored with this crate is split into fixed-size chunks kept as separate documents in
//! a `<root>.chunks` collection, alongside a single metadata document in `<root>.files`. A
//! [`GridStore`] opens such a file for reading, truncating or appending and presents it as one
//! byte stream with a seekable head; [`GridStoreStream`] adapts a handle to
//! [`AsyncRead`](futures_io::AsyncRead) and [`AsyncWrite`](futures_io::AsyncWrite).
//!
//! Queries are exposed through [`Cursor`], which buffers batches fetched from the store,
//! retries tailable cursors that have no data yet and can be consumed by pulling documents one
//! at a time or as a [`Stream`](futures_core::Stream).
//!
//! The crate talks to the database through the [`DocumentStore`] trait. [`MemoryStore`] is an
//! in-process implementation; it is what the examples below use.
//!
//! # Example
//!
//! ```rust
//! # use std::sync::Arc;
//! use gridstore::{bson::doc, options::GridStoreOptions, Database, GridStore, MemoryStore};
//!
//! # async fn example() -> gridstore::error::Result<()> {
//! let db = Database::new(Arc::new(MemoryStore::new()), "media");
//!
//! let options = GridStoreOptions::builder()
//!     .content_type("text/plain".to_string())
//!     .metadata(doc! { "owner": "alice" })
//!     .build();
//! let mut file = GridStore::new(&db, "todo.txt", "w", options)?;
//! file.open().await?;
//! file.write(b"water the plants\n", false).await?;
//! file.write(b"call home\n", true).await?;
//!
//! let lines = GridStore::readlines_file(&db, "todo.txt", "\n", None).await?;
//! assert_eq!(lines, vec!["water the plants\n", "call home\n"]);
//!
//! let mut cursor = GridStore::find(&db, doc! { "metadata.owner": "alice" }, None, None);
//! while let Some(file) = cursor.next_object().await? {
//!     println!("{:?}", file.get("filename"));
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Logging
//!
//! Events are emitted through [`tracing`](https://docs.rs/tracing) under the
//! `gridstore::file` and `gridstore::cursor` targets. Opening, closing and unlinking files and
//! closing cursors are logged at the `debug` level; individual chunk loads and saves at the
//! `trace` level. Tailable cursor retries are logged as warnings.

#![allow(
    clippy::unreadable_literal,
    clippy::cognitive_complexity,
    clippy::float_cmp
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod options;

pub use ::bson;

mod bson_util;
mod concern;
mod cursor;
mod db;
pub mod error;
pub mod event;
mod gridfs;
mod index;
pub mod results;
mod serde_util;
mod store;
mod trace;

pub use crate::{
    cursor::{Cursor, CursorStream},
    db::Database,
    gridfs::{
        Chunk,
        ChunkSizeUpdate,
        FileReference,
        FileSelector,
        FilesCollectionDocument,
        GridStore,
        GridStoreStream,
        OpenMode,
        DEFAULT_CHUNK_SIZE,
        DEFAULT_CONTENT_TYPE,
        DEFAULT_ROOT,
    },
    store::{DocumentStore, FailPoint, MemoryStore, Namespace},
};

pub use index::IndexModel;
