pub mod options;

use std::sync::Arc;

use derive_where::derive_where;

use crate::{
    bson::Document,
    concern::WriteConcern,
    cursor::{Cursor, CursorOptions, CursorSource},
    error::Result,
    store::{DocumentStore, Namespace},
};
use options::DatabaseOptions;

/// `Database` is the client-side abstraction of a database living behind a [`DocumentStore`].
/// It can be used to run commands, open cursors, and is the handle every
/// [`GridStore`](crate::GridStore) operates on.
///
/// `Database` uses [`std::sync::Arc`] internally, so it can safely be shared across threads or
/// async tasks. For example:
///
/// ```rust
/// # use std::sync::Arc;
/// # use gridstore::{Database, MemoryStore};
/// # async fn start_workers() {
/// let db = Database::new(Arc::new(MemoryStore::new()), "items");
///
/// for i in 0..5 {
///     let db_ref = db.clone();
///
///     tokio::task::spawn(async move {
///         let ns = db_ref.namespace(&format!("coll{}", i));
///
///         // Do something with the collection
///     });
/// }
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

#[derive_where(Debug)]
struct DatabaseInner {
    #[derive_where(skip)]
    store: Arc<dyn DocumentStore>,
    name: String,
    write_concern: Option<WriteConcern>,
}

impl Database {
    /// Creates a handle to the database `name` in `store`.
    pub fn new(store: Arc<dyn DocumentStore>, name: &str) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                store,
                name: name.to_string(),
                write_concern: None,
            }),
        }
    }

    /// Creates a handle to the database `name` in `store` with the given options.
    ///
    /// Returns an [`ErrorKind::InvalidConfiguration`](crate::error::ErrorKind) error if the
    /// write concern combines `w: 0` with `journal` or `fsync`.
    pub fn with_options(
        store: Arc<dyn DocumentStore>,
        name: &str,
        options: DatabaseOptions,
    ) -> Result<Self> {
        if let Some(ref write_concern) = options.write_concern {
            write_concern.validate()?;
        }

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                store,
                name: name.to_string(),
                write_concern: options.write_concern.filter(|wc| !wc.is_empty()),
            }),
        })
    }

    /// Gets the name of the `Database`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Gets the write concern of the `Database`.
    pub fn write_concern(&self) -> Option<&WriteConcern> {
        self.inner.write_concern.as_ref()
    }

    pub(crate) fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    /// The namespace of the collection `coll` in this database.
    pub fn namespace(&self, coll: &str) -> Namespace {
        Namespace::new(self.name(), coll)
    }

    /// Creates a cursor over the documents of `coll` matching `filter`. Nothing is sent to the
    /// store until the cursor is first advanced.
    pub fn find(
        &self,
        coll: &str,
        filter: Document,
        options: impl Into<Option<CursorOptions>>,
    ) -> Cursor {
        Cursor::new(
            self.inner.store.clone(),
            self.namespace(coll),
            CursorSource::Find { filter },
            options.into().unwrap_or_default(),
        )
    }

    /// Creates a cursor over the results of an aggregation pipeline run against `coll`.
    pub fn aggregate(
        &self,
        coll: &str,
        pipeline: impl IntoIterator<Item = Document>,
        options: impl Into<Option<CursorOptions>>,
    ) -> Cursor {
        Cursor::new(
            self.inner.store.clone(),
            self.namespace(coll),
            CursorSource::Aggregate {
                pipeline: pipeline.into_iter().collect(),
            },
            options.into().unwrap_or_default(),
        )
    }

    /// Returns the first document of `coll` matching `filter`, if any.
    pub async fn find_one(&self, coll: &str, filter: Document) -> Result<Option<Document>> {
        let options = CursorOptions::builder().limit(-1).build();
        let mut cursor = self.find(coll, filter, options);
        let document = cursor.next_object().await?;
        cursor.close().await?;
        Ok(document)
    }

    /// Runs a database command.
    pub async fn run_command(&self, command: Document) -> Result<Document> {
        self.inner.store.run_command(self.name(), command).await
    }
}
