mod common;
mod options;

use std::{
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_core::Stream;
use futures_util::stream::{BoxStream, StreamExt};

use crate::{
    bson::{doc, Bson, Document},
    bson_util::get_u64,
    error::{Error, ErrorKind, Result},
    event::CursorClosedEvent,
    results::{CursorReply, GetMoreResult},
    store::{DocumentStore, FindOptions, Namespace},
    trace::{TracingRepresentation, CURSOR_TRACING_EVENT_TARGET},
};
use common::{kill_cursor, normalize_sort, CursorBuffer, CursorInformation, CursorState};
pub use options::{CountOptions, CursorOptions};

/// The query a [`Cursor`] iterates the results of.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum CursorSource {
    /// A find query with the given filter.
    Find { filter: Document },

    /// An aggregation pipeline.
    Aggregate { pipeline: Vec<Document> },
}

/// A `Cursor` streams the result of a query. When the cursor is first advanced the query is
/// sent and the `Cursor` receives the first batch of results; the documents are returned as the
/// `Cursor` is iterated. When the batch is exhausted and if there are more results, the `Cursor`
/// fetches the next batch of documents, and so forth until the results are exhausted.
///
/// Documents can be pulled one at a time with [`Cursor::next_object`], handed to a callback
/// with [`Cursor::each`], collected with [`Cursor::to_array`], or pushed through a
/// [`Stream`] with [`Cursor::into_stream`]:
///
/// ```rust
/// # use std::sync::Arc;
/// # use futures_util::stream::TryStreamExt;
/// # use gridstore::{bson::doc, error::Result, Database, MemoryStore};
/// #
/// # async fn do_stuff() -> Result<()> {
/// # let db = Database::new(Arc::new(MemoryStore::new()), "foo");
/// let mut stream = db.find("bar", doc! { "x": 1 }, None).into_stream();
///
/// while let Some(doc) = stream.try_next().await? {
///   println!("{}", doc)
/// }
/// #
/// # Ok(())
/// # }
/// ```
///
/// A tailable cursor (see [`CursorOptions::tailable`]) is not ended by running out of
/// documents. A fetch that comes back empty is retried
/// [`number_of_retries`](CursorOptions::number_of_retries) times, waiting
/// [`tailable_retry_interval`](CursorOptions::tailable_retry_interval) in between, before a
/// [`CursorNotReady`](ErrorKind::CursorNotReady) error is returned.
pub struct Cursor {
    store: Arc<dyn DocumentStore>,
    source: CursorSource,
    options: CursorOptions,
    info: CursorInformation,
    state: CursorState,
    buffer: CursorBuffer,
    /// Set once the results are exhausted or the server-side cursor is gone.
    dead: bool,
    /// Whether the end of the results has been reported to the caller.
    end_reported: bool,
    documents_returned: u64,
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("source", &self.source)
            .field("info", &self.info)
            .field("state", &self.state)
            .field("buffered", &self.buffer.len())
            .field("dead", &self.dead)
            .finish()
    }
}

impl Cursor {
    pub(crate) fn new(
        store: Arc<dyn DocumentStore>,
        ns: Namespace,
        source: CursorSource,
        options: CursorOptions,
    ) -> Self {
        let batch_size = options.batch_size;
        Self {
            store,
            source,
            options,
            info: CursorInformation {
                ns,
                id: 0,
                batch_size,
            },
            state: CursorState::Init,
            buffer: CursorBuffer::default(),
            dead: false,
            end_reported: false,
            documents_returned: 0,
        }
    }

    /// The namespace this cursor iterates.
    pub fn namespace(&self) -> &Namespace {
        &self.info.ns
    }

    /// The id of the server-side cursor. 0 before the first fetch and after exhaustion.
    pub fn id(&self) -> i64 {
        self.info.id
    }

    /// Whether this cursor has been closed.
    pub fn is_closed(&self) -> bool {
        self.state == CursorState::Closed
    }

    /// Whether this cursor can produce no further documents, either because it was closed or
    /// because its results are exhausted.
    pub fn is_dead(&self) -> bool {
        self.dead || self.is_closed()
    }

    pub fn is_tailable(&self) -> bool {
        self.options.is_tailable()
    }

    /// Returns the next document, `None` once when the results are exhausted, and a
    /// [`CursorClosed`](ErrorKind::CursorClosed) error on any call after that or after
    /// [`close`](Cursor::close).
    pub async fn next_object(&mut self) -> Result<Option<Document>> {
        if self.state == CursorState::Closed || (self.dead && self.end_reported) {
            return Err(ErrorKind::CursorClosed.into());
        }
        if self.state == CursorState::Init {
            self.initialize().await?;
        }

        loop {
            if let Some(doc) = self.buffer.next() {
                self.documents_returned += 1;
                return Ok(Some(doc));
            }
            if self.dead || self.info.id == 0 {
                self.dead = true;
                self.end_reported = true;
                return Ok(None);
            }
            self.get_more().await?;
        }
    }

    /// Calls `callback` with each document in arrival order, then once more with `None`.
    ///
    /// Documents already buffered are handed out before another batch is requested.
    pub async fn each<F>(&mut self, mut callback: F) -> Result<()>
    where
        F: FnMut(Option<Document>),
    {
        loop {
            let Some(doc) = self.next_object().await? else {
                callback(None);
                return Ok(());
            };
            callback(Some(doc));

            while let Some(doc) = self.buffer.next() {
                self.documents_returned += 1;
                callback(Some(doc));
            }
        }
    }

    /// Collects every remaining document in order and closes the cursor.
    ///
    /// Returns an [`Unsupported`](ErrorKind::Unsupported) error for tailable cursors, whose
    /// results have no end.
    pub async fn to_array(&mut self) -> Result<Vec<Document>> {
        if self.is_tailable() {
            return Err(Error::unsupported(
                "to_array is not supported on tailable cursors",
            ));
        }

        let mut docs = Vec::new();
        while let Some(doc) = self.next_object().await? {
            docs.push(doc);
            while let Some(doc) = self.buffer.next() {
                self.documents_returned += 1;
                docs.push(doc);
            }
        }
        self.close().await?;
        Ok(docs)
    }

    /// Sets the maximum number of documents to return.
    pub fn limit(&mut self, limit: i64) -> Result<&mut Self> {
        self.check_query_shape_mutable("limit")?;
        self.options.limit = Some(limit);
        Ok(self)
    }

    /// Sets the number of documents to skip.
    pub fn skip(&mut self, skip: u64) -> Result<&mut Self> {
        self.check_query_shape_mutable("skip")?;
        self.options.skip = Some(skip);
        Ok(self)
    }

    /// Sets the number of documents the store returns per batch.
    pub fn batch_size(&mut self, batch_size: u32) -> Result<&mut Self> {
        self.check_query_shape_mutable("batch_size")?;
        self.options.batch_size = Some(batch_size);
        self.info.batch_size = Some(batch_size);
        Ok(self)
    }

    /// Sets the sort order. The sort document is validated when the query is sent.
    pub fn sort(&mut self, sort: Document) -> Result<&mut Self> {
        self.check_query_shape_mutable("sort")?;
        self.options.sort = Some(sort);
        Ok(self)
    }

    fn check_query_shape_mutable(&self, name: &str) -> Result<()> {
        if self.is_tailable() {
            return Err(Error::unsupported(format!(
                "{name} cannot be changed on a tailable cursor"
            )));
        }
        match self.state {
            CursorState::Init => Ok(()),
            CursorState::Closed => Err(ErrorKind::CursorClosed.into()),
            CursorState::Open => Err(Error::invalid_argument(format!(
                "{name} cannot be changed after the cursor has started returning documents"
            ))),
        }
    }

    /// Counts the documents matching this cursor's filter with a separate `count` command.
    ///
    /// When `apply_skip_limit` is set the cursor's own skip and limit are applied to the
    /// count. Values in `options` take precedence. Only find-based cursors can be counted.
    pub async fn count(
        &self,
        apply_skip_limit: bool,
        options: impl Into<Option<CountOptions>>,
    ) -> Result<u64> {
        let CursorSource::Find { ref filter } = self.source else {
            return Err(Error::unsupported(
                "count is only supported on cursors created by a find",
            ));
        };

        let mut command = doc! {
            "count": self.info.ns.coll.clone(),
            "query": filter.clone(),
        };
        if apply_skip_limit {
            if let Some(skip) = self.options.skip {
                command.insert("skip", skip as i64);
            }
            if let Some(limit) = self.options.limit {
                command.insert("limit", limit);
            }
        }
        if let Some(options) = options.into() {
            command.extend(crate::bson::to_document(&options)?);
        }

        let reply = self.store.run_command(&self.info.ns.db, command).await?;
        reply
            .get("n")
            .and_then(get_u64)
            .ok_or_else(|| Error::invalid_response("count reply is missing n"))
    }

    /// Returns the plan the store would use to run this cursor's query.
    ///
    /// The plan is fetched with a separate single-batch query, so the cursor itself is left
    /// untouched.
    pub async fn explain(&self) -> Result<Document> {
        let CursorSource::Find { ref filter } = self.source else {
            return Err(Error::unsupported(
                "explain is only supported on cursors created by a find",
            ));
        };

        let mut options = self.find_options()?;
        options.limit = Some(-1);
        options.explain = Some(true);
        options.tailable = None;

        let reply = self
            .store
            .find(&self.info.ns, filter.clone(), options)
            .await?;
        reply
            .first_batch
            .into_iter()
            .next()
            .ok_or_else(|| Error::invalid_response("explain returned no plan"))
    }

    /// Closes the cursor, releasing the server-side cursor and notifying the close handler.
    /// Closing an already-closed cursor does nothing.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == CursorState::Closed {
            return Ok(());
        }

        let cursor_id = self.info.id;
        self.state = CursorState::Closed;
        self.dead = true;
        self.info.id = 0;
        self.buffer.clear();

        let result = if cursor_id != 0 {
            self.store.kill_cursor(&self.info.ns, cursor_id).await
        } else {
            Ok(())
        };

        tracing::debug!(
            target: CURSOR_TRACING_EVENT_TARGET,
            ns = %self.info.ns,
            cursor_id,
            documents_returned = self.documents_returned,
            "cursor closed",
        );
        if let Some(ref handler) = self.options.close_event_handler {
            handler.handle(CursorClosedEvent {
                ns: self.info.ns.clone(),
                cursor_id,
                documents_returned: self.documents_returned,
            });
        }

        result
    }

    /// Turns the cursor into a [`Stream`] of documents. The stream ends when the results are
    /// exhausted; an error is yielded once and ends the stream. The cursor is closed in both
    /// cases.
    pub fn into_stream(self) -> CursorStream<Document> {
        self.into_stream_with_transform(|doc| doc)
    }

    /// Like [`into_stream`](Cursor::into_stream), but applies `transform` to every document
    /// before it is yielded.
    pub fn into_stream_with_transform<T, F>(self, transform: F) -> CursorStream<T>
    where
        T: Send + 'static,
        F: FnMut(Document) -> T + Send + 'static,
    {
        let inner = futures_util::stream::unfold(Some((self, transform)), |state| async move {
            let (mut cursor, mut transform) = state?;
            match cursor.next_object().await {
                Ok(Some(doc)) => Some((Ok(transform(doc)), Some((cursor, transform)))),
                Ok(None) => {
                    let _ = cursor.close().await;
                    None
                }
                Err(error) => {
                    let _ = cursor.close().await;
                    Some((Err(error), None))
                }
            }
        })
        .boxed();
        CursorStream { inner }
    }

    fn find_options(&self) -> Result<FindOptions> {
        let sort = match self.options.sort {
            Some(ref sort) => Some(normalize_sort(sort)?),
            None => None,
        };
        Ok(FindOptions::builder()
            .batch_size(self.options.batch_size)
            .limit(self.options.limit)
            .skip(self.options.skip)
            .sort(sort)
            .projection(self.options.projection.clone())
            .tailable(self.options.tailable)
            .max_time(self.options.max_time)
            .build())
    }

    /// Sends the query and buffers its first batch.
    async fn initialize(&mut self) -> Result<()> {
        let reply = match self.source {
            CursorSource::Find { ref filter } => {
                let options = self.find_options()?;
                self.store
                    .find(&self.info.ns, filter.clone(), options)
                    .await?
            }
            CursorSource::Aggregate { ref pipeline } => {
                let mut stages = pipeline.clone();
                if let Some(ref sort) = self.options.sort {
                    stages.push(doc! { "$sort": normalize_sort(sort)? });
                }
                if let Some(skip) = self.options.skip {
                    stages.push(doc! { "$skip": skip as i64 });
                }
                if let Some(limit) = self.options.limit.filter(|limit| *limit != 0) {
                    stages.push(doc! { "$limit": limit.abs() });
                }
                let mut cursor = Document::new();
                if let Some(batch_size) = self.options.batch_size {
                    cursor.insert("batchSize", batch_size as i64);
                }
                let command = doc! {
                    "aggregate": self.info.ns.coll.clone(),
                    "pipeline": stages.into_iter().map(Bson::Document).collect::<Vec<_>>(),
                    "cursor": cursor,
                };
                let reply = self.store.run_command(&self.info.ns.db, command).await?;
                CursorReply::from_command_reply(&reply)?
            }
        };

        tracing::debug!(
            target: CURSOR_TRACING_EVENT_TARGET,
            ns = %reply.ns,
            cursor_id = reply.id,
            first_batch = reply.first_batch.len(),
            "cursor opened",
        );
        self.info.ns = reply.ns;
        self.info.id = reply.id;
        self.buffer = CursorBuffer::new(reply.first_batch);
        self.state = CursorState::Open;
        Ok(())
    }

    /// Fetches the next batch. Tailable cursors retry empty batches and not-ready errors.
    async fn get_more(&mut self) -> Result<()> {
        let tailable = self.is_tailable();
        let mut retries = 0;
        loop {
            let result = self
                .store
                .get_more(&self.info.ns, self.info.id, self.info.batch_size)
                .await;

            let transient = match result {
                Ok(ref get_more) => tailable && get_more.batch.is_empty() && !get_more.exhausted,
                Err(ref e) => tailable && e.is_tailable_retry(),
            };
            if !transient {
                return self.handle_get_more_result(result);
            }

            if retries >= self.options.number_of_retries() {
                return Err(match result {
                    Err(e) => e,
                    Ok(_) => ErrorKind::CursorNotReady.into(),
                });
            }
            retries += 1;
            tracing::warn!(
                target: CURSOR_TRACING_EVENT_TARGET,
                ns = %self.info.ns,
                cursor_id = self.info.id,
                attempt = retries,
                "tailable cursor has no documents yet, retrying",
            );
            tokio::time::sleep(self.options.tailable_retry_interval()).await;
        }
    }

    fn handle_get_more_result(&mut self, result: Result<GetMoreResult>) -> Result<()> {
        match result {
            Ok(get_more) => {
                tracing::trace!(
                    target: CURSOR_TRACING_EVENT_TARGET,
                    ns = %self.info.ns,
                    cursor_id = self.info.id,
                    batch = get_more.batch.len(),
                    exhausted = get_more.exhausted,
                    "fetched batch",
                );
                if get_more.exhausted {
                    self.info.id = 0;
                }
                self.buffer.extend(get_more.batch);
                Ok(())
            }
            Err(e) => {
                if e.is_cursor_dead() {
                    self.info.id = 0;
                    self.dead = true;
                    self.end_reported = true;
                }
                tracing::debug!(
                    target: CURSOR_TRACING_EVENT_TARGET,
                    ns = %self.info.ns,
                    error = e.tracing_representation(),
                    "fetching batch failed",
                );
                Err(e)
            }
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.state == CursorState::Closed || self.info.id == 0 {
            return;
        }
        kill_cursor(self.store.clone(), self.info.ns.clone(), self.info.id);
    }
}

/// A [`Stream`] over the documents of a [`Cursor`], created by [`Cursor::into_stream`].
pub struct CursorStream<T> {
    inner: BoxStream<'static, Result<T>>,
}

impl<T> fmt::Debug for CursorStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorStream").finish()
    }
}

impl<T> Stream for CursorStream<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}
