use std::{collections::VecDeque, sync::Arc};

use crate::{
    bson::{Bson, Document},
    bson_util::get_int,
    error::{Error, Result},
    store::{DocumentStore, Namespace},
    trace::CURSOR_TRACING_EVENT_TARGET,
};

/// Where a cursor is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CursorState {
    /// No query has been sent yet; the query shape may still be changed.
    Init,
    /// The query has been sent and documents may be flowing.
    Open,
    Closed,
}

/// Static information about the server-side half of a cursor.
#[derive(Clone, Debug)]
pub(crate) struct CursorInformation {
    pub(crate) ns: Namespace,
    pub(crate) id: i64,
    pub(crate) batch_size: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct CursorBuffer {
    docs: VecDeque<Document>,
}

impl CursorBuffer {
    pub(crate) fn new(initial_buffer: VecDeque<Document>) -> Self {
        Self {
            docs: initial_buffer,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.docs.len()
    }

    pub(crate) fn next(&mut self) -> Option<Document> {
        self.docs.pop_front()
    }

    pub(crate) fn extend(&mut self, docs: impl IntoIterator<Item = Document>) {
        self.docs.extend(docs);
    }

    pub(crate) fn clear(&mut self) {
        self.docs.clear();
    }
}

/// Validates a sort document and rewrites its directions to `1` or `-1`.
///
/// Accepts numeric directions, `"asc"`/`"ascending"`/`"desc"`/`"descending"` in any case, and
/// `{ "$meta": ... }` documents, which are kept as given.
pub(crate) fn normalize_sort(sort: &Document) -> Result<Document> {
    let mut normalized = Document::new();
    for (key, direction) in sort {
        let value = match direction {
            Bson::String(s) => match s.to_ascii_lowercase().as_str() {
                "asc" | "ascending" => Bson::Int32(1),
                "desc" | "descending" => Bson::Int32(-1),
                _ => return Err(invalid_sort(key, direction)),
            },
            Bson::Document(meta) if meta.contains_key("$meta") => direction.clone(),
            other => match get_int(other) {
                Some(1) => Bson::Int32(1),
                Some(-1) => Bson::Int32(-1),
                _ => return Err(invalid_sort(key, direction)),
            },
        };
        normalized.insert(key.clone(), value);
    }
    Ok(normalized)
}

fn invalid_sort(key: &str, direction: &Bson) -> Error {
    Error::invalid_argument(format!(
        "invalid sort direction for field {key}: {direction}"
    ))
}

/// Releases a server-side cursor in the background. Used when a cursor is dropped without
/// being closed; does nothing outside of a tokio runtime.
pub(super) fn kill_cursor(store: Arc<dyn DocumentStore>, ns: Namespace, cursor_id: i64) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        tracing::warn!(
            target: CURSOR_TRACING_EVENT_TARGET,
            ns = %ns,
            cursor_id,
            "cursor dropped outside of a runtime; leaking server-side cursor",
        );
        return;
    };
    handle.spawn(async move {
        let _ = store.kill_cursor(&ns, cursor_id).await;
    });
}
