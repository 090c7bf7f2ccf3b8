//! Contains the events emitted by cursors and the handlers that receive them.

use std::sync::Arc;

use futures_core::future::BoxFuture;

use crate::store::Namespace;

/// A destination for events. Allows implicit conversion via [`From`] for concrete types for
/// convenience with [`crate::cursor::CursorOptions`] construction:
///
/// ```rust
/// # use gridstore::options::CursorOptions;
/// # fn example() {
/// let (tx, mut rx) = tokio::sync::mpsc::channel(100);
/// tokio::spawn(async move {
///     while let Some(ev) = rx.recv().await {
///         println!("{:?}", ev);
///     }
/// });
/// let options = CursorOptions::builder()
///                 .close_event_handler(tx)
///                 .build();
/// # }
/// ```
///
/// or explicit construction for `Fn` traits:
///
/// ```rust
/// # use gridstore::options::CursorOptions;
/// # use gridstore::event::EventHandler;
/// # fn example() {
/// let options = CursorOptions::builder()
///                 .close_event_handler(EventHandler::callback(|ev| println!("{:?}", ev)))
///                 .build();
/// # }
/// ```
#[derive(Clone)]
#[non_exhaustive]
pub enum EventHandler<T> {
    /// A callback.
    Callback(Arc<dyn Fn(T) + Sync + Send>),
    /// An async callback.
    AsyncCallback(Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Sync + Send>),
    /// A `tokio` channel sender.
    TokioMpsc(tokio::sync::mpsc::Sender<T>),
}

impl<T> std::fmt::Debug for EventHandler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EventHandler").finish()
    }
}

impl<T> From<tokio::sync::mpsc::Sender<T>> for EventHandler<T> {
    fn from(value: tokio::sync::mpsc::Sender<T>) -> Self {
        Self::TokioMpsc(value)
    }
}

impl<T: Send + Sync + 'static> EventHandler<T> {
    /// Construct a new event handler with a callback.
    pub fn callback(f: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self::Callback(Arc::new(f))
    }

    /// Construct a new event handler with an async callback.
    pub fn async_callback(f: impl Fn(T) -> BoxFuture<'static, ()> + Send + Sync + 'static) -> Self {
        Self::AsyncCallback(Arc::new(f))
    }

    pub(crate) fn handle(&self, event: T) {
        match self {
            Self::Callback(cb) => (cb)(event),
            Self::AsyncCallback(cb) => {
                tokio::spawn((cb)(event));
            }
            Self::TokioMpsc(sender) => {
                let sender = sender.clone();
                tokio::spawn(async move {
                    let _ = sender.send(event).await;
                });
            }
        }
    }
}

/// Published when a [`Cursor`](crate::cursor::Cursor) transitions to the closed state.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct CursorClosedEvent {
    /// The namespace the cursor iterated.
    pub ns: Namespace,

    /// The server-side cursor id at the time of closing. 0 if the server had already exhausted
    /// the cursor.
    pub cursor_id: i64,

    /// The number of documents the cursor handed out before it was closed.
    pub documents_returned: u64,
}
