use std::{
    pin::Pin,
    task::{ready, Context, Poll},
};

use futures_util::{
    future::{BoxFuture, FutureExt},
    io::{AsyncWrite, AsyncWriteExt},
};

use super::{GridStore, HandleState};
use crate::error::{Error, GridFsErrorKind, Result};

type HandleFuture = BoxFuture<'static, (Box<GridStore>, Result<Outcome>)>;

enum Operation {
    Open,
    Read(u64),
    Write(Vec<u8>),
    Close,
}

enum Outcome {
    Opened,
    Read(Vec<u8>),
    Wrote,
    Closed,
}

enum State {
    // The handle is stored as an option so that it can be moved into a future without
    // requiring ownership of the state.
    Idle(Option<Box<GridStore>>),
    Opening(HandleFuture),
    Streaming(Option<Box<GridStore>>),
    Reading(HandleFuture),
    Writing(HandleFuture),
    Closing(HandleFuture),
    Ended(Option<Box<GridStore>>),
}

impl State {
    fn handle_future(&mut self) -> Option<&mut HandleFuture> {
        match self {
            Self::Opening(future)
            | Self::Reading(future)
            | Self::Writing(future)
            | Self::Closing(future) => Some(future),
            Self::Idle(_) | Self::Streaming(_) | Self::Ended(_) => None,
        }
    }
}

/// A [`GridStore`] exposed as an [`AsyncRead`](futures_io::AsyncRead) +
/// [`AsyncWrite`](futures_io::AsyncWrite) stream.
///
/// The file is opened on the first read or write. Reads return at most one chunk's worth of
/// bytes at a time and return 0 at the end of the file. Closing the stream closes the file; a
/// stream that is closed without being used opens the file and closes it immediately, which
/// creates an empty file in write modes.
///
/// ```rust
/// # use std::sync::Arc;
/// # use futures_util::io::{AsyncReadExt, AsyncWriteExt};
/// # use gridstore::{error::Result, Database, GridStore, MemoryStore};
/// # async fn example() -> Result<()> {
/// let db = Database::new(Arc::new(MemoryStore::new()), "files");
///
/// let mut upload = GridStore::new(&db, "notes.txt", "w", None)?.into_stream();
/// upload.write_all(b"buy milk").await?;
/// upload.close().await?;
///
/// let mut download = GridStore::new(&db, "notes.txt", "r", None)?.into_stream();
/// let mut contents = String::new();
/// download.read_to_string(&mut contents).await?;
/// assert_eq!(contents, "buy milk");
/// # Ok(())
/// # }
/// ```
pub struct GridStoreStream {
    state: State,
    // Bytes read from the file that did not fit in the caller's buffer.
    read_buffer: Vec<u8>,
}

impl GridStoreStream {
    pub(super) fn new(handle: GridStore) -> Self {
        let handle = Some(Box::new(handle));
        let state = match handle.as_ref().map(|handle| handle.state) {
            Some(HandleState::Unopened) => State::Idle(handle),
            _ => State::Streaming(handle),
        };
        Self {
            state,
            read_buffer: Vec::new(),
        }
    }

    /// Writes `data`, if any, and then closes the stream. The file is closed even if the
    /// final write fails.
    pub async fn end(&mut self, data: Option<&[u8]>) -> Result<()> {
        let written = match data {
            Some(data) => self.write_all(data).await,
            None => Ok(()),
        };
        let closed = self.close().await;
        written.map_err(Error::from_futures_io_error)?;
        closed.map_err(Error::from_futures_io_error)
    }

    /// Copies the rest of the file into `destination` and closes this stream. `destination`
    /// is flushed but left open. Returns the number of bytes copied.
    pub async fn copy_to<W>(&mut self, destination: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let copied = futures_util::io::copy(&mut *self, destination).await;
        let closed = self.close().await;
        let copied = copied.map_err(Error::from_futures_io_error)?;
        closed.map_err(Error::from_futures_io_error)?;
        Ok(copied)
    }

    /// Whether the stream has been closed.
    pub fn is_ended(&self) -> bool {
        matches!(self.state, State::Ended(_))
    }

    /// Returns the underlying file handle, or `None` while an operation is in progress.
    pub fn into_inner(self) -> Option<GridStore> {
        match self.state {
            State::Idle(handle) | State::Streaming(handle) | State::Ended(handle) => {
                handle.map(|handle| *handle)
            }
            _ => None,
        }
    }

    fn take_handle(slot: &mut Option<Box<GridStore>>) -> Result<Box<GridStore>> {
        slot.take()
            .ok_or_else(|| Error::internal("file handle missing from stream state"))
    }

    /// Starts `operation` on the handle held by the current state.
    fn start(&mut self, operation: Operation) -> Result<()> {
        let handle = match self.state {
            State::Idle(ref mut slot) | State::Streaming(ref mut slot) => Self::take_handle(slot)?,
            _ => return Err(Error::internal("stream is busy")),
        };
        let in_progress: fn(HandleFuture) -> State = match operation {
            Operation::Open => State::Opening,
            Operation::Read(_) => State::Reading,
            Operation::Write(_) => State::Writing,
            Operation::Close => State::Closing,
        };
        self.state = in_progress(run(handle, operation).boxed());
        Ok(())
    }

    /// Polls the operation in progress, if any, to completion and moves to the state that
    /// follows it. Bytes from a completed read are appended to the read buffer.
    fn poll_operation(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let Some(future) = self.state.handle_future() else {
            return Poll::Ready(Ok(()));
        };
        let (handle, result) = ready!(future.poll_unpin(cx));

        let handle = Some(handle);
        self.state = match result {
            Ok(Outcome::Closed) => State::Ended(handle),
            _ => match handle.as_ref().map(|handle| handle.state) {
                Some(HandleState::Unopened) => State::Idle(handle),
                _ => State::Streaming(handle),
            },
        };

        Poll::Ready(result.map(|outcome| {
            if let Outcome::Read(bytes) = outcome {
                self.read_buffer.extend_from_slice(&bytes);
            }
        }))
    }
}

async fn run(
    mut handle: Box<GridStore>,
    operation: Operation,
) -> (Box<GridStore>, Result<Outcome>) {
    let result = match operation {
        Operation::Open => handle.open().await.map(|()| Outcome::Opened),
        Operation::Read(length) => handle.read(Some(length)).await.map(Outcome::Read),
        Operation::Write(data) => handle.write(&data, false).await.map(|()| Outcome::Wrote),
        Operation::Close => close(&mut handle).await.map(|()| Outcome::Closed),
    };
    (handle, result)
}

async fn close(handle: &mut GridStore) -> Result<()> {
    if handle.state == HandleState::Unopened {
        handle.open().await?;
    }
    handle.close().await
}

impl futures_io::AsyncRead for GridStoreStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::result::Result<usize, futures_io::Error>> {
        let stream = self.get_mut();

        loop {
            if !stream.read_buffer.is_empty() {
                let n = buf.len().min(stream.read_buffer.len());
                buf[..n].copy_from_slice(&stream.read_buffer[..n]);
                stream.read_buffer.drain(..n);
                return Poll::Ready(Ok(n));
            }

            let result = match stream.state {
                State::Idle(_) => stream.start(Operation::Open),
                State::Streaming(ref handle) => {
                    let to_read = match handle {
                        Some(handle) => {
                            let remaining = handle.length().saturating_sub(handle.tell());
                            remaining
                                .min(u64::from(handle.chunk_size()))
                                .min(buf.len() as u64)
                        }
                        None => 0,
                    };
                    if to_read == 0 {
                        return Poll::Ready(Ok(0));
                    }
                    stream.start(Operation::Read(to_read))
                }
                State::Ended(_) => return Poll::Ready(Ok(0)),
                _ => ready!(stream.poll_operation(cx)),
            };
            if let Err(error) = result {
                return Poll::Ready(Err(error.into_futures_io_error()));
            }
        }
    }
}

impl futures_io::AsyncWrite for GridStoreStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::result::Result<usize, futures_io::Error>> {
        let stream = self.get_mut();

        loop {
            let result = match stream.state {
                State::Idle(_) => stream.start(Operation::Open),
                State::Streaming(_) => stream.start(Operation::Write(buf.to_vec())),
                State::Writing(_) => {
                    return match ready!(stream.poll_operation(cx)) {
                        Ok(()) => Poll::Ready(Ok(buf.len())),
                        Err(error) => Poll::Ready(Err(error.into_futures_io_error())),
                    };
                }
                State::Ended(_) => Err(GridFsErrorKind::StreamEnded.into()),
                _ => ready!(stream.poll_operation(cx)),
            };
            if let Err(error) = result {
                return Poll::Ready(Err(error.into_futures_io_error()));
            }
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), futures_io::Error>> {
        // Chunks are stored as they fill up; only a write in progress needs to finish.
        let stream = self.get_mut();
        match ready!(stream.poll_operation(cx)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(error) => Poll::Ready(Err(error.into_futures_io_error())),
        }
    }

    fn poll_close(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), futures_io::Error>> {
        let stream = self.get_mut();

        loop {
            let result = match stream.state {
                State::Idle(_) | State::Streaming(_) => stream.start(Operation::Close),
                State::Closing(_) => {
                    return match ready!(stream.poll_operation(cx)) {
                        Ok(()) => Poll::Ready(Ok(())),
                        Err(error) => {
                            // The file could not be closed; the stream cannot be used further.
                            if let State::Idle(ref mut slot) | State::Streaming(ref mut slot) =
                                stream.state
                            {
                                stream.state = State::Ended(slot.take());
                            }
                            Poll::Ready(Err(error.into_futures_io_error()))
                        }
                    };
                }
                State::Ended(_) => return Poll::Ready(Ok(())),
                _ => ready!(stream.poll_operation(cx)),
            };
            if let Err(error) = result {
                return Poll::Ready(Err(error.into_futures_io_error()));
            }
        }
    }
}
