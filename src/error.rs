//! Contains the `Error` and `Result` types that `gridstore` uses.

use std::{
    collections::HashSet,
    fmt::{self, Debug},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bson::Bson;

/// Label attached to errors that the tailable cursor treats as transient.
pub const TRANSIENT_TAILABLE_ERROR: &str = "TransientTailableError";

/// The result type for all methods that can return an error in the `gridstore` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `gridstore` crate. The inner [`ErrorKind`] is wrapped in a
/// `Box` to keep the error small.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,

    labels: HashSet<String>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        Self {
            kind: Box::new(kind),
            labels: labels
                .map(|labels| labels.into_iter().collect())
                .unwrap_or_default(),
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Error {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn unsupported(message: impl Into<String>) -> Error {
        ErrorKind::Unsupported {
            message: message.into(),
        }
        .into()
    }

    /// Returns the labels for this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels.contains(label.as_ref())
    }

    /// Returns a copy of this Error with the specified label added.
    pub fn with_label<T: AsRef<str>>(mut self, label: T) -> Self {
        self.labels.insert(label.as_ref().to_string());
        self
    }

    /// Whether a tailable cursor should wait and fetch again after this error.
    pub(crate) fn is_tailable_retry(&self) -> bool {
        matches!(*self.kind, ErrorKind::CursorNotReady)
            || self.contains_label(TRANSIENT_TAILABLE_ERROR)
    }

    /// Whether this error means the server-side cursor is gone for good.
    pub(crate) fn is_cursor_dead(&self) -> bool {
        match *self.kind {
            ErrorKind::Io(..) | ErrorKind::CursorClosed => true,
            // CursorNotFound and CursorKilled
            ErrorKind::Command(ref err) => err.code == 43 || err.code == 237,
            _ => false,
        }
    }

    /// The server code of this error, if it came from a command.
    pub fn code(&self) -> Option<i32> {
        match *self.kind {
            ErrorKind::Command(ref err) => Some(err.code),
            _ => None,
        }
    }

    pub(crate) fn into_futures_io_error(self) -> futures_io::Error {
        match *self.kind {
            ErrorKind::Io(ref io_error) => futures_io::Error::new(io_error.kind(), self.clone()),
            _ => futures_io::Error::other(self),
        }
    }

    /// Recovers an error previously converted with `into_futures_io_error`, wrapping any other
    /// I/O error.
    pub(crate) fn from_futures_io_error(err: futures_io::Error) -> Self {
        if let Some(inner) = err.get_ref().and_then(|e| e.downcast_ref::<Error>()) {
            return inner.clone();
        }
        err.into()
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into(), None::<Option<String>>)
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        Self::BsonDeserialization(err)
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        Self::BsonSerialization(err)
    }
}

impl From<bson::document::ValueAccessError> for ErrorKind {
    fn from(err: bson::document::ValueAccessError) -> Self {
        Self::InvalidResponse {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

impl From<CommandError> for ErrorKind {
    fn from(err: CommandError) -> Self {
        Self::Command(err)
    }
}

impl From<GridFsErrorKind> for ErrorKind {
    fn from(err: GridFsErrorKind) -> Self {
        Self::GridFs(err)
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// A configuration value was rejected when it was constructed, e.g. a write concern that
    /// asks for no acknowledgement and a journal or fsync at the same time.
    #[error("Invalid configuration: {message}")]
    #[non_exhaustive]
    InvalidConfiguration { message: String },

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(bson::de::Error),

    /// Wrapper around `bson::ser::Error`.
    #[error("{0}")]
    BsonSerialization(bson::ser::Error),

    /// The document store returned an error when running a command.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// A chunked file error occurred.
    #[error("{0}")]
    GridFs(GridFsErrorKind),

    /// An operation was attempted on a cursor that has been closed or whose server-side
    /// resource is gone.
    #[error("Cursor is closed")]
    CursorClosed,

    /// A tailable cursor found no new documents. This is expected while following a growing
    /// collection and is retried by the cursor.
    #[error("Tailable cursor has no new documents yet")]
    CursorNotReady,

    /// The operation is incompatible with the mode of the object it was called on.
    #[error("Unsupported operation: {message}")]
    #[non_exhaustive]
    Unsupported { message: String },

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// The document store returned an invalid reply.
    #[error("The document store returned an invalid reply: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// Wrapper around [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Several independent operations failed.
    #[error("{} operations failed: {errors:?}", .errors.len())]
    #[non_exhaustive]
    Multiple { errors: Vec<Error> },
}

impl ErrorKind {
    /// Gets the name of this error kind.
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument { .. } => "InvalidArgument",
            ErrorKind::InvalidConfiguration { .. } => "InvalidConfiguration",
            ErrorKind::BsonDeserialization(..) => "BsonDeserialization",
            ErrorKind::BsonSerialization(..) => "BsonSerialization",
            ErrorKind::Command(..) => "Command",
            ErrorKind::GridFs(..) => "GridFs",
            ErrorKind::CursorClosed => "CursorClosed",
            ErrorKind::CursorNotReady => "CursorNotReady",
            ErrorKind::Unsupported { .. } => "Unsupported",
            ErrorKind::Internal { .. } => "Internal",
            ErrorKind::InvalidResponse { .. } => "InvalidResponse",
            ErrorKind::Io(..) => "Io",
            ErrorKind::Multiple { .. } => "Multiple",
        }
    }
}

/// An error that occurred due to a document store command failing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,
}

impl CommandError {
    pub fn new(code: i32, code_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            code_name: code_name.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Error code {} ({}): {}", self.code, self.code_name, self.message)
    }
}

/// An error that occurred while working with a chunked file.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum GridFsErrorKind {
    /// The open mode is not one of `r`, `w` or `w+`, or the operation is not valid in the
    /// handle's current mode.
    #[error("Illegal mode {mode}")]
    #[non_exhaustive]
    InvalidMode { mode: String },

    /// The file with the given identifier was not found.
    #[error("File {identifier} does not exist")]
    #[non_exhaustive]
    FileNotFound { identifier: GridFsFileIdentifier },

    /// A write was attempted on a handle that was not opened for writing.
    #[error("File {filename:?} is not open for writing")]
    #[non_exhaustive]
    NotWritable { filename: Option<String> },

    /// The chunk at index `n` was missing while more data was expected.
    #[error("No chunk {n} found for file, possibly corrupt")]
    #[non_exhaustive]
    MissingChunk { n: u32 },

    /// The chunk at index `n` was the incorrect size.
    #[error("Chunk {n} holds {actual_size} bytes, expected {expected_size}")]
    #[non_exhaustive]
    WrongSizeChunk {
        actual_size: usize,
        expected_size: u32,
        n: u32,
    },

    /// A read or seek went past the end of the file.
    #[error("Requested {requested} bytes at position {position} of a {length} byte file")]
    #[non_exhaustive]
    OutOfBounds {
        position: u64,
        requested: u64,
        length: u64,
    },

    /// An operation was attempted on a stream that has already been ended.
    #[error("The stream has already been ended")]
    StreamEnded,
}

/// An identifier for a stored file.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum GridFsFileIdentifier {
    /// The name of the file. Not guaranteed to be unique.
    Filename(String),

    /// The file's unique [`Bson`] ID.
    Id(Bson),
}

impl fmt::Display for GridFsFileIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filename(name) => write!(f, "with name {name:?}"),
            Self::Id(id) => write!(f, "with id {id}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tailable_retry_classification() {
        let not_ready: Error = ErrorKind::CursorNotReady.into();
        assert!(not_ready.is_tailable_retry());

        let labeled: Error = ErrorKind::from(CommandError::new(96, "OperationFailed", "capped"))
            .into();
        assert!(!labeled.is_tailable_retry());
        assert!(labeled.with_label(TRANSIENT_TAILABLE_ERROR).is_tailable_retry());
    }

    #[test]
    fn killed_cursor_is_dead() {
        let killed: Error = ErrorKind::from(CommandError::new(237, "CursorKilled", "")).into();
        assert!(killed.is_cursor_dead());
        assert_eq!(killed.code(), Some(237));

        let other: Error = ErrorKind::from(CommandError::new(2, "BadValue", "")).into();
        assert!(!other.is_cursor_dead());
    }

    #[test]
    fn io_conversion_keeps_kind() {
        let error: Error = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        let io_error = error.into_futures_io_error();
        assert_eq!(io_error.kind(), std::io::ErrorKind::BrokenPipe);
    }
}
