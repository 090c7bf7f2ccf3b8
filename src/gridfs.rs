//! Files stored as a sequence of fixed-size chunks.
//!
//! A file is represented by one document in `<root>.files` holding its metadata and by
//! documents in `<root>.chunks`, each holding up to `chunkSize` bytes of content and keyed by
//! `(files_id, n)`. A [`GridStore`] presents the chunks as a single byte stream with a
//! read/write head.

mod chunk;
pub mod options;
mod stream;
#[cfg(test)]
mod test;

use std::{fmt, io::SeekFrom, str::FromStr};

use futures_util::future::{join_all, try_join_all};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::{
    bson::{doc, oid::ObjectId, Bson, DateTime, Document, Regex},
    concern::WriteConcern,
    cursor::{Cursor, CursorOptions},
    error::{Error, ErrorKind, GridFsErrorKind, GridFsFileIdentifier, Result},
    index::IndexModel,
    serde_util,
    store::Namespace,
    trace::{TracingRepresentation, FILE_TRACING_EVENT_TARGET},
    Database,
};
pub use chunk::Chunk;
use chunk::ChunkDocument;
use options::{GridStoreOptions, ListOptions, ReadFileOptions};
pub use stream::GridStoreStream;

/// The root used when none is given.
pub const DEFAULT_ROOT: &str = "fs";

/// 255 KiB
pub const DEFAULT_CHUNK_SIZE: u32 = 255 * 1024;

pub const DEFAULT_CONTENT_TYPE: &str = "binary/octet-stream";

/// A document in the files collection.
#[skip_serializing_none]
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct FilesCollectionDocument {
    /// The file's unique identifier.
    #[serde(rename = "_id")]
    pub id: Bson,

    /// The name of the file. Not required to be unique.
    pub filename: Option<String>,

    /// The MIME type of the file.
    #[serde(default = "default_content_type")]
    pub content_type: String,

    /// The length of the file in bytes, as of its last close.
    #[serde(serialize_with = "serde_util::serialize_u64_as_i64")]
    pub length: u64,

    /// The size in bytes of every chunk but the last.
    #[serde(serialize_with = "serde_util::serialize_u32_as_i32")]
    pub chunk_size: u32,

    /// When the file was first closed.
    pub upload_date: Option<DateTime>,

    pub aliases: Option<Vec<String>>,

    /// User data stored with the file.
    pub metadata: Option<Document>,

    /// The MD5 digest of the file's content, computed by the store when the file is closed.
    pub md5: Option<String>,
}

fn default_content_type() -> String {
    DEFAULT_CONTENT_TYPE.to_string()
}

impl FilesCollectionDocument {
    /// The number of bytes chunk `n` must hold for a file of this length.
    fn expected_chunk_length(&self, n: u32) -> u32 {
        let chunk_size = u64::from(self.chunk_size);
        let start = u64::from(n) * chunk_size;
        if start >= self.length {
            0
        } else {
            (self.length - start).min(chunk_size) as u32
        }
    }
}

fn check_chunk_size(file: &FilesCollectionDocument, chunk: &Chunk) -> Result<()> {
    let expected_size = file.expected_chunk_length(chunk.n());
    if chunk.len() != expected_size as usize {
        return Err(GridFsErrorKind::WrongSizeChunk {
            actual_size: chunk.len(),
            expected_size,
            n: chunk.n(),
        }
        .into());
    }
    Ok(())
}

/// How a [`GridStore`] locates its file.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum FileReference {
    /// By the `_id` of the metadata document.
    Id(Bson),

    /// By filename. If several files share the name, the first one found is used.
    Filename(String),
}

impl FileReference {
    fn filter(&self) -> Document {
        match self {
            Self::Id(id) => doc! { "_id": id.clone() },
            Self::Filename(filename) => doc! { "filename": filename.as_str() },
        }
    }

    fn identifier(&self) -> GridFsFileIdentifier {
        match self {
            Self::Id(id) => GridFsFileIdentifier::Id(id.clone()),
            Self::Filename(filename) => GridFsFileIdentifier::Filename(filename.clone()),
        }
    }
}

impl From<&str> for FileReference {
    fn from(filename: &str) -> Self {
        Self::Filename(filename.to_string())
    }
}

impl From<String> for FileReference {
    fn from(filename: String) -> Self {
        Self::Filename(filename)
    }
}

impl From<ObjectId> for FileReference {
    fn from(id: ObjectId) -> Self {
        Self::Id(id.into())
    }
}

impl From<Bson> for FileReference {
    fn from(id: Bson) -> Self {
        Self::Id(id)
    }
}

/// Selects files for [`GridStore::exist`].
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum FileSelector {
    Id(Bson),
    Filename(String),
    /// Filenames matching a regular expression.
    Pattern(Regex),
}

impl FileSelector {
    fn filter(&self) -> Document {
        match self {
            Self::Id(id) => doc! { "_id": id.clone() },
            Self::Filename(filename) => doc! { "filename": filename.as_str() },
            Self::Pattern(regex) => doc! { "filename": Bson::RegularExpression(regex.clone()) },
        }
    }
}

impl From<FileReference> for FileSelector {
    fn from(reference: FileReference) -> Self {
        match reference {
            FileReference::Id(id) => Self::Id(id),
            FileReference::Filename(filename) => Self::Filename(filename),
        }
    }
}

impl From<&str> for FileSelector {
    fn from(filename: &str) -> Self {
        Self::Filename(filename.to_string())
    }
}

impl From<String> for FileSelector {
    fn from(filename: String) -> Self {
        Self::Filename(filename)
    }
}

impl From<ObjectId> for FileSelector {
    fn from(id: ObjectId) -> Self {
        Self::Id(id.into())
    }
}

impl From<Regex> for FileSelector {
    fn from(regex: Regex) -> Self {
        Self::Pattern(regex)
    }
}

/// The mode a [`GridStore`] is opened in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// `"r"`: read an existing file.
    Read,
    /// `"w"`: replace the content of the file, creating it if needed.
    Truncate,
    /// `"w+"`: write after the end of the file, creating it if needed.
    Append,
}

impl OpenMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "r",
            Self::Truncate => "w",
            Self::Append => "w+",
        }
    }

    pub fn is_write(self) -> bool {
        !matches!(self, Self::Read)
    }
}

impl FromStr for OpenMode {
    type Err = Error;

    fn from_str(mode: &str) -> Result<Self> {
        match mode {
            "r" => Ok(Self::Read),
            "w" => Ok(Self::Truncate),
            "w+" => Ok(Self::Append),
            other => Err(invalid_mode(other)),
        }
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of [`GridStore::set_chunk_size`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkSizeUpdate {
    Applied,
    /// The chunk size is fixed: the handle is not open for writing, data has been written or
    /// positioned past, or the file has already been stored once.
    Ignored,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HandleState {
    Unopened,
    Opening,
    Open(OpenMode),
    Closed,
}

/// A handle to a file stored in chunks.
///
/// A handle is created for a file reference and a mode and does nothing until
/// [`open`](GridStore::open) is called. Write modes buffer the chunk under the head and store
/// every chunk that fills up; the metadata document is written when the handle is
/// [`close`](GridStore::close)d.
///
/// ```rust
/// # use std::{io::SeekFrom, sync::Arc};
/// # use gridstore::{error::Result, options::GridStoreOptions, Database, GridStore, MemoryStore};
/// # async fn example() -> Result<()> {
/// let db = Database::new(Arc::new(MemoryStore::new()), "files");
///
/// let options = GridStoreOptions::builder().chunk_size(4).build();
/// let mut file = GridStore::new(&db, "greeting.txt", "w", options)?;
/// file.open().await?;
/// file.write(b"hello world", true).await?;
///
/// let mut file = GridStore::new(&db, "greeting.txt", "r", None)?;
/// file.open().await?;
/// file.seek(SeekFrom::Start(6)).await?;
/// assert_eq!(file.read(Some(5)).await?, b"world");
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct GridStore {
    db: Database,
    reference: FileReference,
    mode: String,
    options: GridStoreOptions,
    root: String,
    write_concern: Option<WriteConcern>,
    state: HandleState,
    file: Option<FilesCollectionDocument>,
    position: u64,
    current_chunk: Option<Chunk>,
}

impl GridStore {
    /// Creates a handle for the file identified by `reference` in the given mode (`"r"`, `"w"`
    /// or `"w+"`). The mode is checked when the file is opened.
    ///
    /// Returns an error if the write concern in `options` is invalid or the chunk size is 0.
    pub fn new(
        db: &Database,
        reference: impl Into<FileReference>,
        mode: &str,
        options: impl Into<Option<GridStoreOptions>>,
    ) -> Result<Self> {
        let options = options.into().unwrap_or_default();
        if let Some(ref write_concern) = options.write_concern {
            write_concern.validate()?;
        }
        if options.chunk_size == Some(0) {
            return Err(Error::invalid_argument("chunk size must be at least 1 byte"));
        }

        let root = options
            .root
            .clone()
            .unwrap_or_else(|| DEFAULT_ROOT.to_string());
        let write_concern = options
            .write_concern
            .clone()
            .or_else(|| db.write_concern().cloned());

        Ok(Self {
            db: db.clone(),
            reference: reference.into(),
            mode: mode.to_string(),
            options,
            root,
            write_concern,
            state: HandleState::Unopened,
            file: None,
            position: 0,
            current_chunk: None,
        })
    }

    fn files_ns(&self) -> Namespace {
        self.db.namespace(&files_coll(&self.root))
    }

    fn chunks_ns(&self) -> Namespace {
        self.db.namespace(&chunks_coll(&self.root))
    }

    /// Opens the file.
    ///
    /// * `"r"` loads the metadata and the first chunk, failing with `FileNotFound` if the file
    ///   does not exist.
    /// * `"w"` removes the chunks of an existing file, keeping its id, or starts a new file.
    ///   The metadata document is replaced when the handle is closed.
    /// * `"w+"` positions the head at the end of an existing file, or starts a new one.
    ///
    /// Write modes create the `filename` index on the files collection and the unique
    /// `(files_id, n)` index on the chunks collection if they are missing.
    pub async fn open(&mut self) -> Result<()> {
        let mode: OpenMode = self.mode.parse()?;
        if let HandleState::Open(_) | HandleState::Opening = self.state {
            return Err(Error::invalid_argument("file is already open"));
        }

        let previous = self.state;
        self.state = HandleState::Opening;
        match self.open_with_mode(mode).await {
            Ok(()) => {
                self.state = HandleState::Open(mode);
                if let Some(ref file) = self.file {
                    tracing::debug!(
                        target: FILE_TRACING_EVENT_TARGET,
                        id = file.id.tracing_representation(),
                        filename = file.filename.as_deref(),
                        mode = mode.as_str(),
                        length = file.length,
                        "opened file",
                    );
                }
                Ok(())
            }
            Err(error) => {
                self.state = previous;
                Err(error)
            }
        }
    }

    async fn open_with_mode(&mut self, mode: OpenMode) -> Result<()> {
        if mode.is_write() {
            self.ensure_indexes().await?;
        }

        let options = &self.options;
        let (file, chunk, position) = match (mode, self.find_file().await?) {
            (OpenMode::Read, None) => {
                return Err(GridFsErrorKind::FileNotFound {
                    identifier: self.reference.identifier(),
                }
                .into())
            }
            (OpenMode::Read, Some(file)) => {
                check_stored_chunk_size(&file)?;
                let chunk = match self.load_chunk(&file.id, 0, file.chunk_size).await? {
                    Some(chunk) => {
                        check_chunk_size(&file, &chunk)?;
                        chunk
                    }
                    None => Chunk::new(file.id.clone(), 0, file.chunk_size),
                };
                (file, chunk, 0)
            }
            (OpenMode::Truncate, Some(existing)) => {
                self.delete_chunks(&existing.id).await?;
                let file = FilesCollectionDocument {
                    id: existing.id,
                    filename: existing.filename,
                    content_type: options
                        .content_type
                        .clone()
                        .unwrap_or(existing.content_type),
                    length: 0,
                    chunk_size: options.chunk_size.unwrap_or(existing.chunk_size),
                    upload_date: existing.upload_date,
                    aliases: options.aliases.clone().or(existing.aliases),
                    metadata: options.metadata.clone().or(existing.metadata),
                    md5: None,
                };
                check_stored_chunk_size(&file)?;
                let chunk = Chunk::new(file.id.clone(), 0, file.chunk_size);
                (file, chunk, 0)
            }
            (OpenMode::Append, Some(mut file)) => {
                check_stored_chunk_size(&file)?;
                if let Some(ref content_type) = options.content_type {
                    file.content_type = content_type.clone();
                }
                if options.aliases.is_some() {
                    file.aliases = options.aliases.clone();
                }
                if options.metadata.is_some() {
                    file.metadata = options.metadata.clone();
                }
                file.md5 = None;

                let chunk = if file.length == 0 {
                    Chunk::new(file.id.clone(), 0, file.chunk_size)
                } else {
                    let n = ((file.length - 1) / u64::from(file.chunk_size)) as u32;
                    let mut chunk = self
                        .load_chunk(&file.id, n, file.chunk_size)
                        .await?
                        .unwrap_or_else(|| Chunk::new(file.id.clone(), n, file.chunk_size));
                    chunk.set_position(chunk.len());
                    chunk
                };
                let position = file.length;
                (file, chunk, position)
            }
            (OpenMode::Truncate | OpenMode::Append, None) => {
                let (id, filename) = match self.reference {
                    FileReference::Id(ref id) => (id.clone(), options.filename.clone()),
                    FileReference::Filename(ref filename) => {
                        (Bson::ObjectId(ObjectId::new()), Some(filename.clone()))
                    }
                };
                let file = FilesCollectionDocument {
                    id,
                    filename,
                    content_type: options
                        .content_type
                        .clone()
                        .unwrap_or_else(default_content_type),
                    length: 0,
                    chunk_size: options.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
                    upload_date: None,
                    aliases: options.aliases.clone(),
                    metadata: options.metadata.clone(),
                    md5: None,
                };
                let chunk = Chunk::new(file.id.clone(), 0, file.chunk_size);
                (file, chunk, 0)
            }
        };

        self.file = Some(file);
        self.current_chunk = Some(chunk);
        self.position = position;
        Ok(())
    }

    async fn ensure_indexes(&self) -> Result<()> {
        let store = self.db.store();
        let indexes = [
            (
                self.files_ns(),
                IndexModel::builder().keys(doc! { "filename": 1 }).build(),
            ),
            (
                self.chunks_ns(),
                IndexModel::builder()
                    .keys(doc! { "files_id": 1, "n": 1 })
                    .unique(true)
                    .build(),
            ),
        ];

        for (ns, index) in indexes {
            // Indexes are equivalent regardless of numeric value type, e.g. { "n": 1 } and
            // { "n": 1.0 }.
            let existing = store.list_indexes(&ns).await?;
            if existing.iter().any(|model| model.has_keys(&index.keys)) {
                continue;
            }
            store
                .create_index(&ns, index, self.write_concern.as_ref())
                .await?;
        }
        Ok(())
    }

    async fn find_file(&self) -> Result<Option<FilesCollectionDocument>> {
        let document = self
            .db
            .find_one(&files_coll(&self.root), self.reference.filter())
            .await?;
        match document {
            Some(document) => Ok(Some(crate::bson::from_document(document)?)),
            None => Ok(None),
        }
    }

    async fn load_chunk(&self, files_id: &Bson, n: u32, chunk_size: u32) -> Result<Option<Chunk>> {
        let filter = doc! { "files_id": files_id.clone(), "n": i64::from(n) };
        let Some(document) = self.db.find_one(&chunks_coll(&self.root), filter).await? else {
            return Ok(None);
        };
        let document: ChunkDocument = crate::bson::from_document(document)?;
        tracing::trace!(
            target: FILE_TRACING_EVENT_TARGET,
            files_id = files_id.tracing_representation(),
            n,
            bytes = document.data.len(),
            "loaded chunk",
        );
        Ok(Some(Chunk::from_document(document, chunk_size)))
    }

    async fn delete_chunks(&self, files_id: &Bson) -> Result<u64> {
        let result = self
            .db
            .store()
            .delete_many(
                &self.chunks_ns(),
                doc! { "files_id": files_id.clone() },
                self.write_concern.as_ref(),
            )
            .await?;
        Ok(result.deleted_count)
    }

    fn open_file(&self) -> Result<&FilesCollectionDocument> {
        self.file
            .as_ref()
            .ok_or_else(|| Error::internal("file metadata missing on an open handle"))
    }

    fn open_mode(&self) -> Result<OpenMode> {
        match self.state {
            HandleState::Open(mode) => Ok(mode),
            _ => Err(invalid_mode(&self.mode)),
        }
    }

    fn check_writable(&self) -> Result<()> {
        match self.state {
            HandleState::Open(mode) if mode.is_write() => Ok(()),
            _ => Err(GridFsErrorKind::NotWritable {
                filename: self.filename().map(ToString::to_string),
            }
            .into()),
        }
    }

    /// Reads `length` bytes from the current position, or everything up to the end of the file
    /// when `length` is `None`.
    ///
    /// Returns an `OutOfBounds` error if fewer than `length` bytes remain, a `MissingChunk` or
    /// `WrongSizeChunk` error if the stored chunks do not add up to the file's length, and
    /// `FileNotFound` when reading the whole of an empty file. A failed read leaves the head
    /// where it was.
    pub async fn read(&mut self, length: Option<u64>) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.read_bytes(length, &mut buffer, false).await?;
        Ok(buffer)
    }

    /// Like [`read`](GridStore::read), but appends to `buffer` and returns the number of bytes
    /// read. Reading nothing from an empty file is not an error.
    pub async fn read_into(
        &mut self,
        buffer: &mut Vec<u8>,
        length: Option<u64>,
    ) -> Result<u64> {
        self.read_bytes(length, buffer, true).await
    }

    async fn read_bytes(
        &mut self,
        length: Option<u64>,
        out: &mut Vec<u8>,
        buffer_supplied: bool,
    ) -> Result<u64> {
        if self.open_mode()? != OpenMode::Read {
            return Err(invalid_mode(&self.mode));
        }
        let (files_id, file_length, chunk_size) = {
            let file = self.open_file()?;
            (file.id.clone(), file.length, file.chunk_size)
        };

        let remaining = file_length.saturating_sub(self.position);
        let length = length.unwrap_or(remaining);
        if length > remaining {
            return Err(GridFsErrorKind::OutOfBounds {
                position: self.position,
                requested: length,
                length: file_length,
            }
            .into());
        }
        if length == 0 {
            if file_length == 0 && !buffer_supplied {
                return Err(GridFsErrorKind::FileNotFound {
                    identifier: GridFsFileIdentifier::Id(files_id),
                }
                .into());
            }
            return Ok(0);
        }

        let start_offset = self
            .current_chunk
            .as_ref()
            .map(Chunk::position)
            .ok_or_else(|| Error::internal("no current chunk on an open handle"))?;
        let start_len = out.len();
        let mut displaced = None;

        let result = self
            .fill(&files_id, chunk_size, length as usize, out, &mut displaced)
            .await;
        if let Err(error) = result {
            out.truncate(start_len);
            if let Some(chunk) = displaced {
                self.current_chunk = Some(chunk);
            }
            if let Some(ref mut chunk) = self.current_chunk {
                chunk.set_position(start_offset);
            }
            return Err(error);
        }

        self.position += length;
        Ok(length)
    }

    /// Copies `needed` bytes from the head into `out`, loading chunks as it goes. The chunk
    /// that was under the head when the read started is moved into `displaced` once another
    /// chunk replaces it.
    async fn fill(
        &mut self,
        files_id: &Bson,
        chunk_size: u32,
        mut needed: usize,
        out: &mut Vec<u8>,
        displaced: &mut Option<Chunk>,
    ) -> Result<()> {
        out.reserve(needed);
        loop {
            let chunk = self
                .current_chunk
                .as_mut()
                .ok_or_else(|| Error::internal("no current chunk on an open handle"))?;
            let bytes = chunk.read_slice(needed);
            needed -= bytes.len();
            out.extend_from_slice(bytes);
            if needed == 0 {
                return Ok(());
            }
            // Stand-in for a chunk that was not found when it was loaded.
            if chunk.is_empty() {
                return Err(GridFsErrorKind::MissingChunk { n: chunk.n() }.into());
            }

            let next_n = chunk.n() + 1;
            let next = match self.load_chunk(files_id, next_n, chunk_size).await? {
                Some(next) if !next.is_empty() => {
                    check_chunk_size(self.open_file()?, &next)?;
                    next
                }
                _ => return Err(GridFsErrorKind::MissingChunk { n: next_n }.into()),
            };
            let previous = self.current_chunk.replace(next);
            if displaced.is_none() {
                *displaced = previous;
            }
        }
    }

    /// Reads a single byte, or `None` at the end of the file.
    pub async fn getc(&mut self) -> Result<Option<u8>> {
        if self.open_mode()? == OpenMode::Read && self.eof() {
            return Ok(None);
        }
        let byte = self.read(Some(1)).await?;
        Ok(byte.first().copied())
    }

    /// Reads the rest of the file as UTF-8 and splits it after every `separator`. Each line
    /// keeps its separator; trailing text with no separator after it is not returned.
    pub async fn readlines(&mut self, separator: &str) -> Result<Vec<String>> {
        if separator.is_empty() {
            return Err(Error::invalid_argument("separator must not be empty"));
        }
        if self.open_mode()? == OpenMode::Read && self.eof() {
            return Ok(Vec::new());
        }
        let bytes = self.read(None).await?;
        let text = String::from_utf8(bytes)
            .map_err(|e| Error::invalid_argument(format!("file is not valid UTF-8: {e}")))?;
        let mut lines: Vec<String> = text
            .split(separator)
            .map(|line| format!("{line}{separator}"))
            .collect();
        lines.pop();
        Ok(lines)
    }

    /// Writes `data` at the current position, closing the file afterwards if `close` is set.
    ///
    /// Every chunk filled by the write is stored before this returns; the chunk left under
    /// the head is stored when the head moves to another chunk or the file is closed. The
    /// position and length only advance once all stores have succeeded.
    pub async fn write(&mut self, data: impl AsRef<[u8]>, close: bool) -> Result<()> {
        let data = data.as_ref();
        self.check_writable()?;
        let (files_id, file_length, chunk_size) = {
            let file = self.open_file()?;
            (file.id.clone(), file.length, file.chunk_size)
        };
        let capacity = chunk_size as usize;

        let mut current = self
            .current_chunk
            .clone()
            .ok_or_else(|| Error::internal("no current chunk on an open handle"))?;

        let next = if current.position() + data.len() < capacity {
            current.write(data);
            current
        } else {
            let fill = capacity - current.position();
            current.write(&data[..fill]);
            let mut offset = fill;
            let mut n = current.n();
            let mut filled = vec![current];

            while data.len() - offset >= capacity {
                n += 1;
                let mut chunk = Chunk::new(files_id.clone(), n, chunk_size);
                chunk.write(&data[offset..offset + capacity]);
                filled.push(chunk);
                offset += capacity;
            }

            n += 1;
            let mut next = if u64::from(n) * u64::from(chunk_size) < file_length {
                self.load_chunk(&files_id, n, chunk_size)
                    .await?
                    .unwrap_or_else(|| Chunk::new(files_id.clone(), n, chunk_size))
            } else {
                Chunk::new(files_id.clone(), n, chunk_size)
            };
            next.write(&data[offset..]);

            let store = &**self.db.store();
            let chunks_ns = self.chunks_ns();
            try_join_all(
                filled
                    .iter()
                    .map(|chunk| chunk.save(store, &chunks_ns, self.write_concern.as_ref())),
            )
            .await?;
            next
        };

        self.current_chunk = Some(next);
        self.position += data.len() as u64;
        if let Some(ref mut file) = self.file {
            file.length = file.length.max(self.position);
        }

        if close {
            self.close().await?;
        }
        Ok(())
    }

    /// Moves the head. The target must lie within `[0, length]`.
    ///
    /// In write modes the chunk under the head is stored before another chunk is loaded.
    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let mode = self.open_mode()?;
        let (files_id, length, chunk_size) = {
            let file = self.open_file()?;
            (file.id.clone(), file.length, file.chunk_size)
        };

        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.position) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(length) + i128::from(delta),
        };
        if target < 0 {
            return Err(Error::invalid_argument(format!(
                "cannot seek to negative position {target}"
            )));
        }
        if target > i128::from(length) {
            return Err(GridFsErrorKind::OutOfBounds {
                position: u64::try_from(target).unwrap_or(u64::MAX),
                requested: 0,
                length,
            }
            .into());
        }
        let target = target as u64;

        let target_n = (target / u64::from(chunk_size)) as u32;
        if self.current_chunk.as_ref().map(Chunk::n) != Some(target_n) {
            if mode.is_write() {
                if let Some(ref chunk) = self.current_chunk {
                    if !chunk.is_empty() {
                        chunk
                            .save(
                                &**self.db.store(),
                                &self.chunks_ns(),
                                self.write_concern.as_ref(),
                            )
                            .await?;
                    }
                }
            }
            let chunk = match self.load_chunk(&files_id, target_n, chunk_size).await? {
                Some(chunk) => {
                    if !mode.is_write() {
                        check_chunk_size(self.open_file()?, &chunk)?;
                    }
                    chunk
                }
                None => Chunk::new(files_id, target_n, chunk_size),
            };
            self.current_chunk = Some(chunk);
        }

        if let Some(ref mut chunk) = self.current_chunk {
            chunk.set_position((target % u64::from(chunk_size)) as usize);
        }
        self.position = target;
        Ok(target)
    }

    /// Moves the head back to the start of the file. Away from the first chunk, write modes
    /// discard all stored chunks, the same way opening with `"w"` does.
    pub async fn rewind(&mut self) -> Result<()> {
        let mode = self.open_mode()?;
        let (files_id, chunk_size) = {
            let file = self.open_file()?;
            (file.id.clone(), file.chunk_size)
        };

        if self.current_chunk.as_ref().is_some_and(|chunk| chunk.n() == 0) {
            if let Some(ref mut chunk) = self.current_chunk {
                chunk.rewind();
            }
        } else if mode.is_write() {
            self.delete_chunks(&files_id).await?;
            if let Some(ref mut file) = self.file {
                file.length = 0;
            }
            self.current_chunk = Some(Chunk::new(files_id, 0, chunk_size));
        } else {
            let chunk = self
                .load_chunk(&files_id, 0, chunk_size)
                .await?
                .unwrap_or_else(|| Chunk::new(files_id.clone(), 0, chunk_size));
            self.current_chunk = Some(chunk);
        }

        self.position = 0;
        Ok(())
    }

    /// Closes the handle.
    ///
    /// In write modes this stores the chunk under the head (or an empty first chunk for an
    /// empty file), has the store compute the file's MD5 digest and upserts the metadata
    /// document. The upload date is only set the first time. Closing a read handle does
    /// nothing; closing a handle that is not open is an `InvalidMode` error.
    pub async fn close(&mut self) -> Result<()> {
        let mode = self.open_mode()?;
        if !mode.is_write() {
            self.state = HandleState::Closed;
            return Ok(());
        }

        let mut file = self.open_file()?.clone();
        let chunks_ns = self.chunks_ns();
        if let Some(ref chunk) = self.current_chunk {
            if !chunk.is_empty() || (file.length == 0 && chunk.n() == 0) {
                chunk
                    .save(&**self.db.store(), &chunks_ns, self.write_concern.as_ref())
                    .await?;
            }
        }

        let reply = self
            .db
            .run_command(doc! { "filemd5": file.id.clone(), "root": self.root.as_str() })
            .await?;
        file.md5 = reply.get_str("md5").ok().map(ToString::to_string);
        if file.upload_date.is_none() {
            file.upload_date = Some(DateTime::now());
        }

        self.db
            .store()
            .replace_one(
                &self.files_ns(),
                doc! { "_id": file.id.clone() },
                crate::bson::to_document(&file)?,
                true,
                self.write_concern.as_ref(),
            )
            .await?;

        tracing::debug!(
            target: FILE_TRACING_EVENT_TARGET,
            id = file.id.tracing_representation(),
            filename = file.filename.as_deref(),
            length = file.length,
            md5 = file.md5.as_deref(),
            "closed file",
        );
        self.file = Some(file);
        self.state = HandleState::Closed;
        Ok(())
    }

    /// Deletes the file's chunks and then its metadata document. This is not atomic: if the
    /// metadata cannot be removed the chunks are already gone.
    ///
    /// Returns `FileNotFound` if there was no metadata document to remove, unless the handle
    /// is open for writing and the file has simply not been closed yet. The handle is left
    /// unopened.
    pub async fn unlink(&mut self) -> Result<()> {
        let files_id = match self.file {
            Some(ref file) => file.id.clone(),
            None => match self.find_file().await? {
                Some(file) => file.id,
                None => {
                    return Err(GridFsErrorKind::FileNotFound {
                        identifier: self.reference.identifier(),
                    }
                    .into())
                }
            },
        };

        let chunks_deleted = self.delete_chunks(&files_id).await?;
        let result = self
            .db
            .store()
            .delete_many(
                &self.files_ns(),
                doc! { "_id": files_id.clone() },
                self.write_concern.as_ref(),
            )
            .await?;
        let open_for_write = matches!(self.state, HandleState::Open(mode) if mode.is_write());

        tracing::debug!(
            target: FILE_TRACING_EVENT_TARGET,
            id = files_id.tracing_representation(),
            chunks_deleted,
            "unlinked file",
        );
        self.state = HandleState::Unopened;
        self.file = None;
        self.current_chunk = None;
        self.position = 0;

        if result.deleted_count == 0 && !open_for_write {
            return Err(GridFsErrorKind::FileNotFound {
                identifier: GridFsFileIdentifier::Id(files_id),
            }
            .into());
        }
        Ok(())
    }

    /// Changes the chunk size of a file that is open for writing and has not been written to
    /// or stored yet.
    pub fn set_chunk_size(&mut self, chunk_size: u32) -> Result<ChunkSizeUpdate> {
        if chunk_size == 0 {
            return Err(Error::invalid_argument("chunk size must be at least 1 byte"));
        }
        let writable = matches!(self.state, HandleState::Open(mode) if mode.is_write());
        let Some(ref mut file) = self.file else {
            return Ok(ChunkSizeUpdate::Ignored);
        };
        if !writable || self.position != 0 || file.length != 0 || file.upload_date.is_some() {
            return Ok(ChunkSizeUpdate::Ignored);
        }

        file.chunk_size = chunk_size;
        self.current_chunk = Some(Chunk::new(file.id.clone(), 0, chunk_size));
        Ok(ChunkSizeUpdate::Applied)
    }

    /// Wraps this handle in an [`AsyncRead`](futures_io::AsyncRead) +
    /// [`AsyncWrite`](futures_io::AsyncWrite) stream.
    pub fn into_stream(self) -> GridStoreStream {
        GridStoreStream::new(self)
    }

    /// The file's id, once known.
    pub fn id(&self) -> Option<&Bson> {
        self.file.as_ref().map(|file| &file.id)
    }

    pub fn filename(&self) -> Option<&str> {
        match (&self.file, &self.reference) {
            (Some(file), _) => file.filename.as_deref(),
            (None, FileReference::Filename(filename)) => Some(filename.as_str()),
            (None, FileReference::Id(_)) => self.options.filename.as_deref(),
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.file.as_ref().map(|file| file.content_type.as_str())
    }

    /// The length of the file in bytes, including bytes written since it was opened.
    pub fn length(&self) -> u64 {
        self.file.as_ref().map_or(0, |file| file.length)
    }

    pub fn chunk_size(&self) -> u32 {
        match self.file {
            Some(ref file) => file.chunk_size,
            None => self.options.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
        }
    }

    pub fn upload_date(&self) -> Option<DateTime> {
        self.file.as_ref().and_then(|file| file.upload_date)
    }

    pub fn metadata(&self) -> Option<&Document> {
        self.file.as_ref().and_then(|file| file.metadata.as_ref())
    }

    pub fn aliases(&self) -> Option<&[String]> {
        self.file.as_ref().and_then(|file| file.aliases.as_deref())
    }

    /// The MD5 digest computed by the store at the last close.
    pub fn md5(&self) -> Option<&str> {
        self.file.as_ref().and_then(|file| file.md5.as_deref())
    }

    /// The metadata document as it will be stored.
    pub fn file_document(&self) -> Option<&FilesCollectionDocument> {
        self.file.as_ref()
    }

    /// The position of the head.
    pub fn tell(&self) -> u64 {
        self.position
    }

    pub fn eof(&self) -> bool {
        self.position >= self.length()
    }

    /// The mode this handle was created with.
    pub fn mode(&self) -> &str {
        &self.mode
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, HandleState::Open(_))
    }
}

// Operations that do not need a long-lived handle.
impl GridStore {
    /// Whether a file matching `selector` exists under `root`.
    pub async fn exist(
        db: &Database,
        selector: impl Into<FileSelector>,
        root: Option<&str>,
    ) -> Result<bool> {
        let coll = files_coll(root.unwrap_or(DEFAULT_ROOT));
        Ok(db.find_one(&coll, selector.into().filter()).await?.is_some())
    }

    /// The filenames of the files under a root. Files without a name are skipped.
    pub async fn list(
        db: &Database,
        options: impl Into<Option<ListOptions>>,
    ) -> Result<Vec<String>> {
        let documents = list_documents(db, options.into(), doc! { "filename": 1 }).await?;
        Ok(documents
            .iter()
            .filter_map(|document| document.get_str("filename").ok())
            .map(ToString::to_string)
            .collect())
    }

    /// The ids of the files under a root.
    pub async fn list_ids(
        db: &Database,
        options: impl Into<Option<ListOptions>>,
    ) -> Result<Vec<Bson>> {
        let documents = list_documents(db, options.into(), doc! { "_id": 1 }).await?;
        Ok(documents
            .into_iter()
            .filter_map(|mut document| document.remove("_id"))
            .collect())
    }

    /// Opens a file for reading, optionally seeks, reads and closes it.
    pub async fn read_file(
        db: &Database,
        reference: impl Into<FileReference>,
        options: impl Into<Option<ReadFileOptions>>,
    ) -> Result<Vec<u8>> {
        let options = options.into().unwrap_or_default();
        let mut file = open_for_read(db, reference.into(), &options).await?;
        let data = file.read(options.length).await;
        file.close().await?;
        data
    }

    /// Opens a file for reading, optionally seeks, reads the rest as lines and closes it.
    pub async fn readlines_file(
        db: &Database,
        reference: impl Into<FileReference>,
        separator: &str,
        options: impl Into<Option<ReadFileOptions>>,
    ) -> Result<Vec<String>> {
        let options = options.into().unwrap_or_default();
        let mut file = open_for_read(db, reference.into(), &options).await?;
        let lines = file.readlines(separator).await;
        file.close().await?;
        lines
    }

    /// Unlinks every referenced file concurrently and waits for all of them.
    ///
    /// A single failure is returned as is; several are collected into an
    /// [`ErrorKind::Multiple`] error.
    pub async fn unlink_all<R>(
        db: &Database,
        references: impl IntoIterator<Item = R>,
        root: Option<&str>,
    ) -> Result<()>
    where
        R: Into<FileReference>,
    {
        let options = GridStoreOptions::builder()
            .root(root.map(ToString::to_string))
            .build();
        let unlinks = references.into_iter().map(|reference| {
            let reference: FileReference = reference.into();
            let options = options.clone();
            async move {
                let mut file = GridStore::new(db, reference, "r", options)?;
                file.unlink().await
            }
        });

        let mut errors: Vec<Error> = join_all(unlinks)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ErrorKind::Multiple { errors }.into()),
        }
    }

    /// Changes the filename of the file with the given id.
    pub async fn rename(
        db: &Database,
        id: impl Into<Bson>,
        new_filename: &str,
        root: Option<&str>,
    ) -> Result<()> {
        let id = id.into();
        let ns = db.namespace(&files_coll(root.unwrap_or(DEFAULT_ROOT)));
        let result = db
            .store()
            .update_one(
                &ns,
                doc! { "_id": id.clone() },
                doc! { "$set": { "filename": new_filename } },
                db.write_concern(),
            )
            .await?;
        if result.matched_count == 0 {
            return Err(GridFsErrorKind::FileNotFound {
                identifier: GridFsFileIdentifier::Id(id),
            }
            .into());
        }
        Ok(())
    }

    /// Drops the files and chunks collections of a root.
    pub async fn drop_root(db: &Database, root: Option<&str>) -> Result<()> {
        let root = root.unwrap_or(DEFAULT_ROOT);
        let store = db.store();
        store
            .drop_collection(&db.namespace(&files_coll(root)), db.write_concern())
            .await?;
        store
            .drop_collection(&db.namespace(&chunks_coll(root)), db.write_concern())
            .await
    }

    /// A cursor over the metadata documents of a root matching `filter`.
    pub fn find(
        db: &Database,
        filter: Document,
        root: Option<&str>,
        options: impl Into<Option<CursorOptions>>,
    ) -> Cursor {
        db.find(&files_coll(root.unwrap_or(DEFAULT_ROOT)), filter, options)
    }
}

async fn open_for_read(
    db: &Database,
    reference: FileReference,
    options: &ReadFileOptions,
) -> Result<GridStore> {
    let open_options = GridStoreOptions::builder()
        .root(options.root.clone())
        .build();
    let mut file = GridStore::new(db, reference, "r", open_options)?;
    file.open().await?;
    if let Some(offset) = options.offset {
        file.seek(SeekFrom::Start(offset)).await?;
    }
    Ok(file)
}

async fn list_documents(
    db: &Database,
    options: Option<ListOptions>,
    projection: Document,
) -> Result<Vec<Document>> {
    let options = options.unwrap_or_default();
    let cursor_options = CursorOptions::builder()
        .projection(projection)
        .batch_size(options.batch_size)
        .build();
    let mut cursor = db.find(
        &files_coll(options.root.as_deref().unwrap_or(DEFAULT_ROOT)),
        options.filter.unwrap_or_default(),
        cursor_options,
    );

    let mut documents = Vec::new();
    cursor
        .each(|document| {
            if let Some(document) = document {
                documents.push(document);
            }
        })
        .await?;
    Ok(documents)
}

fn files_coll(root: &str) -> String {
    format!("{root}.files")
}

fn chunks_coll(root: &str) -> String {
    format!("{root}.chunks")
}

fn invalid_mode(mode: &str) -> Error {
    GridFsErrorKind::InvalidMode {
        mode: mode.to_string(),
    }
    .into()
}

fn check_stored_chunk_size(file: &FilesCollectionDocument) -> Result<()> {
    if file.chunk_size == 0 {
        return Err(Error::invalid_response(format!(
            "file {} has a chunk size of 0",
            file.id
        )));
    }
    Ok(())
}
