use serde::{Deserialize, Serialize};

use crate::{
    bson::{doc, Bson, Document},
    concern::WriteConcern,
    error::Result,
    serde_util,
    store::{DocumentStore, Namespace},
    trace::{TracingRepresentation, FILE_TRACING_EVENT_TARGET},
};

/// A document in the chunks collection.
#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct ChunkDocument {
    pub(crate) files_id: Bson,
    #[serde(serialize_with = "serde_util::serialize_u32_as_i32")]
    pub(crate) n: u32,
    #[serde(with = "serde_bytes")]
    pub(crate) data: Vec<u8>,
}

/// One slice of a file's content along with a cursor into it.
///
/// A chunk never grows past the chunk size of its file; splitting writes across chunks is left
/// to [`GridStore`](crate::GridStore).
#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    files_id: Bson,
    n: u32,
    chunk_size: u32,
    data: Vec<u8>,
    position: usize,
}

impl Chunk {
    /// An empty chunk `n` of the file `files_id`.
    pub fn new(files_id: Bson, n: u32, chunk_size: u32) -> Self {
        Self {
            files_id,
            n,
            chunk_size,
            data: Vec::new(),
            position: 0,
        }
    }

    pub(crate) fn from_document(document: ChunkDocument, chunk_size: u32) -> Self {
        Self {
            files_id: document.files_id,
            n: document.n,
            chunk_size,
            data: document.data,
            position: 0,
        }
    }

    /// The index of this chunk within its file.
    pub fn n(&self) -> u32 {
        self.n
    }

    pub fn files_id(&self) -> &Bson {
        &self.files_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The offset of the cursor within this chunk.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Moves the cursor, clamping it to the data held.
    pub fn set_position(&mut self, position: usize) {
        self.position = position.min(self.data.len());
    }

    /// The number of bytes that can still be written before the chunk is full.
    pub fn remaining_capacity(&self) -> usize {
        (self.chunk_size as usize).saturating_sub(self.position)
    }

    /// Writes `bytes` at the cursor, overwriting what is there and growing the chunk as needed.
    ///
    /// Callers must not write more than [`remaining_capacity`](Chunk::remaining_capacity)
    /// bytes.
    pub fn write(&mut self, bytes: &[u8]) {
        debug_assert!(
            bytes.len() <= self.remaining_capacity(),
            "chunk {} overflow: {} bytes at {} with chunk size {}",
            self.n,
            bytes.len(),
            self.position,
            self.chunk_size,
        );
        let end = self.position + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.position..end].copy_from_slice(bytes);
        self.position = end;
    }

    /// Returns up to `length` bytes from the cursor and advances past them.
    pub fn read_slice(&mut self, length: usize) -> &[u8] {
        let start = self.position;
        let end = start.saturating_add(length).min(self.data.len());
        self.position = end;
        &self.data[start..end]
    }

    /// Whether the cursor is at the end of the data.
    pub fn eof(&self) -> bool {
        self.position >= self.data.len()
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    pub(crate) fn to_document(&self) -> Result<Document> {
        let document = ChunkDocument {
            files_id: self.files_id.clone(),
            n: self.n,
            data: self.data.clone(),
        };
        Ok(crate::bson::to_document(&document)?)
    }

    /// Upserts this chunk keyed by `(files_id, n)`.
    pub(crate) async fn save(
        &self,
        store: &dyn DocumentStore,
        ns: &Namespace,
        write_concern: Option<&WriteConcern>,
    ) -> Result<()> {
        let filter = doc! { "files_id": self.files_id.clone(), "n": self.n as i64 };
        store
            .replace_one(ns, filter, self.to_document()?, true, write_concern)
            .await?;
        tracing::trace!(
            target: FILE_TRACING_EVENT_TARGET,
            files_id = self.files_id.tracing_representation(),
            n = self.n,
            bytes = self.data.len(),
            "saved chunk",
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn write_read_and_overwrite() {
        let mut chunk = Chunk::new(Bson::Int32(1), 0, 8);
        chunk.write(b"hello");
        assert_eq!(chunk.remaining_capacity(), 3);
        assert!(chunk.eof());

        chunk.rewind();
        assert_eq!(chunk.read_slice(2), b"he");
        assert_eq!(chunk.read_slice(10), b"llo");
        assert!(chunk.eof());

        chunk.set_position(1);
        chunk.write(b"ELLO, ");
        assert_eq!(chunk.data(), b"hELLO, ");
        assert_eq!(chunk.position(), 7);
    }

    #[test]
    fn set_position_clamps() {
        let mut chunk = Chunk::new(Bson::Int32(1), 0, 8);
        chunk.write(b"abc");
        chunk.set_position(6);
        assert_eq!(chunk.position(), 3);
    }

    #[test]
    fn document_shape() {
        let mut chunk = Chunk::new(Bson::String("id".into()), 2, 4);
        chunk.write(b"ab");
        let document = chunk.to_document().unwrap();
        assert_eq!(document.get_str("files_id"), Ok("id"));
        assert_eq!(document.get_i32("n"), Ok(2));
        assert_eq!(document.get_binary_generic("data").unwrap(), &b"ab".to_vec());

        let parsed: ChunkDocument = crate::bson::from_document(document).unwrap();
        let parsed = Chunk::from_document(parsed, 4);
        assert_eq!(parsed.data(), b"ab");
        assert_eq!(parsed.n(), 2);
    }
}
